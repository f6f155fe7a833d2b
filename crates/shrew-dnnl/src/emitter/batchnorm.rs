//! Batch normalization kernels.
//!
//! The forward kernel has two operand contracts selected by
//! `(training, use_global_stats)`:
//!
//! | mode                              | dependencies                               |
//! |-----------------------------------|--------------------------------------------|
//! | training, batch statistics        | `[src, weights, dst, mean, variance]`      |
//! | inference, or global statistics   | `[src, mean, variance, weights, dst]`      |
//!
//! In the first mode mean and variance are outputs computed from the batch;
//! in the second they are inputs.

use crate::attr::PrimitiveAttr;
use crate::engine::{expect, expect_rank, expect_types, Engine, PropKind};
use crate::error::{BackendError, Result};
use crate::memory::{DataType, MemoryDesc, MemoryFormat};
use crate::primitive::{Kernel, KernelDesc, PrimitiveHandle};

use super::conv::adopt_same_type;
use super::{construct, Emitter};

const BN_FORWARD: &str = "batch normalization forward";
const BN_BACKWARD: &str = "batch normalization backward";

/// Batch normalization flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchNormFlags {
    /// Mean and variance are supplied instead of computed.
    pub use_global_stats: bool,
    /// A `[2, C]` scale/shift operand is applied.
    pub use_scale_shift: bool,
}

impl BatchNormFlags {
    pub const GLOBAL_STATS: u32 = 0x1;
    pub const SCALE_SHIFT: u32 = 0x2;

    pub fn from_bits(bits: u32) -> Self {
        BatchNormFlags {
            use_global_stats: bits & Self::GLOBAL_STATS != 0,
            use_scale_shift: bits & Self::SCALE_SHIFT != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.use_global_stats {
            bits |= Self::GLOBAL_STATS;
        }
        if self.use_scale_shift {
            bits |= Self::SCALE_SHIFT;
        }
        bits
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormForwardDesc {
    pub prop_kind: PropKind,
    pub data: MemoryDesc,
    pub epsilon: f32,
    pub flags: BatchNormFlags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormForwardPd {
    pub prop_kind: PropKind,
    pub epsilon: f32,
    pub flags: BatchNormFlags,
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
    pub mean: MemoryDesc,
    pub variance: MemoryDesc,
    pub weights: Option<MemoryDesc>,
}

impl BatchNormForwardPd {
    /// Whether mean and variance are computed by this kernel.
    pub fn computes_stats(&self) -> bool {
        self.prop_kind == PropKind::ForwardTraining && !self.flags.use_global_stats
    }
}

fn stats_desc(channels: usize) -> std::result::Result<MemoryDesc, BackendError> {
    MemoryDesc::new(vec![channels], DataType::F32, MemoryFormat::X)
        .map_err(|e| BackendError::invalid(e.to_string()))
}

fn scale_shift_desc(channels: usize) -> std::result::Result<MemoryDesc, BackendError> {
    MemoryDesc::new(vec![2, channels], DataType::F32, MemoryFormat::Nc)
        .map_err(|e| BackendError::invalid(e.to_string()))
}

impl BatchNormForwardDesc {
    pub fn new(prop_kind: PropKind, data: MemoryDesc, epsilon: f32, flags: BatchNormFlags) -> Self {
        BatchNormForwardDesc {
            prop_kind,
            data,
            epsilon,
            flags,
        }
    }

    pub(crate) fn resolve(&self, engine: &Engine) -> std::result::Result<BatchNormForwardPd, BackendError> {
        expect_rank("data", &self.data, &[2, 4, 5])?;
        expect_types("data", &self.data, &[DataType::F32])?;
        expect(self.epsilon.is_finite() && self.epsilon > 0.0, || {
            format!("epsilon must be positive, got {}", self.epsilon)
        })?;
        let src = engine.resolve_data(&self.data, None)?;
        let channels = src.dims()[1];
        let weights = if self.flags.use_scale_shift {
            Some(scale_shift_desc(channels)?)
        } else {
            None
        };
        Ok(BatchNormForwardPd {
            prop_kind: self.prop_kind,
            epsilon: self.epsilon,
            flags: self.flags,
            dst: src.clone(),
            src,
            mean: stats_desc(channels)?,
            variance: stats_desc(channels)?,
            weights,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormBackwardDesc {
    pub data: MemoryDesc,
    pub diff_data: MemoryDesc,
    pub epsilon: f32,
    pub flags: BatchNormFlags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormBackwardPd {
    pub epsilon: f32,
    pub flags: BatchNormFlags,
    pub src: MemoryDesc,
    pub mean: MemoryDesc,
    pub variance: MemoryDesc,
    pub diff_dst: MemoryDesc,
    pub weights: MemoryDesc,
    pub diff_src: MemoryDesc,
    pub diff_weights: MemoryDesc,
    pub hint: Box<BatchNormForwardPd>,
}

impl BatchNormBackwardDesc {
    pub fn new(data: MemoryDesc, diff_data: MemoryDesc, epsilon: f32) -> Self {
        BatchNormBackwardDesc {
            data,
            diff_data,
            epsilon,
            flags: BatchNormFlags {
                use_global_stats: false,
                use_scale_shift: true,
            },
        }
    }

    pub(crate) fn resolve(&self, engine: &Engine) -> std::result::Result<BatchNormBackwardPd, BackendError> {
        expect(self.flags.use_scale_shift, || {
            "batch normalization backward requires scale/shift".to_string()
        })?;
        expect_types("diff_data", &self.diff_data, &[DataType::F32])?;
        let hint = BatchNormForwardDesc::new(
            PropKind::ForwardTraining,
            self.data.clone(),
            self.epsilon,
            self.flags,
        )
        .resolve(engine)?;
        let weights = hint
            .weights
            .clone()
            .ok_or_else(|| BackendError::invalid("forward hint has no scale/shift"))?;
        let diff_dst = adopt_same_type(&self.diff_data, &hint.dst)?;
        Ok(BatchNormBackwardPd {
            epsilon: self.epsilon,
            flags: self.flags,
            src: hint.src.clone(),
            mean: hint.mean.clone(),
            variance: hint.variance.clone(),
            diff_src: diff_dst.clone(),
            diff_dst,
            diff_weights: weights.clone(),
            weights,
            hint: Box::new(hint),
        })
    }
}

impl Emitter {
    /// Batch normalization forward; see the module docs for the two
    /// dependency layouts. `attr` carries fused post-ops.
    #[allow(clippy::too_many_arguments)]
    pub fn build_batchnorm_forward(
        &mut self,
        src: &MemoryDesc,
        weights: &MemoryDesc,
        dst: &MemoryDesc,
        mean: &MemoryDesc,
        variance: &MemoryDesc,
        epsilon: f32,
        use_global_stats: bool,
        training: bool,
        attr: &PrimitiveAttr,
    ) -> Result<PrimitiveHandle> {
        let prop_kind = if training {
            PropKind::ForwardTraining
        } else {
            PropKind::ForwardInference
        };
        let desc = BatchNormForwardDesc::new(
            prop_kind,
            src.clone(),
            epsilon,
            BatchNormFlags {
                use_global_stats,
                use_scale_shift: true,
            },
        );
        let mut pd = self.resolve_batchnorm_forward(&desc, weights, attr)?;
        pd.dst = construct(BN_FORWARD, adopt_same_type(dst, &pd.dst))?;
        pd.mean = construct(BN_FORWARD, adopt_same_type(mean, &pd.mean))?;
        pd.variance = construct(BN_FORWARD, adopt_same_type(variance, &pd.variance))?;
        let handle = self.reserve_primitive_space(6, false)?;
        self.install_batchnorm_forward(pd, attr, handle)?;
        Ok(handle)
    }

    /// Rebuild a reserved batch normalization forward slot. The statistics
    /// mode comes from `desc.flags` and `desc.prop_kind`.
    pub fn rebuild_batchnorm_forward(
        &mut self,
        desc: &BatchNormForwardDesc,
        weights: &MemoryDesc,
        attr: &PrimitiveAttr,
        handle: PrimitiveHandle,
    ) -> Result<()> {
        let pd = self.resolve_batchnorm_forward(desc, weights, attr)?;
        self.install_batchnorm_forward(pd, attr, handle)
    }

    fn resolve_batchnorm_forward(
        &self,
        desc: &BatchNormForwardDesc,
        weights: &MemoryDesc,
        attr: &PrimitiveAttr,
    ) -> Result<BatchNormForwardPd> {
        let mut pd = construct(BN_FORWARD, desc.resolve(&self.engine))?;
        construct(BN_FORWARD, attr.validate(pd.dst.dims()))?;
        if let Some(expected) = &pd.weights {
            pd.weights = Some(construct(BN_FORWARD, adopt_same_type(weights, expected))?);
        }
        Ok(pd)
    }

    fn install_batchnorm_forward(
        &mut self,
        pd: BatchNormForwardPd,
        attr: &PrimitiveAttr,
        handle: PrimitiveHandle,
    ) -> Result<()> {
        let weights_desc = pd.weights.clone().ok_or_else(|| {
            crate::Error::Unsupported("batch normalization forward without scale/shift".into())
        })?;
        let deps = self.install_deps(handle, 5)?;
        let args = if pd.computes_stats() {
            let src = self.place_memory(&deps, handle, 0, &pd.src)?;
            let weights = self.place_memory(&deps, handle, 1, &weights_desc)?;
            let dst = self.place_memory(&deps, handle, 2, &pd.dst)?;
            let mean = self.place_memory(&deps, handle, 3, &pd.mean)?;
            let variance = self.place_memory(&deps, handle, 4, &pd.variance)?;
            vec![src, weights, dst, mean, variance]
        } else {
            let src = self.place_memory(&deps, handle, 0, &pd.src)?;
            let mean = self.place_memory(&deps, handle, 1, &pd.mean)?;
            let variance = self.place_memory(&deps, handle, 2, &pd.variance)?;
            let weights = self.place_memory(&deps, handle, 3, &weights_desc)?;
            let dst = self.place_memory(&deps, handle, 4, &pd.dst)?;
            vec![src, mean, variance, weights, dst]
        };
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::BatchNormForward(pd),
                attr: attr.clone(),
                args,
            },
        )
    }

    /// Batch normalization backward. Dependencies: `[weights, src, mean,
    /// variance, diff_dst, diff_src, diff_weights]`.
    #[allow(clippy::too_many_arguments)]
    pub fn build_batchnorm_backward(
        &mut self,
        weights: &MemoryDesc,
        src: &MemoryDesc,
        mean: &MemoryDesc,
        variance: &MemoryDesc,
        diff_dst: &MemoryDesc,
        diff_src: &MemoryDesc,
        diff_weights: &MemoryDesc,
        epsilon: f32,
    ) -> Result<PrimitiveHandle> {
        let desc = BatchNormBackwardDesc::new(src.clone(), diff_dst.clone(), epsilon);
        let mut pd = self.resolve_batchnorm_backward(&desc, weights, diff_weights)?;
        pd.mean = construct(BN_BACKWARD, adopt_same_type(mean, &pd.mean))?;
        pd.variance = construct(BN_BACKWARD, adopt_same_type(variance, &pd.variance))?;
        pd.diff_src = construct(BN_BACKWARD, adopt_same_type(diff_src, &pd.diff_src))?;
        let handle = self.reserve_primitive_space(8, false)?;
        self.install_batchnorm_backward(pd, handle)?;
        Ok(handle)
    }

    pub fn rebuild_batchnorm_backward(
        &mut self,
        desc: &BatchNormBackwardDesc,
        weights: &MemoryDesc,
        diff_weights: &MemoryDesc,
        handle: PrimitiveHandle,
    ) -> Result<()> {
        let pd = self.resolve_batchnorm_backward(desc, weights, diff_weights)?;
        self.install_batchnorm_backward(pd, handle)
    }

    fn resolve_batchnorm_backward(
        &self,
        desc: &BatchNormBackwardDesc,
        weights: &MemoryDesc,
        diff_weights: &MemoryDesc,
    ) -> Result<BatchNormBackwardPd> {
        let mut pd = construct(BN_BACKWARD, desc.resolve(&self.engine))?;
        pd.weights = construct(BN_BACKWARD, adopt_same_type(weights, &pd.weights))?;
        pd.diff_weights = construct(BN_BACKWARD, adopt_same_type(diff_weights, &pd.diff_weights))?;
        Ok(pd)
    }

    fn install_batchnorm_backward(&mut self, pd: BatchNormBackwardPd, handle: PrimitiveHandle) -> Result<()> {
        let deps = self.install_deps(handle, 7)?;
        let weights = self.place_memory(&deps, handle, 0, &pd.weights)?;
        let src = self.place_memory(&deps, handle, 1, &pd.src)?;
        let mean = self.place_memory(&deps, handle, 2, &pd.mean)?;
        let variance = self.place_memory(&deps, handle, 3, &pd.variance)?;
        let diff_dst = self.place_memory(&deps, handle, 4, &pd.diff_dst)?;
        let diff_src = self.place_memory(&deps, handle, 5, &pd.diff_src)?;
        let diff_weights = self.place_memory(&deps, handle, 6, &pd.diff_weights)?;
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::BatchNormBackward(pd),
                attr: PrimitiveAttr::default(),
                args: vec![src, mean, variance, diff_dst, weights, diff_src, diff_weights],
            },
        )
    }
}
