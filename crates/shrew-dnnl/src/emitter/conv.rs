//! Convolution kernels: forward (float and quantized), backward data and
//! backward weights.
//!
//! Backward kernels are always resolved against the forward descriptor the
//! same operands would produce, which is never executed but fixes the layouts
//! and algorithm the backward pass must agree with.

use crate::attr::{PostOps, PrimitiveAttr};
use crate::engine::{
    expect, expect_dims, expect_rank, expect_types, window_output, ConvAlgorithm, Engine, PropKind,
};
use crate::error::{BackendError, Result};
use crate::memory::{DataType, MemoryDesc, MemoryFormat};
use crate::primitive::{Kernel, KernelDesc, PrimitiveHandle};

use super::{construct, Emitter};

const CONV_FORWARD: &str = "convolution forward";
const CONV_BACKWARD_DATA: &str = "convolution backward data";
const CONV_BACKWARD_WEIGHTS: &str = "convolution backward weights";

/// Spatial geometry of a convolution. Dilation 1 means no dilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvGeometry {
    pub strides: Vec<usize>,
    pub dilation: Vec<usize>,
    pub padding_below: Vec<usize>,
    pub padding_above: Vec<usize>,
}

impl ConvGeometry {
    pub fn new(
        strides: Vec<usize>,
        dilation: Vec<usize>,
        padding_below: Vec<usize>,
        padding_above: Vec<usize>,
    ) -> Self {
        ConvGeometry {
            strides,
            dilation,
            padding_below,
            padding_above,
        }
    }

    /// Stride 1, no dilation, no padding over `spatial` dimensions.
    pub fn unit(spatial: usize) -> Self {
        ConvGeometry::new(
            vec![1; spatial],
            vec![1; spatial],
            vec![0; spatial],
            vec![0; spatial],
        )
    }

    fn check(&self, spatial: usize) -> std::result::Result<(), BackendError> {
        for (name, v) in [
            ("strides", &self.strides),
            ("dilation", &self.dilation),
            ("padding_below", &self.padding_below),
            ("padding_above", &self.padding_above),
        ] {
            expect(v.len() == spatial, || {
                format!("{} has {} entries for {} spatial dims", name, v.len(), spatial)
            })?;
        }
        Ok(())
    }
}

// Forward

/// Convolution forward descriptor; any operand may use the `Any` layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionForwardDesc {
    pub prop_kind: PropKind,
    pub src: MemoryDesc,
    pub weights: MemoryDesc,
    pub bias: Option<MemoryDesc>,
    pub dst: MemoryDesc,
    pub geometry: ConvGeometry,
}

/// Resolved convolution forward kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionForwardPd {
    pub prop_kind: PropKind,
    pub algorithm: ConvAlgorithm,
    pub src: MemoryDesc,
    pub weights: MemoryDesc,
    pub bias: Option<MemoryDesc>,
    pub dst: MemoryDesc,
    pub geometry: ConvGeometry,
}

impl ConvolutionForwardDesc {
    pub fn new(
        src: MemoryDesc,
        weights: MemoryDesc,
        bias: Option<MemoryDesc>,
        dst: MemoryDesc,
        geometry: ConvGeometry,
    ) -> Self {
        ConvolutionForwardDesc {
            prop_kind: PropKind::ForwardTraining,
            src,
            weights,
            bias,
            dst,
            geometry,
        }
    }

    fn check_types(&self) -> std::result::Result<(), BackendError> {
        if self.src.data_type() == DataType::F32 {
            expect_types("weights", &self.weights, &[DataType::F32])?;
            expect_types("dst", &self.dst, &[DataType::F32])?;
            if let Some(bias) = &self.bias {
                expect_types("bias", bias, &[DataType::F32])?;
            }
            return Ok(());
        }
        expect_types("src", &self.src, &[DataType::U8, DataType::S8])?;
        expect_types("weights", &self.weights, &[DataType::S8])?;
        let any_int = [DataType::F32, DataType::S32, DataType::S8, DataType::U8];
        expect_types("dst", &self.dst, &any_int)?;
        if let Some(bias) = &self.bias {
            expect_types("bias", bias, &any_int)?;
        }
        Ok(())
    }

    pub(crate) fn resolve(
        &self,
        engine: &Engine,
        attr: &PrimitiveAttr,
    ) -> std::result::Result<ConvolutionForwardPd, BackendError> {
        expect_rank("src", &self.src, &[3, 4, 5])?;
        let rank = self.src.ndims();
        expect_rank("dst", &self.dst, &[rank])?;
        expect_rank("weights", &self.weights, &[rank, rank + 1])?;
        let spatial = rank - 2;
        self.geometry.check(spatial)?;
        self.check_types()?;

        let grouped = self.weights.ndims() == rank + 1;
        let w = self.weights.dims();
        let (groups, wofs) = if grouped { (w[0], 1) } else { (1, 0) };
        let out_channels = w[wofs] * groups;
        let in_channels = w[wofs + 1] * groups;
        let src = self.src.dims();
        let dst = self.dst.dims();
        expect(src[1] == in_channels, || {
            format!("src has {} channels, weights expect {}", src[1], in_channels)
        })?;
        expect(dst[0] == src[0], || {
            format!("dst batch {} differs from src batch {}", dst[0], src[0])
        })?;
        expect(dst[1] == out_channels, || {
            format!("dst has {} channels, weights produce {}", dst[1], out_channels)
        })?;
        if let Some(bias) = &self.bias {
            expect_dims("bias", bias, &[out_channels])?;
        }
        for i in 0..spatial {
            let g = &self.geometry;
            let out = window_output(
                src[2 + i],
                w[wofs + 2 + i],
                g.strides[i],
                g.dilation[i],
                g.padding_below[i],
                g.padding_above[i],
            );
            expect(out == Some(dst[2 + i]), || {
                format!(
                    "spatial dim {}: dst extent {} does not match computed {:?}",
                    i,
                    dst[2 + i],
                    out
                )
            })?;
        }
        attr.validate(dst)?;

        let src = engine.resolve_data(&self.src, Some(&self.dst))?;
        let dst = engine.resolve_data(&self.dst, Some(&src))?;
        let weights = engine.resolve_weights(&self.weights, &src)?;
        let bias = match &self.bias {
            Some(b) => Some(engine.resolve_fixed(b, MemoryFormat::X)?),
            None => None,
        };
        Ok(ConvolutionForwardPd {
            prop_kind: self.prop_kind,
            algorithm: engine.convolution_algorithm(),
            src,
            weights,
            bias,
            dst,
            geometry: self.geometry.clone(),
        })
    }
}

// Backward data

/// Convolution backward-data descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionBackwardDataDesc {
    pub diff_src: MemoryDesc,
    pub weights: MemoryDesc,
    pub diff_dst: MemoryDesc,
    pub geometry: ConvGeometry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionBackwardDataPd {
    pub algorithm: ConvAlgorithm,
    pub diff_src: MemoryDesc,
    pub weights: MemoryDesc,
    pub diff_dst: MemoryDesc,
    pub geometry: ConvGeometry,
    /// Forward descriptor the backward pass was checked against.
    pub hint: Box<ConvolutionForwardPd>,
}

impl ConvolutionBackwardDataDesc {
    pub fn new(
        diff_src: MemoryDesc,
        weights: MemoryDesc,
        diff_dst: MemoryDesc,
        geometry: ConvGeometry,
    ) -> Self {
        ConvolutionBackwardDataDesc {
            diff_src,
            weights,
            diff_dst,
            geometry,
        }
    }

    pub(crate) fn resolve(
        &self,
        engine: &Engine,
    ) -> std::result::Result<ConvolutionBackwardDataPd, BackendError> {
        for (name, d) in [
            ("diff_src", &self.diff_src),
            ("weights", &self.weights),
            ("diff_dst", &self.diff_dst),
        ] {
            expect_types(name, d, &[DataType::F32])?;
        }
        let hint = ConvolutionForwardDesc::new(
            self.diff_src.clone(),
            self.weights.clone(),
            None,
            self.diff_dst.clone(),
            self.geometry.clone(),
        )
        .resolve(engine, &PrimitiveAttr::default())?;
        Ok(ConvolutionBackwardDataPd {
            algorithm: hint.algorithm,
            diff_src: adopt(&self.diff_src, &hint.src)?,
            weights: adopt(&self.weights, &hint.weights)?,
            diff_dst: adopt(&self.diff_dst, &hint.dst)?,
            geometry: self.geometry.clone(),
            hint: Box::new(hint),
        })
    }
}

// Backward weights

/// Convolution backward-weights descriptor, with or without a bias gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionBackwardWeightsDesc {
    pub src: MemoryDesc,
    pub diff_weights: MemoryDesc,
    pub diff_bias: Option<MemoryDesc>,
    pub diff_dst: MemoryDesc,
    pub geometry: ConvGeometry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionBackwardWeightsPd {
    pub algorithm: ConvAlgorithm,
    pub src: MemoryDesc,
    pub diff_weights: MemoryDesc,
    pub diff_bias: Option<MemoryDesc>,
    pub diff_dst: MemoryDesc,
    pub geometry: ConvGeometry,
    pub hint: Box<ConvolutionForwardPd>,
}

impl ConvolutionBackwardWeightsDesc {
    pub fn new(
        src: MemoryDesc,
        diff_weights: MemoryDesc,
        diff_bias: Option<MemoryDesc>,
        diff_dst: MemoryDesc,
        geometry: ConvGeometry,
    ) -> Self {
        ConvolutionBackwardWeightsDesc {
            src,
            diff_weights,
            diff_bias,
            diff_dst,
            geometry,
        }
    }

    pub(crate) fn resolve(
        &self,
        engine: &Engine,
    ) -> std::result::Result<ConvolutionBackwardWeightsPd, BackendError> {
        for (name, d) in [
            ("src", &self.src),
            ("diff_weights", &self.diff_weights),
            ("diff_dst", &self.diff_dst),
        ] {
            expect_types(name, d, &[DataType::F32])?;
        }
        let hint = ConvolutionForwardDesc::new(
            self.src.clone(),
            self.diff_weights.clone(),
            self.diff_bias.clone(),
            self.diff_dst.clone(),
            self.geometry.clone(),
        )
        .resolve(engine, &PrimitiveAttr::default())?;
        let diff_bias = match (&self.diff_bias, &hint.bias) {
            (Some(b), Some(hb)) => Some(adopt(b, hb)?),
            _ => None,
        };
        Ok(ConvolutionBackwardWeightsPd {
            algorithm: hint.algorithm,
            src: adopt(&self.src, &hint.src)?,
            diff_weights: adopt(&self.diff_weights, &hint.weights)?,
            diff_bias,
            diff_dst: adopt(&self.diff_dst, &hint.dst)?,
            geometry: self.geometry.clone(),
            hint: Box::new(hint),
        })
    }
}

/// A backward operand takes the forward hint's layout when left to the
/// engine, and must match the hint's dims either way.
pub(crate) fn adopt(
    desc: &MemoryDesc,
    hint: &MemoryDesc,
) -> std::result::Result<MemoryDesc, BackendError> {
    expect(desc.dims() == hint.dims(), || {
        format!(
            "operand dims {:?} are inconsistent with forward hint {:?}",
            desc.dims(),
            hint.dims()
        )
    })?;
    if desc.is_any() {
        Ok(hint.with_data_type(desc.data_type()))
    } else {
        Ok(desc.clone())
    }
}

/// [`adopt`] for operands that must also share the hint's element type.
pub(crate) fn adopt_same_type(
    desc: &MemoryDesc,
    hint: &MemoryDesc,
) -> std::result::Result<MemoryDesc, BackendError> {
    expect(desc.data_type() == hint.data_type(), || {
        format!(
            "operand type {} differs from {}",
            desc.data_type(),
            hint.data_type()
        )
    })?;
    adopt(desc, hint)
}

impl Emitter {
    /// Convolution forward. Dependencies: `[src, weights, dst]`, or
    /// `[src, weights, bias, dst]` with a bias.
    pub fn build_convolution_forward(
        &mut self,
        src: &MemoryDesc,
        weights: &MemoryDesc,
        bias: Option<&MemoryDesc>,
        dst: &MemoryDesc,
        geometry: &ConvGeometry,
        attr: &PrimitiveAttr,
    ) -> Result<PrimitiveHandle> {
        let desc = ConvolutionForwardDesc::new(
            src.clone(),
            weights.clone(),
            bias.cloned(),
            dst.clone(),
            geometry.clone(),
        );
        let pd = construct(CONV_FORWARD, desc.resolve(&self.engine, attr))?;
        let handle = self.convolution_forward_init(pd.bias.is_some())?;
        self.install_convolution_forward(pd, attr, handle)?;
        Ok(handle)
    }

    pub fn rebuild_convolution_forward(
        &mut self,
        desc: &ConvolutionForwardDesc,
        attr: &PrimitiveAttr,
        handle: PrimitiveHandle,
    ) -> Result<()> {
        let pd = construct(CONV_FORWARD, desc.resolve(&self.engine, attr))?;
        self.install_convolution_forward(pd, attr, handle)
    }

    fn install_convolution_forward(
        &mut self,
        pd: ConvolutionForwardPd,
        attr: &PrimitiveAttr,
        handle: PrimitiveHandle,
    ) -> Result<()> {
        let with_bias = pd.bias.is_some();
        let deps = self.install_deps(handle, if with_bias { 4 } else { 3 })?;
        let mut args = vec![
            self.place_memory(&deps, handle, 0, &pd.src)?,
            self.place_memory(&deps, handle, 1, &pd.weights)?,
        ];
        if let Some(bias) = &pd.bias {
            args.push(self.place_memory(&deps, handle, 2, bias)?);
        }
        args.push(self.place_memory(&deps, handle, deps.len() - 1, &pd.dst)?);
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::ConvolutionForward(pd),
                attr: attr.clone(),
                args,
            },
        )
    }

    /// Quantized convolution forward: integer operands, output `scales`
    /// applied under `mask` (0 for a single per-tensor scale), rounding to
    /// nearest, then `post_ops`.
    #[allow(clippy::too_many_arguments)]
    pub fn build_quantized_convolution_forward(
        &mut self,
        src: &MemoryDesc,
        weights: &MemoryDesc,
        bias: Option<&MemoryDesc>,
        dst: &MemoryDesc,
        geometry: &ConvGeometry,
        scales: &[f32],
        mask: u32,
        post_ops: PostOps,
    ) -> Result<PrimitiveHandle> {
        let attr = PrimitiveAttr::quantized(mask, scales.to_vec()).with_post_ops(post_ops);
        self.build_convolution_forward(src, weights, bias, dst, geometry, &attr)
    }

    /// Layout the engine picks for convolution weights given as `Any`.
    pub fn query_convolution_forward_weight_format(
        &self,
        src: &MemoryDesc,
        weights: &MemoryDesc,
        dst: &MemoryDesc,
        geometry: &ConvGeometry,
    ) -> Result<MemoryFormat> {
        let desc = ConvolutionForwardDesc::new(
            src.clone(),
            weights.clone(),
            None,
            dst.clone(),
            geometry.clone(),
        );
        let pd = construct(
            CONV_FORWARD,
            desc.resolve(&self.engine, &PrimitiveAttr::default()),
        )?;
        Ok(pd.weights.format())
    }

    /// Convolution backward data. Dependencies: `[weights, diff_dst, diff_src]`.
    pub fn build_convolution_backward_data(
        &mut self,
        weights: &MemoryDesc,
        diff_dst: &MemoryDesc,
        diff_src: &MemoryDesc,
        geometry: &ConvGeometry,
    ) -> Result<PrimitiveHandle> {
        let desc = ConvolutionBackwardDataDesc::new(
            diff_src.clone(),
            weights.clone(),
            diff_dst.clone(),
            geometry.clone(),
        );
        let pd = construct(CONV_BACKWARD_DATA, desc.resolve(&self.engine))?;
        let handle = self.reserve_primitive_space(4, false)?;
        self.install_convolution_backward_data(pd, handle)?;
        Ok(handle)
    }

    pub fn rebuild_convolution_backward_data(
        &mut self,
        desc: &ConvolutionBackwardDataDesc,
        handle: PrimitiveHandle,
    ) -> Result<()> {
        let pd = construct(CONV_BACKWARD_DATA, desc.resolve(&self.engine))?;
        self.install_convolution_backward_data(pd, handle)
    }

    fn install_convolution_backward_data(
        &mut self,
        pd: ConvolutionBackwardDataPd,
        handle: PrimitiveHandle,
    ) -> Result<()> {
        let deps = self.install_deps(handle, 3)?;
        let weights = self.place_memory(&deps, handle, 0, &pd.weights)?;
        let diff_dst = self.place_memory(&deps, handle, 1, &pd.diff_dst)?;
        let diff_src = self.place_memory(&deps, handle, 2, &pd.diff_src)?;
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::ConvolutionBackwardData(pd),
                attr: PrimitiveAttr::default(),
                args: vec![diff_dst, weights, diff_src],
            },
        )
    }

    /// Convolution backward weights. Dependencies: `[src, diff_dst,
    /// diff_weights]`, plus `diff_bias` last when given.
    pub fn build_convolution_backward_weights(
        &mut self,
        src: &MemoryDesc,
        diff_dst: &MemoryDesc,
        diff_weights: &MemoryDesc,
        diff_bias: Option<&MemoryDesc>,
        geometry: &ConvGeometry,
    ) -> Result<PrimitiveHandle> {
        let desc = ConvolutionBackwardWeightsDesc::new(
            src.clone(),
            diff_weights.clone(),
            diff_bias.cloned(),
            diff_dst.clone(),
            geometry.clone(),
        );
        let pd = construct(CONV_BACKWARD_WEIGHTS, desc.resolve(&self.engine))?;
        let count = if pd.diff_bias.is_some() { 5 } else { 4 };
        let handle = self.reserve_primitive_space(count, false)?;
        self.install_convolution_backward_weights(pd, handle)?;
        Ok(handle)
    }

    pub fn rebuild_convolution_backward_weights(
        &mut self,
        desc: &ConvolutionBackwardWeightsDesc,
        handle: PrimitiveHandle,
    ) -> Result<()> {
        let pd = construct(CONV_BACKWARD_WEIGHTS, desc.resolve(&self.engine))?;
        self.install_convolution_backward_weights(pd, handle)
    }

    fn install_convolution_backward_weights(
        &mut self,
        pd: ConvolutionBackwardWeightsPd,
        handle: PrimitiveHandle,
    ) -> Result<()> {
        let deps = self.install_deps(handle, if pd.diff_bias.is_some() { 4 } else { 3 })?;
        let mut args = vec![
            self.place_memory(&deps, handle, 0, &pd.src)?,
            self.place_memory(&deps, handle, 1, &pd.diff_dst)?,
            self.place_memory(&deps, handle, 2, &pd.diff_weights)?,
        ];
        if let Some(diff_bias) = &pd.diff_bias {
            args.push(self.place_memory(&deps, handle, 3, diff_bias)?);
        }
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::ConvolutionBackwardWeights(pd),
                attr: PrimitiveAttr::default(),
                args,
            },
        )
    }
}
