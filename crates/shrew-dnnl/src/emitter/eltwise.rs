//! Elementwise and normalization kernels that map one buffer onto another of
//! the same shape: activations (relu, leaky/bounded relu, sigmoid) forward
//! and backward, elementwise add, softmax and LRN.

use crate::attr::{EltwiseAlgorithm, PrimitiveAttr};
use crate::engine::{expect, expect_rank, expect_types, Engine, PropKind};
use crate::error::{BackendError, Error, Result};
use crate::memory::{DataType, MemoryDesc};
use crate::primitive::{Kernel, KernelDesc, PrimitiveHandle};

use super::conv::{adopt, adopt_same_type};
use super::{construct, Emitter};

const ELTWISE_FORWARD: &str = "eltwise forward";
const ELTWISE_BACKWARD: &str = "eltwise backward";
const SUM: &str = "sum";
const SOFTMAX: &str = "softmax forward";
const LRN: &str = "lrn forward";

// Activations

#[derive(Debug, Clone, PartialEq)]
pub struct EltwiseForwardDesc {
    pub prop_kind: PropKind,
    pub algorithm: EltwiseAlgorithm,
    pub data: MemoryDesc,
    pub alpha: f32,
    pub beta: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EltwiseForwardPd {
    pub prop_kind: PropKind,
    pub algorithm: EltwiseAlgorithm,
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
    pub alpha: f32,
    pub beta: f32,
}

impl EltwiseForwardDesc {
    pub fn new(prop_kind: PropKind, algorithm: EltwiseAlgorithm, data: MemoryDesc, alpha: f32, beta: f32) -> Self {
        EltwiseForwardDesc {
            prop_kind,
            algorithm,
            data,
            alpha,
            beta,
        }
    }

    /// Plain relu (slope 0).
    pub fn relu(data: MemoryDesc) -> Self {
        Self::new(PropKind::ForwardTraining, EltwiseAlgorithm::Relu, data, 0.0, 0.0)
    }

    /// Relu with `alpha` as the negative slope.
    pub fn leaky_relu(data: MemoryDesc, alpha: f32) -> Self {
        Self::new(PropKind::ForwardTraining, EltwiseAlgorithm::Relu, data, alpha, 0.0)
    }

    /// Relu clipped at `alpha`.
    pub fn bounded_relu(data: MemoryDesc, alpha: f32) -> Self {
        Self::new(PropKind::ForwardTraining, EltwiseAlgorithm::BoundedRelu, data, alpha, 0.0)
    }

    pub fn sigmoid(data: MemoryDesc) -> Self {
        Self::new(PropKind::ForwardTraining, EltwiseAlgorithm::Logistic, data, 0.0, 0.0)
    }

    pub(crate) fn resolve(&self, engine: &Engine) -> std::result::Result<EltwiseForwardPd, BackendError> {
        match self.algorithm {
            EltwiseAlgorithm::Relu if self.prop_kind == PropKind::ForwardInference => expect_types(
                "data",
                &self.data,
                &[DataType::F32, DataType::S32, DataType::S8, DataType::U8],
            )?,
            _ => expect_types("data", &self.data, &[DataType::F32])?,
        }
        expect(self.alpha.is_finite() && self.beta.is_finite(), || {
            "eltwise parameters must be finite".to_string()
        })?;
        if self.algorithm == EltwiseAlgorithm::BoundedRelu {
            expect(self.alpha > 0.0, || {
                format!("bounded relu needs a positive bound, got {}", self.alpha)
            })?;
        }
        let src = engine.resolve_data(&self.data, None)?;
        Ok(EltwiseForwardPd {
            prop_kind: self.prop_kind,
            algorithm: self.algorithm,
            dst: src.clone(),
            src,
            alpha: self.alpha,
            beta: self.beta,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EltwiseBackwardDesc {
    pub algorithm: EltwiseAlgorithm,
    pub diff_data: MemoryDesc,
    pub data: MemoryDesc,
    pub alpha: f32,
    pub beta: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EltwiseBackwardPd {
    pub algorithm: EltwiseAlgorithm,
    pub src: MemoryDesc,
    pub diff_dst: MemoryDesc,
    pub diff_src: MemoryDesc,
    pub alpha: f32,
    pub beta: f32,
    pub hint: Box<EltwiseForwardPd>,
}

impl EltwiseBackwardDesc {
    pub fn new(algorithm: EltwiseAlgorithm, diff_data: MemoryDesc, data: MemoryDesc, alpha: f32, beta: f32) -> Self {
        EltwiseBackwardDesc {
            algorithm,
            diff_data,
            data,
            alpha,
            beta,
        }
    }

    pub(crate) fn resolve(&self, engine: &Engine) -> std::result::Result<EltwiseBackwardPd, BackendError> {
        expect_types("diff_data", &self.diff_data, &[DataType::F32])?;
        let hint = EltwiseForwardDesc::new(
            PropKind::ForwardTraining,
            self.algorithm,
            self.data.clone(),
            self.alpha,
            self.beta,
        )
        .resolve(engine)?;
        let diff_dst = adopt(&self.diff_data, &hint.dst)?;
        Ok(EltwiseBackwardPd {
            algorithm: self.algorithm,
            src: hint.src.clone(),
            diff_src: hint.src.clone(),
            diff_dst,
            alpha: self.alpha,
            beta: self.beta,
            hint: Box::new(hint),
        })
    }
}

// Sum

/// Weighted sum of same-shaped inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct SumDesc {
    pub scales: Vec<f32>,
    pub srcs: Vec<MemoryDesc>,
    pub dst: MemoryDesc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SumPd {
    pub scales: Vec<f32>,
    pub srcs: Vec<MemoryDesc>,
    pub dst: MemoryDesc,
}

impl SumDesc {
    pub fn new(scales: Vec<f32>, srcs: Vec<MemoryDesc>, dst: MemoryDesc) -> Self {
        SumDesc { scales, srcs, dst }
    }

    pub(crate) fn resolve(&self, engine: &Engine) -> std::result::Result<SumPd, BackendError> {
        expect(!self.srcs.is_empty(), || "sum needs at least one input".to_string())?;
        expect(self.scales.len() == self.srcs.len(), || {
            format!(
                "{} scales given for {} inputs",
                self.scales.len(),
                self.srcs.len()
            )
        })?;
        let first = &self.srcs[0];
        for (i, src) in self.srcs.iter().enumerate() {
            expect(src.dims() == self.dst.dims(), || {
                format!(
                    "input {} has dims {:?}, result has {:?}",
                    i,
                    src.dims(),
                    self.dst.dims()
                )
            })?;
            expect_types("input", src, &[first.data_type()])?;
        }
        let srcs = self
            .srcs
            .iter()
            .map(|s| engine.resolve_data(s, None))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        expect_types("dst", &self.dst, &[first.data_type()])?;
        let dst = engine.resolve_data(&self.dst, Some(&srcs[0]))?;
        Ok(SumPd {
            scales: self.scales.clone(),
            srcs,
            dst,
        })
    }
}

// Softmax

#[derive(Debug, Clone, PartialEq)]
pub struct SoftmaxDesc {
    pub prop_kind: PropKind,
    pub data: MemoryDesc,
    pub axis: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoftmaxPd {
    pub prop_kind: PropKind,
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
    pub axis: usize,
}

impl SoftmaxDesc {
    pub fn new(data: MemoryDesc, axis: usize) -> Self {
        SoftmaxDesc {
            prop_kind: PropKind::ForwardInference,
            data,
            axis,
        }
    }

    /// Softmax over a set of reduction axes; only a single axis is supported.
    pub fn from_axes(data: MemoryDesc, axes: &[usize]) -> Result<Self> {
        match axes {
            [axis] => Ok(SoftmaxDesc::new(data, *axis)),
            _ => Err(Error::Unsupported(
                "supports softmax only across single axis".into(),
            )),
        }
    }

    pub(crate) fn resolve(&self, engine: &Engine) -> std::result::Result<SoftmaxPd, BackendError> {
        expect_types("data", &self.data, &[DataType::F32])?;
        expect(self.axis < self.data.ndims(), || {
            format!(
                "softmax axis {} out of range for rank {}",
                self.axis,
                self.data.ndims()
            )
        })?;
        let src = engine.resolve_data(&self.data, None)?;
        Ok(SoftmaxPd {
            prop_kind: self.prop_kind,
            dst: src.clone(),
            src,
            axis: self.axis,
        })
    }
}

// LRN

/// Local response normalization across channels.
#[derive(Debug, Clone, PartialEq)]
pub struct LrnDesc {
    pub prop_kind: PropKind,
    pub data: MemoryDesc,
    pub local_size: usize,
    pub alpha: f32,
    pub beta: f32,
    pub k: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LrnPd {
    pub prop_kind: PropKind,
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
    pub local_size: usize,
    pub alpha: f32,
    pub beta: f32,
    pub k: f32,
}

impl LrnDesc {
    pub fn new(data: MemoryDesc, local_size: usize, alpha: f32, beta: f32, k: f32) -> Self {
        LrnDesc {
            prop_kind: PropKind::ForwardInference,
            data,
            local_size,
            alpha,
            beta,
            k,
        }
    }

    pub(crate) fn resolve(&self, engine: &Engine) -> std::result::Result<LrnPd, BackendError> {
        expect_rank("data", &self.data, &[4])?;
        expect_types("data", &self.data, &[DataType::F32])?;
        expect(self.local_size > 0, || "lrn size must be positive".to_string())?;
        let src = engine.resolve_data(&self.data, None)?;
        Ok(LrnPd {
            prop_kind: self.prop_kind,
            dst: src.clone(),
            src,
            local_size: self.local_size,
            alpha: self.alpha,
            beta: self.beta,
            k: self.k,
        })
    }
}

impl Emitter {
    // Activations forward

    fn build_eltwise_forward(&mut self, desc: &EltwiseForwardDesc, result: &MemoryDesc) -> Result<PrimitiveHandle> {
        let mut pd = construct(ELTWISE_FORWARD, desc.resolve(&self.engine))?;
        pd.dst = construct(ELTWISE_FORWARD, adopt_same_type(result, &pd.dst))?;
        let handle = self.reserve_primitive_space(3, false)?;
        self.install_eltwise_forward(pd, handle)?;
        Ok(handle)
    }

    /// Relu forward. Dependencies: `[src, dst]`.
    pub fn build_relu_forward(&mut self, input: &MemoryDesc, result: &MemoryDesc) -> Result<PrimitiveHandle> {
        self.build_eltwise_forward(&EltwiseForwardDesc::relu(input.clone()), result)
    }

    /// Leaky relu forward with negative slope `alpha`. Dependencies: `[src, dst]`.
    pub fn build_leaky_relu(&mut self, input: &MemoryDesc, result: &MemoryDesc, alpha: f32) -> Result<PrimitiveHandle> {
        self.build_eltwise_forward(&EltwiseForwardDesc::leaky_relu(input.clone(), alpha), result)
    }

    /// Bounded relu forward clipped at `alpha`. Dependencies: `[src, dst]`.
    pub fn build_bounded_relu(&mut self, input: &MemoryDesc, result: &MemoryDesc, alpha: f32) -> Result<PrimitiveHandle> {
        self.build_eltwise_forward(&EltwiseForwardDesc::bounded_relu(input.clone(), alpha), result)
    }

    /// Sigmoid forward. Dependencies: `[src, dst]`.
    pub fn build_sigmoid_forward(&mut self, input: &MemoryDesc, result: &MemoryDesc) -> Result<PrimitiveHandle> {
        self.build_eltwise_forward(&EltwiseForwardDesc::sigmoid(input.clone()), result)
    }

    /// Rebuild any activation forward slot.
    pub fn rebuild_eltwise_forward(&mut self, desc: &EltwiseForwardDesc, handle: PrimitiveHandle) -> Result<()> {
        let pd = construct(ELTWISE_FORWARD, desc.resolve(&self.engine))?;
        self.install_eltwise_forward(pd, handle)
    }

    fn install_eltwise_forward(&mut self, pd: EltwiseForwardPd, handle: PrimitiveHandle) -> Result<()> {
        let deps = self.install_deps(handle, 2)?;
        let src = self.place_memory(&deps, handle, 0, &pd.src)?;
        let dst = self.place_memory(&deps, handle, 1, &pd.dst)?;
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::EltwiseForward(pd),
                attr: PrimitiveAttr::default(),
                args: vec![src, dst],
            },
        )
    }

    // Activations backward

    fn build_eltwise_backward(&mut self, desc: &EltwiseBackwardDesc, result: &MemoryDesc) -> Result<PrimitiveHandle> {
        let mut pd = construct(ELTWISE_BACKWARD, desc.resolve(&self.engine))?;
        pd.diff_src = construct(ELTWISE_BACKWARD, adopt_same_type(result, &pd.diff_src))?;
        let handle = self.reserve_primitive_space(4, false)?;
        self.install_eltwise_backward(pd, handle)?;
        Ok(handle)
    }

    /// Relu backward. Dependencies: `[src, diff_dst, diff_src]`.
    pub fn build_relu_backward(
        &mut self,
        input: &MemoryDesc,
        delta: &MemoryDesc,
        result: &MemoryDesc,
    ) -> Result<PrimitiveHandle> {
        let desc = EltwiseBackwardDesc::new(EltwiseAlgorithm::Relu, delta.clone(), input.clone(), 0.0, 0.0);
        self.build_eltwise_backward(&desc, result)
    }

    /// Sigmoid backward. Dependencies: `[src, diff_dst, diff_src]`.
    pub fn build_sigmoid_backward(
        &mut self,
        input: &MemoryDesc,
        delta: &MemoryDesc,
        result: &MemoryDesc,
    ) -> Result<PrimitiveHandle> {
        let desc = EltwiseBackwardDesc::new(EltwiseAlgorithm::Logistic, delta.clone(), input.clone(), 0.0, 0.0);
        self.build_eltwise_backward(&desc, result)
    }

    pub fn rebuild_eltwise_backward(&mut self, desc: &EltwiseBackwardDesc, handle: PrimitiveHandle) -> Result<()> {
        let pd = construct(ELTWISE_BACKWARD, desc.resolve(&self.engine))?;
        self.install_eltwise_backward(pd, handle)
    }

    fn install_eltwise_backward(&mut self, pd: EltwiseBackwardPd, handle: PrimitiveHandle) -> Result<()> {
        let deps = self.install_deps(handle, 3)?;
        let src = self.place_memory(&deps, handle, 0, &pd.src)?;
        let diff_dst = self.place_memory(&deps, handle, 1, &pd.diff_dst)?;
        let diff_src = self.place_memory(&deps, handle, 2, &pd.diff_src)?;
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::EltwiseBackward(pd),
                attr: PrimitiveAttr::default(),
                args: vec![src, diff_dst, diff_src],
            },
        )
    }

    // Elementwise add

    /// `result = input0 + input1`. Dependencies: `[src0, src1, dst]`.
    pub fn build_elementwise_add(
        &mut self,
        input0: &MemoryDesc,
        input1: &MemoryDesc,
        result: &MemoryDesc,
    ) -> Result<PrimitiveHandle> {
        let desc = SumDesc::new(vec![1.0, 1.0], vec![input0.clone(), input1.clone()], result.clone());
        let pd = construct(SUM, desc.resolve(&self.engine))?;
        let handle = self.reserve_primitive_space(pd.srcs.len() + 2, false)?;
        self.install_sum(pd, handle)?;
        Ok(handle)
    }

    pub fn rebuild_elementwise_add(&mut self, desc: &SumDesc, handle: PrimitiveHandle) -> Result<()> {
        let pd = construct(SUM, desc.resolve(&self.engine))?;
        self.install_sum(pd, handle)
    }

    fn install_sum(&mut self, pd: SumPd, handle: PrimitiveHandle) -> Result<()> {
        let n = pd.srcs.len();
        let deps = self.install_deps(handle, n + 1)?;
        let mut args = Vec::with_capacity(n + 1);
        for (i, src) in pd.srcs.iter().enumerate() {
            args.push(self.place_memory(&deps, handle, i, src)?);
        }
        args.push(self.place_memory(&deps, handle, n, &pd.dst)?);
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::Sum(pd),
                attr: PrimitiveAttr::default(),
                args,
            },
        )
    }

    // Softmax

    /// Softmax over `axis`. Dependencies: `[src, dst]`.
    pub fn build_softmax_forward(&mut self, input: &MemoryDesc, result: &MemoryDesc, axis: usize) -> Result<PrimitiveHandle> {
        let mut pd = construct(SOFTMAX, SoftmaxDesc::new(input.clone(), axis).resolve(&self.engine))?;
        pd.dst = construct(SOFTMAX, adopt_same_type(result, &pd.dst))?;
        let handle = self.reserve_primitive_space(3, false)?;
        self.install_softmax(pd, handle)?;
        Ok(handle)
    }

    pub fn rebuild_softmax_forward(&mut self, desc: &SoftmaxDesc, handle: PrimitiveHandle) -> Result<()> {
        let pd = construct(SOFTMAX, desc.resolve(&self.engine))?;
        self.install_softmax(pd, handle)
    }

    fn install_softmax(&mut self, pd: SoftmaxPd, handle: PrimitiveHandle) -> Result<()> {
        let deps = self.install_deps(handle, 2)?;
        let src = self.place_memory(&deps, handle, 0, &pd.src)?;
        let dst = self.place_memory(&deps, handle, 1, &pd.dst)?;
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::Softmax(pd),
                attr: PrimitiveAttr::default(),
                args: vec![src, dst],
            },
        )
    }

    // LRN

    /// LRN across channels. Dependencies: `[src, dst]`.
    #[allow(clippy::too_many_arguments)]
    pub fn build_lrn_forward(
        &mut self,
        input: &MemoryDesc,
        result: &MemoryDesc,
        alpha: f32,
        beta: f32,
        bias: f32,
        size: usize,
    ) -> Result<PrimitiveHandle> {
        let desc = LrnDesc::new(input.clone(), size, alpha, beta, bias);
        let mut pd = construct(LRN, desc.resolve(&self.engine))?;
        pd.dst = construct(LRN, adopt_same_type(result, &pd.dst))?;
        let handle = self.reserve_primitive_space(3, false)?;
        self.install_lrn(pd, handle)?;
        Ok(handle)
    }

    pub fn rebuild_lrn_forward(&mut self, desc: &LrnDesc, handle: PrimitiveHandle) -> Result<()> {
        let pd = construct(LRN, desc.resolve(&self.engine))?;
        self.install_lrn(pd, handle)
    }

    fn install_lrn(&mut self, pd: LrnPd, handle: PrimitiveHandle) -> Result<()> {
        let deps = self.install_deps(handle, 2)?;
        let src = self.place_memory(&deps, handle, 0, &pd.src)?;
        let dst = self.place_memory(&deps, handle, 1, &pd.dst)?;
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::Lrn(pd),
                attr: PrimitiveAttr::default(),
                args: vec![src, dst],
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFormat;

    #[test]
    fn test_softmax_single_axis_only() {
        let data = MemoryDesc::new(vec![2, 5], DataType::F32, MemoryFormat::Nc).unwrap();
        assert!(SoftmaxDesc::from_axes(data.clone(), &[1]).is_ok());
        let err = SoftmaxDesc::from_axes(data, &[0, 1]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported configuration: supports softmax only across single axis"
        );
    }

    #[test]
    fn test_relu_accepts_int_in_inference_only() {
        let data = MemoryDesc::new(vec![4], DataType::U8, MemoryFormat::X).unwrap();
        let infer = EltwiseForwardDesc::new(PropKind::ForwardInference, EltwiseAlgorithm::Relu, data.clone(), 0.0, 0.0);
        assert!(infer.resolve(&Engine::default()).is_ok());
        assert!(EltwiseForwardDesc::relu(data).resolve(&Engine::default()).is_err());
    }

    #[test]
    fn test_sum_checks_scales() {
        let d = MemoryDesc::new(vec![3], DataType::F32, MemoryFormat::X).unwrap();
        let desc = SumDesc::new(vec![1.0], vec![d.clone(), d.clone()], d);
        assert!(desc.resolve(&Engine::default()).is_err());
    }

    #[test]
    fn test_bounded_relu_needs_positive_bound() {
        let d = MemoryDesc::new(vec![3], DataType::F32, MemoryFormat::X).unwrap();
        assert!(EltwiseForwardDesc::bounded_relu(d.clone(), 6.0)
            .resolve(&Engine::default())
            .is_ok());
        assert!(EltwiseForwardDesc::bounded_relu(d, 0.0)
            .resolve(&Engine::default())
            .is_err());
    }
}
