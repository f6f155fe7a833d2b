// Primitive attributes — the configuration a caller attaches to a kernel
//
// Attributes are decoupled from descriptor construction: an emitter resolves
// its descriptors first, then the engine checks the attribute set against
// the resolved result dims. Three knobs exist:
//
//   post-ops       operations fused onto the kernel's output (sum, eltwise)
//   output scales  per-tensor (mask 0) or per-axis quantization scales
//   round mode     rounding applied when writing integer outputs

use crate::error::BackendError;

/// Eltwise algorithms, shared by standalone kernels and fused post-ops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EltwiseAlgorithm {
    /// `x > 0 ? x : alpha * x`
    Relu,
    /// `min(max(x, 0), alpha)`
    BoundedRelu,
    /// `1 / (1 + exp(-x))`
    Logistic,
}

/// One fused operation applied to the kernel's output.
#[derive(Debug, Clone, PartialEq)]
pub enum PostOp {
    /// `dst = op(...) + scale * dst`
    Sum { scale: f32 },
    /// `dst = scale * eltwise(dst, alpha, beta)`
    Eltwise {
        scale: f32,
        algorithm: EltwiseAlgorithm,
        alpha: f32,
        beta: f32,
    },
}

/// Ordered post-op chain.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PostOps(Vec<PostOp>);

impl PostOps {
    pub fn new() -> Self {
        PostOps(Vec::new())
    }

    pub fn append_sum(mut self, scale: f32) -> Self {
        self.0.push(PostOp::Sum { scale });
        self
    }

    pub fn append_eltwise(
        mut self,
        scale: f32,
        algorithm: EltwiseAlgorithm,
        alpha: f32,
        beta: f32,
    ) -> Self {
        self.0.push(PostOp::Eltwise {
            scale,
            algorithm,
            alpha,
            beta,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PostOp> {
        self.0.iter()
    }

    fn validate(&self) -> Result<(), BackendError> {
        for (i, op) in self.0.iter().enumerate() {
            if matches!(op, PostOp::Sum { .. }) && i != 0 {
                return Err(BackendError::unimplemented(
                    "sum post-op must be the first entry of the chain",
                ));
            }
        }
        Ok(())
    }
}

/// Rounding of integer outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
    Nearest,
    Down,
}

/// Output scales. Bit `i` of `mask` selects dimension `i` of the result;
/// mask 0 is a single per-tensor scale.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputScales {
    pub mask: u32,
    pub scales: Vec<f32>,
}

impl OutputScales {
    /// Number of scales the mask implies for a result of the given dims.
    pub fn expected_count(mask: u32, dims: &[usize]) -> usize {
        dims.iter()
            .enumerate()
            .filter(|(i, _)| *i < 32 && mask & (1 << i) != 0)
            .map(|(_, &d)| d)
            .product()
    }
}

/// Attribute set attached to one kernel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PrimitiveAttr {
    pub post_ops: PostOps,
    pub output_scales: Option<OutputScales>,
    pub round_mode: Option<RoundMode>,
}

impl PrimitiveAttr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Quantization attributes: scales under `mask`, rounded to nearest.
    pub fn quantized(mask: u32, scales: Vec<f32>) -> Self {
        PrimitiveAttr::new()
            .with_output_scales(mask, scales)
            .with_round_mode(RoundMode::Nearest)
    }

    pub fn with_post_ops(mut self, post_ops: PostOps) -> Self {
        self.post_ops = post_ops;
        self
    }

    pub fn with_output_scales(mut self, mask: u32, scales: Vec<f32>) -> Self {
        self.output_scales = Some(OutputScales { mask, scales });
        self
    }

    pub fn with_round_mode(mut self, mode: RoundMode) -> Self {
        self.round_mode = Some(mode);
        self
    }

    /// Check the attribute set against the dims of the kernel's result.
    pub fn validate(&self, dst_dims: &[usize]) -> Result<(), BackendError> {
        self.post_ops.validate()?;
        if let Some(scales) = &self.output_scales {
            if scales.mask.checked_shr(dst_dims.len() as u32).unwrap_or(0) != 0 {
                return Err(BackendError::invalid(format!(
                    "output scale mask {:#x} selects dims beyond rank {}",
                    scales.mask,
                    dst_dims.len()
                )));
            }
            let expected = OutputScales::expected_count(scales.mask, dst_dims);
            if scales.scales.len() != expected {
                return Err(BackendError::invalid(format!(
                    "output scale mask {:#x} needs {} scales, got {}",
                    scales.mask,
                    expected,
                    scales.scales.len()
                )));
            }
            if scales.scales.iter().any(|s| !s.is_finite()) {
                return Err(BackendError::invalid("output scales must be finite"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_tensor_scale() {
        let attr = PrimitiveAttr::quantized(0, vec![0.5]);
        assert_eq!(attr.round_mode, Some(RoundMode::Nearest));
        assert!(attr.validate(&[1, 8, 4, 4]).is_ok());
        assert!(PrimitiveAttr::quantized(0, vec![0.5, 0.25])
            .validate(&[1, 8, 4, 4])
            .is_err());
    }

    #[test]
    fn test_per_channel_scale() {
        // mask bit 1 selects the channel dim
        let attr = PrimitiveAttr::quantized(0b10, vec![1.0; 8]);
        assert!(attr.validate(&[1, 8, 4, 4]).is_ok());
        assert!(attr.validate(&[1, 4, 4, 4]).is_err());
        assert!(PrimitiveAttr::quantized(1 << 5, vec![1.0])
            .validate(&[1, 8, 4, 4])
            .is_err());
    }

    #[test]
    fn test_sum_must_lead() {
        let ok = PostOps::new()
            .append_sum(1.0)
            .append_eltwise(1.0, EltwiseAlgorithm::Relu, 0.0, 0.0);
        assert!(PrimitiveAttr::new().with_post_ops(ok).validate(&[1]).is_ok());
        let bad = PostOps::new()
            .append_eltwise(1.0, EltwiseAlgorithm::Relu, 0.0, 0.0)
            .append_sum(1.0);
        assert!(PrimitiveAttr::new().with_post_ops(bad).validate(&[1]).is_err());
    }
}
