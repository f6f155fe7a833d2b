// Engine — the execution context every kernel is resolved against
//
// An Engine stands in for the kernel library's device context. It is an
// explicit value owned by the compiled program (through its Emitter) and
// consulted by every build call; nothing about it is process-global.
//
// Resolution is where the engine earns its keep. Given a kernel descriptor
// it:
//
//   1. checks operand ranks, dims and element types against each other,
//   2. replaces every `Any` layout with the layout it would pick,
//   3. chooses the convolution algorithm,
//   4. reports workspace requirements.
//
// Each emitter module implements step 1-4 for its own kernels on top of the
// shared helpers below; failures come back as BackendError and are wrapped
// by the emitter with the kernel's name.

use log::debug;

use crate::config::EngineConfig;
use crate::error::BackendError;
use crate::memory::{DataType, MemoryDesc, MemoryFormat};

/// Which device the engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Cpu,
}

/// Propagation kind of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropKind {
    /// Forward pass that keeps whatever the backward pass needs.
    ForwardTraining,
    /// Forward pass only (also called scoring).
    ForwardInference,
    Backward,
}

/// Convolution algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvAlgorithm {
    /// Engine picks direct or winograd per shape.
    Auto,
    Direct,
}

/// Explicit execution context.
#[derive(Debug, Clone)]
pub struct Engine {
    kind: EngineKind,
    config: EngineConfig,
}

impl Engine {
    /// CPU engine configured from the environment.
    pub fn cpu() -> Self {
        Engine::with_config(EngineConfig::from_env())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Engine {
            kind: EngineKind::Cpu,
            config,
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn index(&self) -> usize {
        self.config.cpu_index
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether the engine may auto-select the convolution algorithm.
    pub fn can_use_conv_auto(&self) -> bool {
        self.config.conv_auto
    }

    pub fn convolution_algorithm(&self) -> ConvAlgorithm {
        if self.can_use_conv_auto() {
            ConvAlgorithm::Auto
        } else {
            debug!("engine: convolution auto-selection disabled, using direct");
            ConvAlgorithm::Direct
        }
    }

    /// Resolve an activation descriptor. `Any` takes the layout of `like`
    /// when it has the same rank, else the plain layout of its rank.
    pub(crate) fn resolve_data(
        &self,
        desc: &MemoryDesc,
        like: Option<&MemoryDesc>,
    ) -> Result<MemoryDesc, BackendError> {
        if !desc.is_any() {
            return Ok(desc.clone());
        }
        let format = match like {
            Some(l) if !l.is_any() && l.ndims() == desc.ndims() && !l.format().is_placeholder() => {
                l.format()
            }
            _ => MemoryFormat::plain_data(desc.ndims()).ok_or_else(|| {
                BackendError::unimplemented(format!(
                    "no default layout for a rank {} tensor",
                    desc.ndims()
                ))
            })?,
        };
        desc.with_format(format)
            .map_err(|e| BackendError::invalid(e.to_string()))
    }

    /// Resolve a convolution weights descriptor against the resolved source
    /// layout: channel-blocked sources get the matching blocked weights.
    pub(crate) fn resolve_weights(
        &self,
        weights: &MemoryDesc,
        src: &MemoryDesc,
    ) -> Result<MemoryDesc, BackendError> {
        if !weights.is_any() {
            return Ok(weights.clone());
        }
        let grouped = weights.ndims() == src.ndims() + 1;
        let format = match (src.format().channel_block(), weights.ndims(), grouped) {
            (16, 4, false) => MemoryFormat::OIhw16i16o,
            (8, 4, false) => MemoryFormat::OIhw8i8o,
            (_, rank, grouped) => MemoryFormat::plain_weights(rank, grouped).ok_or_else(|| {
                BackendError::unimplemented(format!(
                    "no weights layout for a rank {} tensor",
                    rank
                ))
            })?,
        };
        weights
            .with_format(format)
            .map_err(|e| BackendError::invalid(e.to_string()))
    }

    /// Resolve a descriptor that has exactly one sensible layout (`x`, `nc`...).
    pub(crate) fn resolve_fixed(
        &self,
        desc: &MemoryDesc,
        format: MemoryFormat,
    ) -> Result<MemoryDesc, BackendError> {
        if desc.is_any() {
            desc.with_format(format)
                .map_err(|e| BackendError::invalid(e.to_string()))
        } else {
            Ok(desc.clone())
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::with_config(EngineConfig::default())
    }
}

// Shared checks

pub(crate) fn expect(cond: bool, message: impl FnOnce() -> String) -> Result<(), BackendError> {
    if cond {
        Ok(())
    } else {
        Err(BackendError::invalid(message()))
    }
}

pub(crate) fn expect_rank(
    what: &str,
    desc: &MemoryDesc,
    ranks: &[usize],
) -> Result<(), BackendError> {
    expect(ranks.contains(&desc.ndims()), || {
        format!(
            "{} has rank {}, expected one of {:?}",
            what,
            desc.ndims(),
            ranks
        )
    })
}

pub(crate) fn expect_dims(what: &str, desc: &MemoryDesc, dims: &[usize]) -> Result<(), BackendError> {
    expect(desc.dims() == dims, || {
        format!("{} has dims {:?}, expected {:?}", what, desc.dims(), dims)
    })
}

pub(crate) fn expect_types(
    what: &str,
    desc: &MemoryDesc,
    types: &[DataType],
) -> Result<(), BackendError> {
    if types.contains(&desc.data_type()) {
        Ok(())
    } else {
        Err(BackendError::unimplemented(format!(
            "{} of type {} is not supported here (expected one of {:?})",
            what,
            desc.data_type(),
            types
        )))
    }
}

/// Output extent of a windowed reduction along one dimension, or `None`
/// when the window does not fit the padded input.
pub(crate) fn window_output(
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    pad_below: usize,
    pad_above: usize,
) -> Option<usize> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        return None;
    }
    let effective = (kernel - 1) * dilation + 1;
    let padded = input + pad_below + pad_above;
    if padded < effective {
        return None;
    }
    Some((padded - effective) / stride + 1)
}
