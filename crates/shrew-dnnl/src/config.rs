// Engine configuration — knobs the emitter consults while resolving kernels
//
// The defaults match a stock CPU engine: automatic convolution algorithm
// selection on, 64-byte workspace alignment, engine index 0. A process can
// override them through the environment:
//
//   SHREW_DNNL_CONV_AUTO=0        force the direct convolution algorithm
//   SHREW_DNNL_WORKSPACE_ALIGN=N  workspace alignment in bytes (power of two)
//
// Environment values are read once and cached for the life of the process.

use std::env;
use std::sync::OnceLock;

use log::warn;

const DEFAULT_WORKSPACE_ALIGNMENT: usize = 64;

static CONV_AUTO_OVERRIDE: OnceLock<Option<bool>> = OnceLock::new();
static WORKSPACE_ALIGN_OVERRIDE: OnceLock<Option<usize>> = OnceLock::new();

fn parse_bool(value: &str) -> Option<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_alignment(value: &str) -> Option<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n.is_power_of_two() => Some(n),
        _ => None,
    }
}

fn conv_auto_override() -> Option<bool> {
    *CONV_AUTO_OVERRIDE.get_or_init(|| match env::var("SHREW_DNNL_CONV_AUTO") {
        Ok(value) if !value.trim().is_empty() => {
            let parsed = parse_bool(&value);
            if parsed.is_none() {
                warn!("ignoring SHREW_DNNL_CONV_AUTO={:?}: not a boolean", value);
            }
            parsed
        }
        _ => None,
    })
}

fn workspace_align_override() -> Option<usize> {
    *WORKSPACE_ALIGN_OVERRIDE.get_or_init(|| match env::var("SHREW_DNNL_WORKSPACE_ALIGN") {
        Ok(value) if !value.trim().is_empty() => {
            let parsed = parse_alignment(&value);
            if parsed.is_none() {
                warn!(
                    "ignoring SHREW_DNNL_WORKSPACE_ALIGN={:?}: not a power of two",
                    value
                );
            }
            parsed
        }
        _ => None,
    })
}

/// Configuration for an [`Engine`](crate::Engine).
///
/// # Example
/// ```
/// use shrew_dnnl::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_conv_auto(false)
///     .with_workspace_alignment(128);
/// assert!(!config.conv_auto);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Let the engine auto-select the convolution algorithm.
    pub conv_auto: bool,
    /// Byte alignment of every workspace buffer. Always a power of two.
    pub workspace_alignment: usize,
    /// Index of the CPU engine.
    pub cpu_index: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            conv_auto: true,
            workspace_alignment: DEFAULT_WORKSPACE_ALIGNMENT,
            cpu_index: 0,
        }
    }
}

impl EngineConfig {
    /// Defaults with any environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = EngineConfig::default();
        if let Some(auto) = conv_auto_override() {
            config.conv_auto = auto;
        }
        if let Some(align) = workspace_align_override() {
            config.workspace_alignment = align;
        }
        config
    }

    pub fn with_conv_auto(mut self, conv_auto: bool) -> Self {
        self.conv_auto = conv_auto;
        self
    }

    /// Set the workspace alignment. Values that are not a power of two are
    /// rounded up to the next one.
    pub fn with_workspace_alignment(mut self, alignment: usize) -> Self {
        self.workspace_alignment = alignment.max(1).next_power_of_two();
        self
    }

    pub fn with_cpu_index(mut self, index: usize) -> Self {
        self.cpu_index = index;
        self
    }
}
