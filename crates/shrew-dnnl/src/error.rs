use std::fmt;

use crate::primitive::PrimitiveHandle;

/// Status reported by the engine when it refuses a kernel descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The descriptors are inconsistent with each other (dims, types, geometry).
    InvalidArguments,
    /// The combination is well formed but has no kernel implementation.
    Unimplemented,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::InvalidArguments => write!(f, "invalid arguments"),
            Status::Unimplemented => write!(f, "unimplemented"),
        }
    }
}

/// Diagnostic produced by the engine while resolving a kernel descriptor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (status: {status})")]
pub struct BackendError {
    pub status: Status,
    pub message: String,
}

impl BackendError {
    pub fn invalid(message: impl Into<String>) -> Self {
        BackendError {
            status: Status::InvalidArguments,
            message: message.into(),
        }
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        BackendError {
            status: Status::Unimplemented,
            message: message.into(),
        }
    }
}

/// Errors raised while building descriptors and kernels.
///
/// None of these are recoverable inside the emitter: a failed build aborts
/// the compilation, and the graph-level driver decides whether to route the
/// node elsewhere before calling in.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A descriptor request is malformed, e.g. a buffer described with a
    /// placeholder layout, or dims that disagree with the layout tag.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// The engine rejected the kernel; carries its diagnostic.
    #[error("could not create {primitive}: {source}")]
    Construction {
        primitive: &'static str,
        #[source]
        source: BackendError,
    },

    /// A configuration the engine never supports, detected before construction.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// Handle was never issued by this registry.
    #[error("unknown primitive handle {0}")]
    UnknownHandle(PrimitiveHandle),

    /// Slot is reserved but nothing has been built into it yet.
    #[error("primitive {0} is reserved but not built")]
    NotBuilt(PrimitiveHandle),

    /// Kernel slot was queried before a dependency list was recorded.
    #[error("primitive {0} has no dependency list")]
    MissingDependencies(PrimitiveHandle),

    /// A rebuild found a dependency list of the wrong length for the kernel.
    #[error("primitive {handle} has {found} dependencies, expected {expected}")]
    DependencyArity {
        handle: PrimitiveHandle,
        expected: usize,
        found: usize,
    },

    /// Dependency entry has the wrong kind (primitive vs workspace).
    #[error("dependency {index} of primitive {handle} is not a {expected}")]
    DependencyKind {
        handle: PrimitiveHandle,
        index: usize,
        expected: &'static str,
    },

    /// A reservation of zero slots.
    #[error("cannot reserve an empty primitive range")]
    EmptyReservation,

    /// Forward scratch aliased onto a backward result that is too small.
    #[error("cannot alias forward scratch: needs {required} bytes, diff_src has {available}")]
    WorkspaceAlias { required: usize, available: usize },

    /// Workspace handle was never issued.
    #[error("unknown workspace handle {0}")]
    UnknownWorkspace(usize),

    #[error(transparent)]
    Core(#[from] shrew_core::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub(crate) fn invalid(s: impl Into<String>) -> Self {
        Error::InvalidDescriptor(s.into())
    }

    /// Wrap an engine diagnostic for the named kernel.
    pub fn construction(primitive: &'static str, source: BackendError) -> Self {
        Error::Construction { primitive, source }
    }
}

/// Convenience Result type used throughout shrew-dnnl.
pub type Result<T> = std::result::Result<T, Error>;

