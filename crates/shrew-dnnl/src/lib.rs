//! # shrew-dnnl
//!
//! Kernel emitter for the Shrew CPU backend.
//!
//! Given the operand descriptors of one graph node, the [`Emitter`] resolves
//! a kernel descriptor against the [`Engine`], registers the memory slots it
//! reads and writes in the [`PrimitiveRegistry`], and records the kernel's
//! dependency list so generated code can patch buffer pointers at run time.
//!
//! This crate provides:
//! - [`MemoryDesc`] — dims, element type and layout of one buffer
//! - [`PrimitiveRegistry`] — append-only slot store with reserve/rebuild
//! - [`WorkspaceManager`] — aligned scratch buffers owned by the emitter
//! - [`Emitter`] — `build_*` / `rebuild_*` for every supported operation
// - memory: descriptor builder and native layout tags
// - attr: output scales, rounding and post-op chains
// - engine: descriptor resolution (layouts, algorithms, workspace sizes)
// - emitter: one submodule per operation family

pub mod attr;
pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod memory;
pub mod primitive;
pub mod registry;
pub mod workspace;

pub use attr::{EltwiseAlgorithm, PostOp, PostOps, PrimitiveAttr, RoundMode};
pub use config::EngineConfig;
pub use emitter::Emitter;
pub use engine::{ConvAlgorithm, Engine, EngineKind, PropKind};
pub use error::{BackendError, Error, Result, Status};
pub use memory::{build_blocked_descriptor, build_descriptor, DataType, MemoryDesc, MemoryFormat};
pub use primitive::{
    Dependency, DependencyList, Kernel, KernelDesc, Primitive, PrimitiveHandle, WorkspaceHandle,
};
pub use registry::{PrimitiveRegistry, RegistryStats};
pub use workspace::{WorkspaceBuffer, WorkspaceManager, WorkspaceStats};
