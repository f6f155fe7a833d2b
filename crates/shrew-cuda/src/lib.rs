//! # shrew-cuda
//!
//! Code-generation helpers for the Shrew GPU backend.
//!
//! - [`magic`] — multiply/shift constants that let generated kernels divide
//!   by a runtime divisor without a division instruction
//! - `memory` (feature `cuda`) — byte-buffer allocation, copies and fills on
//!   the device, with a cache of freed buffers

pub mod magic;

#[cfg(feature = "cuda")]
pub mod memory;
#[cfg(feature = "cuda")]
mod pool;

pub use magic::{synthesize_division_magic, MagicDivisor, MAX_DIVISOR};

#[cfg(feature = "cuda")]
pub use memory::{GpuBuffer, GpuMemory};
#[cfg(feature = "cuda")]
pub use pool::PoolStats;
