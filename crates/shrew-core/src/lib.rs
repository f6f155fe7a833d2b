//! # shrew-core
//!
//! Shared vocabulary for the Shrew backends.
//!
//! This crate provides:
//! - [`Shape`] — n-dimensional tensor extents
//! - [`Layout`] — strides and offset of a tensor in flat storage
//! - [`DType`] — element data types (floating, quantized and index types)
//! - [`Error`] / [`Result`] — the errors every backend crate builds on

pub mod dtype;
pub mod error;
pub mod layout;
pub mod shape;

pub use dtype::DType;
pub use error::{Error, Result};
pub use layout::Layout;
pub use shape::Shape;
