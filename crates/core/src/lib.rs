//! Primitive types and the caller-facing error enum shared by every
//! gateway crate.

pub mod error;
pub mod types;
