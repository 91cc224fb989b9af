//! Application layer: the binary's top-level error.

pub mod error;
