//! Application-level error types shared by the binary and the HTTP surfaces.

pub mod error;
