//! Tabula SDK
//!
//! Shared library providing the error types used across Tabula components.

/// Error types and handling
pub mod errors;

// Re-export commonly used types
pub use errors::{EngineError, TabulaErrorExt};
