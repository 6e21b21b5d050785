//! Core error types.

use thiserror::Error;

/// Errors raised while constructing or validating core types.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The snap identifier is malformed.
    #[error("invalid snap id: {0}")]
    InvalidSnapId(String),

    /// The manifest is structurally invalid.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// The fetched bundle does not match the manifest shasum.
    #[error("source shasum mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Shasum declared by the manifest.
        expected: String,
        /// Shasum of the bytes actually fetched.
        actual: String,
    },

    /// Unknown handler name.
    #[error("unknown handler: {0}")]
    UnknownHandler(String),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
