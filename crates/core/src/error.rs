//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("invalid resource name: {0}")]
    InvalidResourceName(String),

    #[error("unsupported resource: {0}")]
    UnsupportedResource(String),

    #[error("invalid cache uri: {0}")]
    InvalidCacheUri(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
