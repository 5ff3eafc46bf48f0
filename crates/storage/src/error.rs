//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("storage temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("length mismatch for {key}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no backend registered for scheme {0:?}")]
    UnsupportedScheme(String),
}

impl StorageError {
    /// Whether retrying the operation later may succeed.
    ///
    /// Timeouts, connectivity failures, throttling and server-side errors are
    /// transient. Configuration problems, access denials, invalid keys and
    /// integrity failures are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Whether this error reports content that does not match its digest.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::DigestMismatch { .. } | Self::LengthMismatch { .. }
        )
    }
}

impl From<larder_core::Error> for StorageError {
    fn from(err: larder_core::Error) -> Self {
        match err {
            larder_core::Error::DigestMismatch { expected, actual } => {
                Self::DigestMismatch { expected, actual }
            }
            larder_core::Error::InvalidCacheUri(msg) | larder_core::Error::Config(msg) => {
                Self::Config(msg)
            }
            other => Self::InvalidKey(other.to_string()),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
