//! Cache error types and their gRPC status mapping.

use crate::proto::google::rpc;
use larder_storage::StorageError;
use tonic::{Code, Status};

/// Errors surfaced by the cache layer.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("data loss: {0}")]
    DataLoss(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl CacheError {
    /// gRPC status code for this error.
    pub fn code(&self) -> Code {
        match self {
            Self::NotFound(_) => Code::NotFound,
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::OutOfRange(_) => Code::OutOfRange,
            Self::DataLoss(_) => Code::DataLoss,
            Self::PermissionDenied(_) => Code::PermissionDenied,
            Self::Cancelled(_) => Code::Cancelled,
            Self::Internal(_) => Code::Internal,
            Self::Storage(e) => match e {
                StorageError::NotFound(_) => Code::NotFound,
                StorageError::InvalidRange(_) => Code::OutOfRange,
                StorageError::InvalidKey(_) => Code::InvalidArgument,
                e if e.is_integrity() => Code::DataLoss,
                e if e.is_transient() => Code::Unavailable,
                _ => Code::Internal,
            },
        }
    }

    /// Whether this is a not-found condition, whatever layer raised it.
    pub fn is_not_found(&self) -> bool {
        self.code() == Code::NotFound
    }

    /// Per-item status used inside batch responses.
    pub fn to_rpc_status(&self) -> rpc::Status {
        self.observe();
        rpc::Status {
            code: self.code() as i32,
            message: self.to_string(),
            details: Vec::new(),
        }
    }

    fn observe(&self) {
        if self.code() == Code::DataLoss {
            crate::metrics::INTEGRITY_FAILURES.inc();
        }
    }

    /// Map a status received from a client stream.
    pub fn from_status(status: Status) -> Self {
        match status.code() {
            Code::Cancelled | Code::DeadlineExceeded => Self::Cancelled(status.message().to_string()),
            _ => Self::InvalidArgument(status.message().to_string()),
        }
    }
}

impl From<larder_core::Error> for CacheError {
    fn from(err: larder_core::Error) -> Self {
        match err {
            larder_core::Error::DigestMismatch { .. } => Self::DataLoss(err.to_string()),
            other => Self::InvalidArgument(other.to_string()),
        }
    }
}

impl From<CacheError> for Status {
    fn from(err: CacheError) -> Self {
        err.observe();
        Status::new(err.code(), err.to_string())
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// OK status for batch items.
pub fn ok_status() -> rpc::Status {
    rpc::Status {
        code: Code::Ok as i32,
        message: String::new(),
        details: Vec::new(),
    }
}
