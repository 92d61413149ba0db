//! Error types for hjs-spanstore crate

use hjs_core::ParseIdError;
use hjs_humio::HumioError;
use thiserror::Error;

/// Errors returned by the span reader, writer and dependency reader
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Humio(#[from] HumioError),

    /// A span payload could not be decoded
    #[error("Failed to decode span payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    InvalidTraceId(#[from] ParseIdError),

    /// A `_count` field of a dependency row is not a number
    #[error("Unparsable _count {0:?}")]
    InvalidCount(String),

    /// The operation is not implemented by this backend
    #[error("{0} is not implemented")]
    Unsupported(&'static str),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Humio(e) if e.is_retryable())
    }
}

/// Result type for span store operations
pub type StoreResult<T> = Result<T, StoreError>;
