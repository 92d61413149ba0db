//! Error types for hjs-humio crate

use thiserror::Error;

/// Maximum number of response body bytes kept in an error
pub const MAX_ERROR_BODY_BYTES: usize = 1000;

/// Errors that can occur talking to Humio
#[derive(Debug, Error)]
pub enum HumioError {
    /// Client cannot be built from the given settings
    #[error("Client not initialized: {0}")]
    Config(String),

    /// Network/HTTP error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("{operation}: unexpected HTTP status {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// The caller's context was cancelled
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// The caller's deadline passed before the request finished
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Query job did not finish in time and produced no partial result
    #[error("Query job {job_id} timed out without results")]
    JobTimeout { job_id: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl HumioError {
    /// Build a status error, truncating the body excerpt
    pub fn status(operation: &'static str, status: u16, body: &[u8]) -> Self {
        let excerpt = &body[..body.len().min(MAX_ERROR_BODY_BYTES)];
        let mut body = String::from_utf8_lossy(excerpt).into_owned();
        // Replacement characters are wider than the bytes they replace
        if body.len() > MAX_ERROR_BODY_BYTES {
            let mut end = MAX_ERROR_BODY_BYTES;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        HumioError::Status {
            operation,
            status,
            body,
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            HumioError::Status { status, .. } => Some(*status),
            HumioError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// 4xx: the request itself is bad and must not be retried
    pub fn is_client_error(&self) -> bool {
        matches!(self.status_code(), Some(status) if (400..500).contains(&status))
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            HumioError::Network(_) | HumioError::DeadlineExceeded => true,
            HumioError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type for Humio operations
pub type HumioResult<T> = Result<T, HumioError>;
