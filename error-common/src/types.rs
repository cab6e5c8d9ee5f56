use std::time::Duration;
use thiserror::Error;

use crate::codes::{classify_status, StatusClass};

/// Failure of a single outbound request
///
/// Cloneable so one in-flight fetch can hand the same outcome to every caller
/// that joined it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    /// No response reached us (DNS, connection reset, offline)
    #[error("Network error: {0}")]
    Network(String),

    /// 5xx, 429 or 408 from the server
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Any other 4xx from the server
    #[error("Client error {status}: {message}")]
    Client { status: u16, message: String },

    /// Local advisory timeout elapsed; the underlying call may still complete
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Cancelled through an abort signal
    #[error("Request cancelled")]
    Cancelled,

    /// Response arrived but could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
}

impl RequestError {
    /// Build an error from a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_status(status) {
            StatusClass::Transient => RequestError::Server { status, message },
            StatusClass::Rejected => RequestError::Client { status, message },
            // 1xx/3xx surfaced as errors by a transport are treated as transient
            StatusClass::Success => RequestError::Server { status, message },
        }
    }

    /// Whether the retry layer should try again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RequestError::Network(_) | RequestError::Server { .. } | RequestError::Timeout(_)
        )
    }

    /// HTTP status, when the server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Server { status, .. } | RequestError::Client { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Short stable name for log fields
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::Network(_) => "network",
            RequestError::Server { .. } => "server",
            RequestError::Client { .. } => "client",
            RequestError::Timeout(_) => "timeout",
            RequestError::Cancelled => "cancelled",
            RequestError::Decode(_) => "decode",
        }
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(err: serde_json::Error) -> Self {
        RequestError::Decode(err.to_string())
    }
}

/// Result type alias for request operations
pub type RequestResult<T> = std::result::Result<T, RequestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RequestError::Network("connection reset".into()).is_retryable());
        assert!(RequestError::from_status(500, "boom").is_retryable());
        assert!(RequestError::from_status(429, "slow down").is_retryable());
        assert!(RequestError::from_status(408, "too slow").is_retryable());
        assert!(RequestError::Timeout(Duration::from_secs(5)).is_retryable());

        assert!(!RequestError::from_status(400, "bad").is_retryable());
        assert!(!RequestError::from_status(404, "missing").is_retryable());
        assert!(!RequestError::Cancelled.is_retryable());
        assert!(!RequestError::Decode("eof".into()).is_retryable());
    }

    #[test]
    fn test_status_accessor() {
        assert_eq!(RequestError::from_status(422, "x").status(), Some(422));
        assert_eq!(RequestError::Network("x".into()).status(), None);
    }

    #[test]
    fn test_json_error_is_decode() {
        let err: RequestError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), "decode");
    }
}
