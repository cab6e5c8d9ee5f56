//! Error types for the sync engine

use error_common::RequestError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Request failed: {0}")]
    Request(#[from] RequestError),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Engine already disposed")]
    Disposed,
}

impl SyncError {
    /// Local persistence failures are non-fatal: callers degrade instead of
    /// propagating them to the UI.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            SyncError::Storage(_) | SyncError::StorageUnavailable(_) | SyncError::Deserialization(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
