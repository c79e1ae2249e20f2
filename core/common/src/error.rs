//! Common error types for KeepSync.

use thiserror::Error;

/// Top-level error type for KeepSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The retry queue is full. Never retried.
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Reachability probe or adapter call failed.
    #[error("Network error: {0}")]
    Network(String),

    /// Archive or manifest cannot be trusted.
    #[error("Corrupted or invalid archive: {0}")]
    Corruption(String),

    /// Disk I/O failed while building or persisting data.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A pool worker terminated while running the task.
    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    /// The pool was shut down before the task completed.
    #[error("Task pool terminated")]
    PoolTerminated,
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
