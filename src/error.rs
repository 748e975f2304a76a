//! Error types for replica-stage

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Blob exceeds the maximum allowed size of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("Insufficient local storage space: {available} bytes free, {minimum} bytes must remain")]
    InsufficientSpace { available: u64, minimum: u64 },

    #[error("Invalid blob ID: {0}")]
    InvalidId(String),

    #[error("Corrupt identifier mapping for blob {blob}: {reason}")]
    CorruptMapping { blob: String, reason: String },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Invalid seek: {0}")]
    InvalidSeek(String),

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },

    #[error("Aggregator error {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Aggregator resource already exists: {0}")]
    Conflict(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded while {0}")]
    DeadlineExceeded(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Whether the error means the blob or remote entry does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::BlobNotFound(_))
    }

    /// Whether a later attempt at the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Remote { status, .. } => *status >= 500 || *status == 429,
            StorageError::Http(_) | StorageError::InsufficientSpace { .. } => true,
            _ => false,
        }
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;
