//! Error types for the storage crate.

use thiserror::Error;

/// Errors that can occur in local stores.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A row cannot be stored under the given key.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The persisted content could not be read back.
    #[error("corrupt store {path}: {reason}")]
    Corrupt {
        /// Location of the store.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
