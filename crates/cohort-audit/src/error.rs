//! Error types for the audit crate.

use thiserror::Error;

/// Result type alias for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;

/// Errors raised by audit destinations.
///
/// The trail itself never returns these to its callers; they are logged and
/// swallowed per destination.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Audit record not found.
    #[error("audit record not found: {0}")]
    NotFound(String),

    /// The destination refused the record.
    #[error("audit destination {name} failed: {reason}")]
    Destination {
        /// Destination name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
