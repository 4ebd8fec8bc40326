//! Error types for the cohort server.

use cohort_audit::AuditError;
use cohort_consistency::ConsistencyError;
use cohort_registry::RegistryError;
use cohort_router::RouterError;
use cohort_storage::StorageError;
use thiserror::Error;

/// Errors that can occur while configuring or running a server.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Reading or writing a file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An audit destination could not be opened.
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    /// A store could not be opened.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A cohort registry operation failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A local type or instance change was refused.
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    /// Event routing failed.
    #[error("router error: {0}")]
    Router(#[from] RouterError),

    /// The server is not a member of the named cohort.
    #[error("unknown cohort: {0}")]
    UnknownCohort(String),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, NodeError>;
