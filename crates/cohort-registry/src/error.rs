//! Error types for cohort membership.

use crate::CohortState;
use cohort_storage::StorageError;
use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors returned by registry operations.
///
/// Protocol conflicts are never errors; they are audited and reported through
/// [`crate::RegistrationOutcome`].
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The operation is not allowed in the current state.
    #[error("cohort {cohort}: cannot {operation} while {state}")]
    InvalidState {
        /// Cohort name.
        cohort: String,
        /// Attempted operation.
        operation: &'static str,
        /// Current state.
        state: CohortState,
    },

    /// The local registration is unusable.
    #[error("invalid local registration: {0}")]
    InvalidRegistration(String),

    /// The registry store failed. Participation in the cohort has stopped.
    #[error("registry store failed: {0}")]
    Store(#[from] StorageError),

    /// No connector exists for the member.
    #[error("no connector for member {0}")]
    NoConnector(String),

    /// A connector could not be built or a remote call failed.
    #[error("connector error: {0}")]
    Connector(String),
}
