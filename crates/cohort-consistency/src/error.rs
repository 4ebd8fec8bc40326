//! Error types for consistency processing.

use cohort_storage::StorageError;
use thiserror::Error;

/// Result type alias for consistency operations.
pub type Result<T> = std::result::Result<T, ConsistencyError>;

/// Errors returned by the reconciler and the instance engine.
///
/// Conflicts between members are not errors; they are audited and reported
/// through outcomes.
#[derive(Debug, Error)]
pub enum ConsistencyError {
    /// The local repository failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A local write targeted an instance homed in another member.
    #[error("instance {guid} is a reference copy homed in {home}")]
    ReferenceCopyReadOnly {
        /// Instance guid.
        guid: String,
        /// Home collection id.
        home: String,
    },

    /// The instance does not exist.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// The guid is already in use.
    #[error("guid already in use: {0}")]
    GuidInUse(String),

    /// The instance is missing mandatory fields.
    #[error("invalid instance: {0}")]
    InvalidInstance(String),

    /// The instance's type is not usable locally.
    #[error("type {name} ({guid}) is not known locally")]
    UnknownType {
        /// Type name.
        name: String,
        /// Type guid.
        guid: String,
    },

    /// The type definition conflicts with the cohort's definitions.
    #[error("type {0} conflicts with an existing definition")]
    TypeConflict(String),
}
