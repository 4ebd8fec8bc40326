//! Error types for event routing.

use cohort_consistency::ConsistencyError;
use cohort_registry::RegistryError;
use cohort_types::TypesError;
use thiserror::Error;

/// Result type alias for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;

/// Errors returned by the bus and the router.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The bus rejected a publish or subscribe.
    #[error("bus error: {0}")]
    Bus(String),

    /// The bus is not connected.
    #[error("bus not ready")]
    NotReady,

    /// An event could not be encoded.
    #[error("encoding error: {0}")]
    Encode(#[from] TypesError),

    /// A registry operation failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A type or instance operation failed.
    #[error("consistency error: {0}")]
    Consistency(#[from] ConsistencyError),
}
