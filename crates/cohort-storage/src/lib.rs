//! # Cohort Storage
//!
//! The local repository interface used by the cohort layer:
//!
//! - [`CohortRegistryStore`]: this member's registration and its peers', per cohort
//! - [`TypeDefStore`]: type definitions usable in the local repository
//! - [`InstanceStore`]: entities and relationships, home instances and reference copies
//! - [`KeyedLocks`]: per-key exclusive update discipline shared by all writers
//!
//! In-memory implementations are provided for every store, plus a JSON file
//! backed registry store.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod locks;
mod registry;
mod repository;

pub use error::{Result, StorageError};
pub use locks::{KeyGuard, KeyedLocks};
pub use registry::{CohortRegistryStore, FileRegistryStore, MemoryRegistryStore};
pub use repository::{InstanceStore, MemoryInstanceStore, MemoryTypeDefStore, TypeDefStore};
