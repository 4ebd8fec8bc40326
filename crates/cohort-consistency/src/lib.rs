//! # Cohort Consistency
//!
//! Keeps a member's type definitions and instances consistent with the rest
//! of its cohorts.
//!
//! - [`TypeDefReconciler`] applies new types, patches and removals, and
//!   compares the type summaries peers advertise when they register.
//! - [`InstanceConsistencyEngine`] applies instance events, detects guid
//!   collisions and type conflicts, and mutates instances homed locally.
//!
//! Conflicts between members are never errors. They are audited and come back
//! as an outcome carrying the corrective events to publish.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod instances;
mod typedefs;
mod watermark;

pub use error::{ConsistencyError, Result};
pub use instances::{InstanceConsistencyEngine, InstanceDisposition, InstanceOutcome};
pub use typedefs::{
    InstanceTypeCheck, TypeDefCompatibility, TypeDefDisposition, TypeDefOutcome,
    TypeDefReconciler,
};
pub use watermark::{DEFAULT_WATERMARK_LIMIT, DEFAULT_WATERMARK_RETENTION};
