//! # Cohort Audit
//!
//! Severity-coded audit trail for cohort federation. Every component reports
//! protocol conditions through an [`AuditTrail`], which formats the message
//! from a static catalogue and fans the record out to the configured
//! destinations.
//!
//! ## Example
//!
//! ```rust
//! use cohort_audit::{codes, AuditOriginator, AuditTrail, MemoryDestination};
//! use std::sync::Arc;
//!
//! let memory = Arc::new(MemoryDestination::new());
//! let trail = Arc::new(
//!     AuditTrail::new(AuditOriginator::new("server-a", "mc-1"))
//!         .with_destination(memory.clone()),
//! );
//!
//! let audit = trail.component("registry");
//! audit.log(codes::COHORT_CONNECTING, &["cohortA"]);
//!
//! assert_eq!(memory.recent(1)[0].formatted_message, "Connecting to cohort cohortA");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod catalogue;
mod destination;
mod error;
mod record;
mod severity;
mod trail;

pub use catalogue::{codes, definitions, format_message, lookup, AuditDefinition};
pub use destination::{
    AuditDestination, AuditQuery, AuditQueryBuilder, DestinationDescriptor, JsonLinesDestination,
    MemoryDestination, TracingDestination,
};
pub use error::{AuditError, Result};
pub use record::{AuditLogRecord, AuditOriginator};
pub use severity::Severity;
pub use trail::{AuditTrail, ComponentAudit};
