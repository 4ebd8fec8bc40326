//! # Cohort Types
//!
//! Core data model for cohort federation: member registrations, type
//! definitions, metadata instances and the event envelopes exchanged between
//! cohort members.
//!
//! ## Features
//!
//! - [`MemberRegistration`]: one peer's identity inside a cohort
//! - [`TypeDef`]: a named, versioned type description with a content fingerprint
//! - [`Instance`]: an entity or relationship with its home collection and provenance
//! - [`CohortEvent`]: typed events, with [`RawEvent`] as the wire envelope
//!
//! ## Example
//!
//! ```rust
//! use cohort_types::{CohortEvent, EventOriginator, RegistryEvent};
//!
//! let originator = EventOriginator::new("mc-1", "server-a");
//! let event = CohortEvent::registry(originator, RegistryEvent::RefreshRequest);
//! let bytes = event.encode().unwrap();
//! let decoded = CohortEvent::decode(&bytes).unwrap();
//! assert_eq!(decoded.kind(), "refresh_request");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event;
mod instance;
mod registration;
mod timestamp;
mod typedef;

pub use error::{DecodeError, Result, TypesError};
pub use event::{
    CohortEvent, EventBody, EventCategory, EventOriginator, InstanceEvent, RawEvent,
    RegistrationErrorCode, RegistryEvent, TypeDefEvent,
};
pub use instance::{Instance, InstanceKind, Provenance};
pub use registration::MemberRegistration;
pub use timestamp::Timestamp;
pub use typedef::{TypeDef, TypeDefCategory, TypeDefOrigin, TypeDefSummary};

/// Maximum encoded event size accepted from the bus (4 MB).
pub const MAX_EVENT_SIZE: usize = 4 * 1024 * 1024;
