//! # Cohort Registry
//!
//! Manages this member's participation in a cohort: the registration
//! lifecycle, the stored view of peer members and the detection of peer
//! identity conflicts.
//!
//! ## Lifecycle
//!
//! A [`CohortRegistry`] starts [`CohortState::Disconnected`]. `connect`
//! verifies the registry store, `register` broadcasts this member's
//! registration and the first peer registration or refresh received makes
//! the registry [`CohortState::Active`].
//!
//! Operations return the [`cohort_types::CohortEvent`]s to publish; sending
//! them is left to the caller so that send failures can be retried by its
//! own policy.
//!
//! ## Peer routing
//!
//! Every accepted peer is added to the shared [`PeerDirectory`], which builds
//! a [`PeerConnector`] from the peer's connection descriptor. Members that
//! have left every cohort are no longer routable.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod connector;
mod error;
mod registry;
mod state;

pub use connector::{PeerConnector, PeerConnectorFactory, PeerDirectory, UnsupportedConnectorFactory};
pub use error::{RegistryError, Result};
pub use registry::{CohortRegistry, Disposition, RegistrationOutcome, SuspectReason};
pub use state::CohortState;
