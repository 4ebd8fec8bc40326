//! # Cohort Router
//!
//! Moves events between a cohort's bus topic and the local components.
//!
//! Inbound, an [`InboundListener`] reads the topic and an [`EventRouter`]
//! demultiplexes each event by category to the registry, the type
//! reconciler or the instance engine. Unknown, malformed and failing events
//! are audited and dropped without affecting the events around them.
//!
//! Outbound, events wait in an [`OutboundQueue`] until the [`EventBus`] is
//! ready and are sent with a [`RetryPolicy`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod error;
mod listener;
mod outbound;
mod retry;
mod router;

pub use bus::{EventBus, EventSubscription, MemoryEventBus};
pub use error::{Result, RouterError};
pub use listener::{InboundListener, DEFAULT_LANE_IDLE_TIMEOUT};
pub use outbound::OutboundQueue;
pub use retry::RetryPolicy;
pub use router::{EventRouter, RouteOutcome};

