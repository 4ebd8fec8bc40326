//! Registration lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The state of this member's participation in one cohort.
///
/// ```text
/// Disconnected -> Connecting -> Registering -> Active -> Disconnecting -> Disconnected
///                                       \________\______> Unregistering -> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortState {
    /// Not connected to the cohort.
    Disconnected,
    /// Subscribed to the cohort topic, not yet registered.
    Connecting,
    /// Registration sent, waiting for a peer round trip.
    Registering,
    /// At least one peer has answered.
    Active,
    /// Temporarily leaving the cohort; the registration is kept.
    Disconnecting,
    /// Permanently leaving the cohort.
    Unregistering,
}

impl CohortState {
    /// Returns true if this member's registration has been sent.
    #[must_use]
    pub const fn is_registered(&self) -> bool {
        matches!(self, CohortState::Registering | CohortState::Active)
    }

    /// Returns true if inbound events may be dispatched.
    #[must_use]
    pub const fn accepts_events(&self) -> bool {
        matches!(
            self,
            CohortState::Connecting | CohortState::Registering | CohortState::Active
        )
    }

    /// Returns true if the lifecycle allows moving to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: CohortState) -> bool {
        use CohortState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Registering)
                | (Registering, Active)
                | (Connecting | Registering | Active, Disconnecting)
                | (Connecting | Registering | Active, Unregistering)
                | (_, Disconnected)
        )
    }
}

impl fmt::Display for CohortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CohortState::Disconnected => "disconnected",
            CohortState::Connecting => "connecting",
            CohortState::Registering => "registering",
            CohortState::Active => "active",
            CohortState::Disconnecting => "disconnecting",
            CohortState::Unregistering => "unregistering",
        };
        f.write_str(name)
    }
}
