//! Member registrations.

use crate::{Timestamp, TypeDefSummary};
use serde::{Deserialize, Serialize};

/// One member of a cohort, as announced on the registry topic.
///
/// Identity fields are optional on the wire so that a registration with a
/// missing `metadata_collection_id` or `server_name` can be detected and
/// rejected instead of failing to deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRegistration {
    /// Globally unique id of the member's owned metadata.
    pub metadata_collection_id: Option<String>,
    /// Name of the member's server.
    pub server_name: Option<String>,
    /// Kind of server (free text).
    #[serde(default)]
    pub server_type: Option<String>,
    /// Organization operating the server.
    #[serde(default)]
    pub organization_name: Option<String>,
    /// Address other members use to reach this one.
    #[serde(default)]
    pub network_address: Option<String>,
    /// Opaque description used to build a connector to the member.
    #[serde(default)]
    pub connection_descriptor: Option<serde_json::Value>,
    /// When the member first registered with the cohort.
    pub registration_time: Timestamp,
    /// Versions of the types the member currently holds.
    #[serde(default)]
    pub type_summaries: Vec<TypeDefSummary>,
}

impl MemberRegistration {
    /// Creates a registration with the mandatory identity fields set.
    pub fn new(metadata_collection_id: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            metadata_collection_id: Some(metadata_collection_id.into()),
            server_name: Some(server_name.into()),
            server_type: None,
            organization_name: None,
            network_address: None,
            connection_descriptor: None,
            registration_time: Timestamp::now(),
            type_summaries: Vec::new(),
        }
    }

    /// Sets the server type.
    pub fn with_server_type(mut self, server_type: impl Into<String>) -> Self {
        self.server_type = Some(server_type.into());
        self
    }

    /// Sets the organization name.
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization_name = Some(organization.into());
        self
    }

    /// Sets the network address.
    pub fn with_network_address(mut self, address: impl Into<String>) -> Self {
        self.network_address = Some(address.into());
        self
    }

    /// Sets the connection descriptor.
    pub fn with_connection(mut self, descriptor: serde_json::Value) -> Self {
        self.connection_descriptor = Some(descriptor);
        self
    }

    /// Sets the type summaries exchanged during the registration handshake.
    pub fn with_type_summaries(mut self, summaries: Vec<TypeDefSummary>) -> Self {
        self.type_summaries = summaries;
        self
    }

    /// Returns the collection id, or an empty string when it is missing.
    #[must_use]
    pub fn collection_id(&self) -> &str {
        self.metadata_collection_id.as_deref().unwrap_or_default()
    }

    /// Returns the server name, or an empty string when it is missing.
    #[must_use]
    pub fn name(&self) -> &str {
        self.server_name.as_deref().unwrap_or_default()
    }

    /// Returns true if `other` describes the same peer identity.
    ///
    /// A peer's identity is its server name; addresses and connections may
    /// change across refreshes.
    #[must_use]
    pub fn same_identity(&self, other: &MemberRegistration) -> bool {
        self.server_name == other.server_name
    }
}
