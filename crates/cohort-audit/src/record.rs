//! Audit log records.

use crate::Severity;
use cohort_types::Timestamp;
use serde::{Deserialize, Serialize};

/// The server stamped on every record it produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditOriginator {
    /// Server name.
    pub server_name: String,
    /// Server type.
    #[serde(default)]
    pub server_type: Option<String>,
    /// Organization operating the server.
    #[serde(default)]
    pub organization_name: Option<String>,
    /// Local metadata collection id.
    pub metadata_collection_id: String,
}

impl AuditOriginator {
    /// Creates an originator.
    pub fn new(server_name: impl Into<String>, metadata_collection_id: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            server_type: None,
            organization_name: None,
            metadata_collection_id: metadata_collection_id.into(),
        }
    }

    /// Sets the server type.
    pub fn with_server_type(mut self, server_type: impl Into<String>) -> Self {
        self.server_type = Some(server_type.into());
        self
    }

    /// Sets the organization.
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization_name = Some(organization.into());
        self
    }
}

/// An immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogRecord {
    /// Unique id of the record.
    pub guid: String,
    /// When the record was produced.
    pub timestamp: Timestamp,
    /// Server that produced it.
    pub originator: AuditOriginator,
    /// Component that reported the condition.
    pub reporting_component: String,
    /// Classification.
    pub severity: Severity,
    /// Catalogue id.
    pub message_id: String,
    /// Template with parameters substituted.
    pub formatted_message: String,
    /// Parameters used to format the message.
    #[serde(default)]
    pub parameters: Vec<String>,
    /// Diagnostic detail.
    #[serde(default)]
    pub additional_information: Vec<String>,
    /// What the system did.
    pub system_action: String,
    /// What an administrator should do.
    pub user_action: String,
}
