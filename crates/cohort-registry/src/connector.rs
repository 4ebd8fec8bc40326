//! Connectors to peer members.

use crate::{RegistryError, Result};
use async_trait::async_trait;
use cohort_types::{Instance, InstanceKind, MemberRegistration};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Remote operations on a peer's repository.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Metadata collection id of the peer.
    fn metadata_collection_id(&self) -> &str;

    /// Asks the peer to change the guid of one of its home instances.
    ///
    /// Returns the instance under its new guid.
    async fn reidentify(&self, kind: InstanceKind, guid: &str, new_guid: &str) -> Result<Instance>;
}

/// Builds connectors from registration connection descriptors.
pub trait PeerConnectorFactory: Send + Sync {
    /// Creates a connector for `registration`.
    fn connect(&self, registration: &MemberRegistration) -> Result<Arc<dyn PeerConnector>>;
}

/// Factory for servers with no remote repository access configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedConnectorFactory;

impl PeerConnectorFactory for UnsupportedConnectorFactory {
    fn connect(&self, registration: &MemberRegistration) -> Result<Arc<dyn PeerConnector>> {
        Err(RegistryError::Connector(format!(
            "no connector implementation for member {}",
            registration.collection_id()
        )))
    }
}

struct PeerEntry {
    registration: MemberRegistration,
    cohorts: BTreeSet<String>,
    connector: Option<Arc<dyn PeerConnector>>,
}

/// Routable view of every member known through any cohort.
///
/// A member stays routable while at least one cohort lists it.
pub struct PeerDirectory {
    factory: Arc<dyn PeerConnectorFactory>,
    peers: DashMap<String, PeerEntry>,
}

impl fmt::Debug for PeerDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerDirectory")
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl PeerDirectory {
    /// Creates an empty directory.
    pub fn new(factory: Arc<dyn PeerConnectorFactory>) -> Self {
        Self {
            factory,
            peers: DashMap::new(),
        }
    }

    /// Records that `registration` is a member of `cohort`.
    ///
    /// The connector is rebuilt when the connection descriptor changes.
    pub fn add(&self, cohort: &str, registration: &MemberRegistration) {
        let Some(id) = registration.metadata_collection_id.clone() else {
            return;
        };

        let mut entry = self.peers.entry(id.clone()).or_insert_with(|| PeerEntry {
            registration: registration.clone(),
            cohorts: BTreeSet::new(),
            connector: None,
        });

        let descriptor_changed =
            entry.registration.connection_descriptor != registration.connection_descriptor;
        if entry.connector.is_none() || descriptor_changed {
            entry.connector = match registration.connection_descriptor {
                Some(_) => match self.factory.connect(registration) {
                    Ok(connector) => Some(connector),
                    Err(e) => {
                        tracing::debug!(member = %id, error = %e, "no connector for member");
                        None
                    }
                },
                None => None,
            };
        }

        entry.registration = registration.clone();
        entry.cohorts.insert(cohort.to_string());
    }

    /// Records that a member left `cohort`. Returns true if the member is no
    /// longer known through any cohort.
    pub fn remove(&self, cohort: &str, metadata_collection_id: &str) -> bool {
        let departed = match self.peers.get_mut(metadata_collection_id) {
            Some(mut entry) => {
                entry.cohorts.remove(cohort);
                entry.cohorts.is_empty()
            }
            None => return false,
        };
        if departed {
            self.peers.remove(metadata_collection_id);
        }
        departed
    }

    /// Returns the connector for a member, if the member is routable.
    pub fn connector(&self, metadata_collection_id: &str) -> Option<Arc<dyn PeerConnector>> {
        self.peers
            .get(metadata_collection_id)
            .and_then(|entry| entry.connector.clone())
    }

    /// Returns true if the member is known through at least one cohort.
    pub fn is_member(&self, metadata_collection_id: &str) -> bool {
        self.peers.contains_key(metadata_collection_id)
    }

    /// Returns the cohorts through which a member is known.
    pub fn cohorts_of(&self, metadata_collection_id: &str) -> Vec<String> {
        self.peers
            .get(metadata_collection_id)
            .map(|entry| entry.cohorts.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of known members.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if no member is known.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
