//! Registration lifecycle for one cohort.

use crate::{CohortState, PeerDirectory, RegistryError, Result};
use cohort_audit::{codes, ComponentAudit};
use cohort_storage::{CohortRegistryStore, KeyedLocks, StorageError};
use cohort_types::{
    CohortEvent, EventOriginator, MemberRegistration, RegistrationErrorCode, RegistryEvent,
    TypeDefSummary,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Why an accepted registration is suspect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspectReason {
    /// No network address was supplied.
    MissingAddress,
    /// No connection descriptor was supplied.
    MissingConnection,
    /// Server name already used by another collection id.
    DuplicateServerName(String),
    /// Network address already used by another collection id.
    DuplicateAddress(String),
    /// Connection descriptor already used by another collection id.
    DuplicateConnection(String),
}

/// What happened to an incoming registration or refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Stored. `new` is true if the member was not known before.
    Accepted {
        /// True for a first-seen member.
        new: bool,
    },
    /// Missing mandatory fields.
    Rejected,
    /// The collection id is already used by a different server.
    Conflict,
    /// This member's own registration.
    Ignored,
}

/// Result of processing an incoming registration or refresh.
#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    /// What happened.
    pub disposition: Disposition,
    /// The registration as stored, when accepted.
    pub registration: Option<MemberRegistration>,
    /// Reasons the registration is suspect.
    pub suspect: Vec<SuspectReason>,
    /// Events to publish in reply.
    pub outbound: Vec<CohortEvent>,
}

impl RegistrationOutcome {
    fn new(disposition: Disposition) -> Self {
        Self {
            disposition,
            registration: None,
            suspect: Vec::new(),
            outbound: Vec::new(),
        }
    }

    /// Returns true if the registration was stored.
    pub fn is_accepted(&self) -> bool {
        matches!(self.disposition, Disposition::Accepted { .. })
    }
}

/// This member's participation in one cohort and its view of the peers.
pub struct CohortRegistry {
    cohort: String,
    local: RwLock<MemberRegistration>,
    state: RwLock<CohortState>,
    store: Arc<dyn CohortRegistryStore>,
    directory: Arc<PeerDirectory>,
    audit: ComponentAudit,
    locks: KeyedLocks,
    suspects: DashMap<String, Vec<SuspectReason>>,
}

impl std::fmt::Debug for CohortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CohortRegistry")
            .field("cohort", &self.cohort)
            .field("state", &self.state())
            .finish()
    }
}

impl CohortRegistry {
    /// Creates a registry for `cohort`.
    ///
    /// `local` must carry a metadata collection id and a server name.
    pub fn new(
        cohort: impl Into<String>,
        local: MemberRegistration,
        store: Arc<dyn CohortRegistryStore>,
        directory: Arc<PeerDirectory>,
        audit: ComponentAudit,
    ) -> Result<Self> {
        if local.collection_id().is_empty() {
            return Err(RegistryError::InvalidRegistration(
                "metadata collection id is required".into(),
            ));
        }
        if local.name().is_empty() {
            return Err(RegistryError::InvalidRegistration(
                "server name is required".into(),
            ));
        }

        Ok(Self {
            cohort: cohort.into(),
            local: RwLock::new(local),
            state: RwLock::new(CohortState::Disconnected),
            store,
            directory,
            audit,
            locks: KeyedLocks::new(),
            suspects: DashMap::new(),
        })
    }

    /// Returns the cohort name.
    pub fn cohort_name(&self) -> &str {
        &self.cohort
    }

    /// Returns the current state.
    pub fn state(&self) -> CohortState {
        *self.state.read()
    }

    /// Returns this member's registration.
    pub fn local_registration(&self) -> MemberRegistration {
        self.local.read().clone()
    }

    /// Returns this member's metadata collection id.
    pub fn local_collection_id(&self) -> String {
        self.local.read().collection_id().to_string()
    }

    /// Returns the originator stamped on this member's events.
    pub fn originator(&self) -> EventOriginator {
        let local = self.local.read();
        EventOriginator {
            metadata_collection_id: local.metadata_collection_id.clone(),
            server_name: local.server_name.clone(),
            server_type: local.server_type.clone(),
            organization_name: local.organization_name.clone(),
        }
    }

    /// Replaces the type summaries carried by this member's registration.
    pub fn update_type_summaries(&self, summaries: Vec<TypeDefSummary>) {
        self.local.write().type_summaries = summaries;
    }

    /// Returns the directory of routable members shared by every cohort.
    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    /// Returns every stored peer registration.
    pub async fn peers(&self) -> Result<Vec<MemberRegistration>> {
        Ok(self.store.retrieve_remote_registrations().await?)
    }

    /// Returns a stored peer registration.
    pub async fn peer(&self, metadata_collection_id: &str) -> Result<Option<MemberRegistration>> {
        Ok(self
            .store
            .retrieve_remote_registration(metadata_collection_id)
            .await?)
    }

    /// Returns the reasons a peer's registration is suspect.
    pub fn suspect_reasons(&self, metadata_collection_id: &str) -> Vec<SuspectReason> {
        self.suspects
            .get(metadata_collection_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn transition(&self, next: CohortState) {
        let mut state = self.state.write();
        if *state == next {
            return;
        }
        if !state.can_transition_to(next) {
            tracing::warn!(cohort = %self.cohort, from = %*state, to = %next, "unexpected cohort state change");
        }
        tracing::info!(cohort = %self.cohort, from = %*state, to = %next, "cohort state changed");
        *state = next;
    }

    fn require(&self, operation: &'static str, allowed: impl Fn(CohortState) -> bool) -> Result<()> {
        let state = self.state();
        if allowed(state) {
            Ok(())
        } else {
            Err(RegistryError::InvalidState {
                cohort: self.cohort.clone(),
                operation,
                state,
            })
        }
    }

    /// Audits a store failure and stops participation in this cohort.
    fn store_failed(&self, operation: &str, error: StorageError) -> RegistryError {
        self.audit.log_exception(
            codes::REGISTRY_STORE_FAILED,
            &[&self.cohort, operation],
            &error,
        );
        self.transition(CohortState::Disconnected);
        RegistryError::Store(error)
    }

    fn event(&self, event: RegistryEvent) -> CohortEvent {
        CohortEvent::registry(self.originator(), event)
    }

    /// Starts participating in the cohort.
    ///
    /// Verifies the registry store is usable and restores the registration
    /// time of a previous registration.
    pub async fn connect(&self) -> Result<()> {
        if self.state() != CohortState::Disconnected {
            return Ok(());
        }
        self.audit.log(codes::COHORT_CONNECTING, &[&self.cohort]);

        let previous = self
            .store
            .retrieve_local_registration()
            .await
            .map_err(|e| self.store_failed("connect", e))?;
        if let Some(previous) = previous {
            let mut local = self.local.write();
            if previous.collection_id() == local.collection_id() {
                local.registration_time = previous.registration_time;
            }
        }

        self.transition(CohortState::Connecting);
        Ok(())
    }

    /// Broadcasts this member's registration.
    ///
    /// Safe to repeat: an active registry stays active.
    pub async fn register(&self) -> Result<Vec<CohortEvent>> {
        self.require("register", |s| {
            matches!(
                s,
                CohortState::Connecting | CohortState::Registering | CohortState::Active
            )
        })?;

        let local = self.local_registration();
        self.store
            .save_local_registration(&local)
            .await
            .map_err(|e| self.store_failed("register", e))?;

        self.audit.log(
            codes::COHORT_REGISTERING,
            &[&self.cohort, local.collection_id()],
        );
        if self.state() == CohortState::Connecting {
            self.transition(CohortState::Registering);
        }

        Ok(vec![self.event(RegistryEvent::Registration(local))])
    }

    /// Re-broadcasts this member's registration.
    pub async fn refresh_registration(&self) -> Result<Vec<CohortEvent>> {
        self.require("refresh", |s| s.is_registered())?;

        let local = self.local_registration();
        self.store
            .save_local_registration(&local)
            .await
            .map_err(|e| self.store_failed("refresh", e))?;

        self.audit.log(codes::COHORT_REFRESHING, &[&self.cohort]);
        Ok(vec![self.event(RegistryEvent::Refresh(local))])
    }

    /// Asks every member to re-broadcast its registration.
    pub fn request_refresh(&self) -> Result<Vec<CohortEvent>> {
        self.require("request refresh", |s| s.accepts_events())?;
        self.audit
            .log(codes::COHORT_REFRESH_REQUESTED, &[&self.cohort]);
        Ok(vec![self.event(RegistryEvent::RefreshRequest)])
    }

    /// Answers a peer's refresh request.
    pub async fn on_refresh_request(&self) -> Result<Vec<CohortEvent>> {
        if !self.state().is_registered() {
            return Ok(Vec::new());
        }
        self.refresh_registration().await
    }

    /// Processes a peer's registration.
    pub async fn on_incoming_registration(
        &self,
        registration: MemberRegistration,
    ) -> Result<RegistrationOutcome> {
        self.process_incoming(registration, false).await
    }

    /// Processes a peer's refresh.
    pub async fn on_incoming_refresh(
        &self,
        registration: MemberRegistration,
    ) -> Result<RegistrationOutcome> {
        self.process_incoming(registration, true).await
    }

    async fn process_incoming(
        &self,
        registration: MemberRegistration,
        is_refresh: bool,
    ) -> Result<RegistrationOutcome> {
        let Some(id) = registration.metadata_collection_id.clone() else {
            self.audit.log(
                codes::REGISTRATION_MISSING_COLLECTION_ID,
                &[registration.name(), &self.cohort],
            );
            return Ok(RegistrationOutcome::new(Disposition::Rejected));
        };
        if registration.server_name.is_none() {
            self.audit.log(
                codes::REGISTRATION_MISSING_SERVER_NAME,
                &[&id, &self.cohort],
            );
            return Ok(RegistrationOutcome::new(Disposition::Rejected));
        }

        let local = self.local_registration();
        if id == local.collection_id() {
            if registration.same_identity(&local) {
                return Ok(RegistrationOutcome::new(Disposition::Ignored));
            }
            self.audit.log(
                codes::INCOMING_CONFLICTING_LOCAL_METADATA_COLLECTION_ID,
                &[registration.name(), &self.cohort, &id],
            );
            let mut outcome = RegistrationOutcome::new(Disposition::Conflict);
            outcome
                .outbound
                .push(self.event(RegistryEvent::RegistrationError {
                    target: id.clone(),
                    code: RegistrationErrorCode::ConflictingCollectionId,
                    message: format!(
                        "metadata collection id {id} is already used by server {}",
                        local.name()
                    ),
                }));
            return Ok(outcome);
        }

        let _guard = self.locks.lock(&id).await;

        let existing = self
            .store
            .retrieve_remote_registration(&id)
            .await
            .map_err(|e| self.store_failed("retrieve registration", e))?;

        if let Some(ref existing) = existing {
            if !existing.same_identity(&registration) {
                self.audit.log(
                    codes::INCOMING_CONFLICTING_METADATA_COLLECTION_ID,
                    &[registration.name(), &self.cohort, &id, existing.name()],
                );
                return Ok(RegistrationOutcome::new(Disposition::Conflict));
            }
        }

        let others = self
            .store
            .retrieve_remote_registrations()
            .await
            .map_err(|e| self.store_failed("retrieve registrations", e))?;
        let suspect = self.check_suspect(&id, &registration, &others);

        let mut stored = registration;
        if let Some(ref existing) = existing {
            stored.registration_time = existing.registration_time;
        }
        self.store
            .save_remote_registration(&stored)
            .await
            .map_err(|e| self.store_failed("save registration", e))?;

        if suspect.is_empty() {
            self.suspects.remove(&id);
        } else {
            self.suspects.insert(id.clone(), suspect.clone());
        }
        self.directory.add(&self.cohort, &stored);

        let new = existing.is_none();
        let code = if new {
            codes::NEW_MEMBER_REGISTERED
        } else {
            codes::MEMBER_REFRESHED
        };
        self.audit.log(code, &[stored.name(), &id, &self.cohort]);

        if self.state() == CohortState::Registering {
            self.transition(CohortState::Active);
            self.audit
                .log(codes::COHORT_ACTIVE, &[&self.cohort, stored.name()]);
        }

        let mut outbound = Vec::new();
        if new && !is_refresh && self.state().is_registered() {
            outbound.push(self.event(RegistryEvent::Refresh(self.local_registration())));
        }

        Ok(RegistrationOutcome {
            disposition: Disposition::Accepted { new },
            registration: Some(stored),
            suspect,
            outbound,
        })
    }

    fn check_suspect(
        &self,
        id: &str,
        registration: &MemberRegistration,
        others: &[MemberRegistration],
    ) -> Vec<SuspectReason> {
        let mut reasons = Vec::new();
        let name = registration.name();

        match registration.network_address.as_deref() {
            None => {
                self.audit.log(
                    codes::REGISTRATION_MISSING_ADDRESS,
                    &[name, id, &self.cohort],
                );
                reasons.push(SuspectReason::MissingAddress);
            }
            Some(address) => {
                for other in others.iter().filter(|o| o.collection_id() != id) {
                    if other.network_address.as_deref() == Some(address) {
                        self.audit.log(
                            codes::DUPLICATE_NETWORK_ADDRESS,
                            &[id, &self.cohort, address, other.collection_id()],
                        );
                        reasons.push(SuspectReason::DuplicateAddress(
                            other.collection_id().to_string(),
                        ));
                    }
                }
            }
        }

        match registration.connection_descriptor {
            None => {
                self.audit.log(
                    codes::REGISTRATION_MISSING_CONNECTION,
                    &[name, id, &self.cohort],
                );
                reasons.push(SuspectReason::MissingConnection);
            }
            Some(ref descriptor) => {
                for other in others.iter().filter(|o| o.collection_id() != id) {
                    if other.connection_descriptor.as_ref() == Some(descriptor) {
                        self.audit.log(
                            codes::DUPLICATE_CONNECTION,
                            &[id, &self.cohort, other.collection_id()],
                        );
                        reasons.push(SuspectReason::DuplicateConnection(
                            other.collection_id().to_string(),
                        ));
                    }
                }
            }
        }

        for other in others.iter().filter(|o| o.collection_id() != id) {
            if other.server_name == registration.server_name {
                self.audit.log(
                    codes::DUPLICATE_SERVER_NAME,
                    &[id, &self.cohort, name, other.collection_id()],
                );
                reasons.push(SuspectReason::DuplicateServerName(
                    other.collection_id().to_string(),
                ));
            }
        }

        reasons
    }

    /// Removes a member that has unregistered.
    ///
    /// The request is ignored if it comes from a different server than the
    /// one registered under the id. Returns true if the member was removed.
    pub async fn on_incoming_unregistration(
        &self,
        metadata_collection_id: &str,
        server_name: Option<&str>,
    ) -> Result<bool> {
        let _guard = self.locks.lock(metadata_collection_id).await;

        let existing = self
            .store
            .retrieve_remote_registration(metadata_collection_id)
            .await
            .map_err(|e| self.store_failed("retrieve registration", e))?;
        let Some(existing) = existing else {
            return Ok(false);
        };
        if server_name.is_some() && existing.server_name.as_deref() != server_name {
            tracing::debug!(
                cohort = %self.cohort,
                member = metadata_collection_id,
                "ignoring unregistration from a different server"
            );
            return Ok(false);
        }

        self.store
            .remove_remote_registration(metadata_collection_id)
            .await
            .map_err(|e| self.store_failed("remove registration", e))?;
        self.suspects.remove(metadata_collection_id);
        self.directory.remove(&self.cohort, metadata_collection_id);

        self.audit.log(
            codes::MEMBER_UNREGISTERED,
            &[metadata_collection_id, &self.cohort],
        );
        Ok(true)
    }

    /// Processes a peer's refusal of a registration. Returns true if this
    /// member was the one refused.
    pub fn on_incoming_registration_error(
        &self,
        from: &EventOriginator,
        target: &str,
        message: &str,
    ) -> bool {
        if target != self.local_collection_id() {
            return false;
        }
        self.audit.log(
            codes::REGISTRATION_ERROR,
            &[from.name(), &self.cohort, message],
        );
        true
    }

    /// Stops participating in the cohort, keeping the registration.
    pub fn disconnect(&self) {
        let state = self.state();
        if matches!(
            state,
            CohortState::Disconnected | CohortState::Disconnecting | CohortState::Unregistering
        ) {
            return;
        }
        self.audit.log(codes::COHORT_DISCONNECTING, &[&self.cohort]);
        self.transition(CohortState::Disconnecting);
    }

    /// Permanently leaves the cohort.
    ///
    /// Purges this member's own registration; peer registrations are kept.
    /// Returns the unregistration event to broadcast.
    pub async fn unregister(&self) -> Result<Vec<CohortEvent>> {
        self.require("unregister", |s| s.accepts_events())?;

        self.audit.log(codes::COHORT_UNREGISTERING, &[&self.cohort]);
        self.transition(CohortState::Unregistering);

        self.store
            .remove_local_registration()
            .await
            .map_err(|e| self.store_failed("unregister", e))?;

        Ok(vec![self.event(RegistryEvent::Unregistration)])
    }

    /// Completes a disconnect or unregistration once in-flight work is done.
    pub fn complete_disconnect(&self) {
        self.transition(CohortState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UnsupportedConnectorFactory;
    use async_trait::async_trait;
    use cohort_audit::{AuditOriginator, AuditTrail, MemoryDestination};
    use cohort_storage::MemoryRegistryStore;
    use std::time::Duration;

    struct Fixture {
        registry: CohortRegistry,
        store: Arc<MemoryRegistryStore>,
        memory: Arc<MemoryDestination>,
        directory: Arc<PeerDirectory>,
    }

    fn local() -> MemberRegistration {
        MemberRegistration::new("mc-self", "self")
            .with_network_address("self:9443")
            .with_connection(serde_json::json!({"endpoint": "self"}))
    }

    fn peer(id: &str, name: &str) -> MemberRegistration {
        MemberRegistration::new(id, name)
            .with_network_address(format!("{name}:9443"))
            .with_connection(serde_json::json!({ "endpoint": name }))
    }

    fn fixture() -> Fixture {
        let memory = Arc::new(MemoryDestination::new());
        let trail = Arc::new(
            AuditTrail::new(AuditOriginator::new("self", "mc-self"))
                .with_destination(memory.clone()),
        );
        let store = Arc::new(MemoryRegistryStore::new());
        let directory = Arc::new(PeerDirectory::new(Arc::new(UnsupportedConnectorFactory)));
        let registry = CohortRegistry::new(
            "cohortA",
            local(),
            store.clone(),
            directory.clone(),
            trail.component("registry"),
        )
        .unwrap();
        Fixture {
            registry,
            store,
            memory,
            directory,
        }
    }

    #[tokio::test]
    async fn test_register_lifecycle() {
        let f = fixture();
        assert!(f.registry.register().await.is_err());

        f.registry.connect().await.unwrap();
        assert_eq!(f.registry.state(), CohortState::Connecting);

        let events = f.registry.register().await.unwrap();
        assert_eq!(events[0].kind(), "registration");
        assert_eq!(f.registry.state(), CohortState::Registering);

        let again = f.registry.register().await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(f.registry.state(), CohortState::Registering);

        let outcome = f
            .registry
            .on_incoming_registration(peer("mc-2", "peer"))
            .await
            .unwrap();
        assert_eq!(outcome.disposition, Disposition::Accepted { new: true });
        assert_eq!(f.registry.state(), CohortState::Active);
        assert!(f.memory.contains(codes::COHORT_ACTIVE));

        // First-seen member gets this member's registration back.
        assert_eq!(outcome.outbound.len(), 1);
        assert_eq!(outcome.outbound[0].kind(), "refresh");

        f.registry.register().await.unwrap();
        assert_eq!(f.registry.state(), CohortState::Active);
    }

    #[tokio::test]
    async fn test_conflicting_collection_id() {
        let f = fixture();
        f.registry.connect().await.unwrap();

        let x = peer("mc-1", "X");
        f.registry.on_incoming_registration(x.clone()).await.unwrap();

        let outcome = f
            .registry
            .on_incoming_registration(peer("mc-1", "Y"))
            .await
            .unwrap();
        assert_eq!(outcome.disposition, Disposition::Conflict);

        let stored = f.registry.peers().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name(), "X");

        let records = f
            .memory
            .by_message_id(codes::INCOMING_CONFLICTING_METADATA_COLLECTION_ID);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity, cohort_audit::Severity::Action);
    }

    #[tokio::test]
    async fn test_refresh_updates_without_identity_change() {
        let f = fixture();
        f.registry.connect().await.unwrap();

        let original = peer("mc-2", "peer");
        f.registry
            .on_incoming_registration(original.clone())
            .await
            .unwrap();

        let mut moved = peer("mc-2", "peer").with_network_address("peer-new:9443");
        moved.registration_time = original.registration_time + Duration::from_secs(5);
        let outcome = f.registry.on_incoming_refresh(moved).await.unwrap();
        assert_eq!(outcome.disposition, Disposition::Accepted { new: false });
        assert!(outcome.outbound.is_empty());

        let stored = f.registry.peer("mc-2").await.unwrap().unwrap();
        assert_eq!(stored.network_address.as_deref(), Some("peer-new:9443"));
        assert_eq!(stored.registration_time, original.registration_time);
        assert!(f.memory.contains(codes::MEMBER_REFRESHED));
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let f = fixture();
        f.registry.connect().await.unwrap();

        let mut no_id = peer("mc-2", "peer");
        no_id.metadata_collection_id = None;
        let outcome = f.registry.on_incoming_registration(no_id).await.unwrap();
        assert_eq!(outcome.disposition, Disposition::Rejected);
        assert!(f.memory.contains(codes::REGISTRATION_MISSING_COLLECTION_ID));

        let mut no_name = peer("mc-3", "peer");
        no_name.server_name = None;
        let outcome = f.registry.on_incoming_registration(no_name).await.unwrap();
        assert_eq!(outcome.disposition, Disposition::Rejected);
        assert!(f.store.retrieve_remote_registrations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_suspect_registrations_accepted() {
        let f = fixture();
        f.registry.connect().await.unwrap();
        f.registry
            .on_incoming_registration(peer("mc-2", "peer"))
            .await
            .unwrap();

        let bare = MemberRegistration::new("mc-3", "bare");
        let outcome = f.registry.on_incoming_registration(bare).await.unwrap();
        assert!(outcome.is_accepted());
        assert_eq!(
            outcome.suspect,
            vec![SuspectReason::MissingAddress, SuspectReason::MissingConnection]
        );

        let twin = peer("mc-4", "peer");
        let outcome = f.registry.on_incoming_registration(twin).await.unwrap();
        assert!(outcome.is_accepted());
        assert!(outcome
            .suspect
            .contains(&SuspectReason::DuplicateServerName("mc-2".into())));
        assert!(outcome
            .suspect
            .contains(&SuspectReason::DuplicateAddress("mc-2".into())));
        assert!(outcome
            .suspect
            .contains(&SuspectReason::DuplicateConnection("mc-2".into())));
        assert_eq!(f.registry.suspect_reasons("mc-4").len(), 3);
        assert!(f.memory.contains(codes::DUPLICATE_SERVER_NAME));
    }

    #[tokio::test]
    async fn test_local_collection_id_reused() {
        let f = fixture();
        f.registry.connect().await.unwrap();

        let echo = f
            .registry
            .on_incoming_registration(local())
            .await
            .unwrap();
        assert_eq!(echo.disposition, Disposition::Ignored);

        let impostor = peer("mc-self", "other");
        let outcome = f.registry.on_incoming_registration(impostor).await.unwrap();
        assert_eq!(outcome.disposition, Disposition::Conflict);
        assert_eq!(outcome.outbound[0].kind(), "registration_error");
        assert!(f
            .memory
            .contains(codes::INCOMING_CONFLICTING_LOCAL_METADATA_COLLECTION_ID));
    }

    #[tokio::test]
    async fn test_unregistration() {
        let f = fixture();
        f.registry.connect().await.unwrap();
        f.registry
            .on_incoming_registration(peer("mc-2", "peer"))
            .await
            .unwrap();
        assert!(f.directory.is_member("mc-2"));

        assert!(!f
            .registry
            .on_incoming_unregistration("mc-2", Some("impostor"))
            .await
            .unwrap());
        assert!(f
            .registry
            .on_incoming_unregistration("mc-2", Some("peer"))
            .await
            .unwrap());
        assert!(!f.directory.is_member("mc-2"));
        assert!(f.registry.peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_purges_local_only() {
        let f = fixture();
        f.registry.connect().await.unwrap();
        f.registry.register().await.unwrap();
        f.registry
            .on_incoming_registration(peer("mc-2", "peer"))
            .await
            .unwrap();

        let events = f.registry.unregister().await.unwrap();
        assert_eq!(events[0].kind(), "unregistration");
        assert_eq!(f.registry.state(), CohortState::Unregistering);
        f.registry.complete_disconnect();
        assert_eq!(f.registry.state(), CohortState::Disconnected);

        assert!(f.store.retrieve_local_registration().await.unwrap().is_none());
        assert_eq!(f.store.retrieve_remote_registrations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_registration_error_addressed_to_self() {
        let f = fixture();
        let from = EventOriginator::new("mc-self", "other");
        assert!(f
            .registry
            .on_incoming_registration_error(&from, "mc-self", "duplicate id"));
        assert!(!f
            .registry
            .on_incoming_registration_error(&from, "mc-9", "duplicate id"));
        assert_eq!(f.memory.by_message_id(codes::REGISTRATION_ERROR).len(), 1);
    }

    struct BrokenStore;

    #[async_trait]
    impl CohortRegistryStore for BrokenStore {
        async fn save_local_registration(&self, _: &MemberRegistration) -> cohort_storage::Result<()> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
        async fn retrieve_local_registration(
            &self,
        ) -> cohort_storage::Result<Option<MemberRegistration>> {
            Ok(None)
        }
        async fn remove_local_registration(&self) -> cohort_storage::Result<()> {
            Ok(())
        }
        async fn save_remote_registration(&self, _: &MemberRegistration) -> cohort_storage::Result<()> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
        async fn retrieve_remote_registration(
            &self,
            _: &str,
        ) -> cohort_storage::Result<Option<MemberRegistration>> {
            Ok(None)
        }
        async fn retrieve_remote_registrations(
            &self,
        ) -> cohort_storage::Result<Vec<MemberRegistration>> {
            Ok(Vec::new())
        }
        async fn remove_remote_registration(&self, _: &str) -> cohort_storage::Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_store_failure_stops_cohort() {
        let memory = Arc::new(MemoryDestination::new());
        let trail = Arc::new(
            AuditTrail::new(AuditOriginator::new("self", "mc-self"))
                .with_destination(memory.clone()),
        );
        let registry = CohortRegistry::new(
            "cohortA",
            local(),
            Arc::new(BrokenStore),
            Arc::new(PeerDirectory::new(Arc::new(UnsupportedConnectorFactory))),
            trail.component("registry"),
        )
        .unwrap();

        registry.connect().await.unwrap();
        let err = registry.register().await.unwrap_err();
        assert!(matches!(err, RegistryError::Store(_)));
        assert_eq!(registry.state(), CohortState::Disconnected);

        let records = memory.by_message_id(codes::REGISTRY_STORE_FAILED);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity, cohort_audit::Severity::Exception);
    }

    #[test]
    fn test_local_registration_required_fields() {
        let mut reg = local();
        reg.server_name = None;
        let result = CohortRegistry::new(
            "cohortA",
            reg,
            Arc::new(MemoryRegistryStore::new()),
            Arc::new(PeerDirectory::new(Arc::new(UnsupportedConnectorFactory))),
            Arc::new(AuditTrail::new(AuditOriginator::default())).component("registry"),
        );
        assert!(matches!(result, Err(RegistryError::InvalidRegistration(_))));
    }
}
