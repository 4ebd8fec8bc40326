//! A cohort member server.
//!
//! One server holds one local repository and joins any number of cohorts.
//! The type reconciler, the instance engine and the peer directory are
//! shared by every cohort; each cohort has its own registry, router and
//! inbound listener.

use crate::config::{AuditDestinationConfig, RegistryStoreConfig, ServerConfig};
use crate::error::{NodeError, Result};
use cohort_audit::{
    codes, AuditDestination, AuditOriginator, AuditTrail, ComponentAudit, JsonLinesDestination,
    MemoryDestination, Severity, TracingDestination,
};
use cohort_consistency::{
    InstanceConsistencyEngine, InstanceOutcome, TypeDefOutcome, TypeDefReconciler,
    DEFAULT_WATERMARK_RETENTION,
};
use cohort_registry::{
    CohortRegistry, PeerConnectorFactory, PeerDirectory, UnsupportedConnectorFactory,
};
use cohort_router::{EventBus, EventRouter, InboundListener, MemoryEventBus};
use cohort_storage::{
    CohortRegistryStore, FileRegistryStore, InstanceStore, MemoryInstanceStore,
    MemoryRegistryStore, MemoryTypeDefStore, TypeDefStore,
};
use cohort_types::{CohortEvent, EventOriginator, Instance, MemberRegistration, TypeDef};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

fn severities_or_all(severities: &[Severity]) -> Vec<Severity> {
    if severities.is_empty() {
        Severity::ALL.to_vec()
    } else {
        severities.to_vec()
    }
}

/// Builds a [`CohortServer`] from a configuration and its collaborators.
///
/// Anything not supplied defaults to an in-memory implementation.
pub struct CohortServerBuilder {
    config: ServerConfig,
    bus: Option<Arc<dyn EventBus>>,
    type_store: Option<Arc<dyn TypeDefStore>>,
    instance_store: Option<Arc<dyn InstanceStore>>,
    connectors: Option<Arc<dyn PeerConnectorFactory>>,
    destinations: Vec<Arc<dyn AuditDestination>>,
}

impl CohortServerBuilder {
    /// Starts a builder for `config`.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            bus: None,
            type_store: None,
            instance_store: None,
            connectors: None,
            destinations: Vec::new(),
        }
    }

    /// Sets the event bus.
    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Sets the type definition store.
    pub fn type_store(mut self, store: Arc<dyn TypeDefStore>) -> Self {
        self.type_store = Some(store);
        self
    }

    /// Sets the instance store.
    pub fn instance_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.instance_store = Some(store);
        self
    }

    /// Sets the factory used to reach peers' repositories.
    pub fn connectors(mut self, factory: Arc<dyn PeerConnectorFactory>) -> Self {
        self.connectors = Some(factory);
        self
    }

    /// Adds an audit destination beyond the configured ones.
    pub fn audit_destination(mut self, destination: Arc<dyn AuditDestination>) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Validates the configuration and wires the server. Nothing is
    /// published until [`CohortServer::start`].
    pub async fn build(self) -> Result<CohortServer> {
        let mut config = self.config;
        config.validate()?;
        let id = config.ensure_collection_id().to_string();

        let mut originator = AuditOriginator::new(&config.server_name, &id);
        if let Some(server_type) = &config.server_type {
            originator = originator.with_server_type(server_type);
        }
        if let Some(organization) = &config.organization {
            originator = originator.with_organization(organization);
        }

        let mut trail = AuditTrail::new(originator);
        let mut memory = None;
        for destination in &config.audit {
            let destination: Arc<dyn AuditDestination> = match destination {
                AuditDestinationConfig::Tracing { severities } => Arc::new(
                    TracingDestination::new().with_severities(severities_or_all(severities)),
                ),
                AuditDestinationConfig::Memory {
                    capacity,
                    severities,
                } => {
                    let destination = Arc::new(
                        MemoryDestination::with_capacity(*capacity)
                            .with_severities(severities_or_all(severities)),
                    );
                    memory.get_or_insert_with(|| destination.clone());
                    destination
                }
                AuditDestinationConfig::JsonLines { path, severities } => Arc::new(
                    JsonLinesDestination::open(path)?
                        .with_severities(severities_or_all(severities)),
                ),
            };
            trail = trail.with_destination(destination);
        }
        for destination in self.destinations {
            trail = trail.with_destination(destination);
        }
        let trail = Arc::new(trail);

        let mut local = MemberRegistration::new(&id, &config.server_name);
        let mut event_originator = EventOriginator::new(&id, &config.server_name);
        if let Some(server_type) = &config.server_type {
            local = local.with_server_type(server_type);
            event_originator = event_originator.with_server_type(server_type);
        }
        if let Some(organization) = &config.organization {
            local = local.with_organization(organization);
            event_originator = event_originator.with_organization(organization);
        }
        if let Some(address) = &config.network_address {
            local = local.with_network_address(address);
        }
        if let Some(connection) = &config.connection {
            local = local.with_connection(connection.clone());
        }

        let directory = Arc::new(PeerDirectory::new(
            self.connectors
                .unwrap_or_else(|| Arc::new(UnsupportedConnectorFactory)),
        ));
        let types = Arc::new(
            TypeDefReconciler::new(
                event_originator.clone(),
                self.type_store
                    .unwrap_or_else(|| Arc::new(MemoryTypeDefStore::new())),
                trail.component("typedefs"),
            )
            .with_dynamic_types(config.dynamic_types),
        );
        let instances = Arc::new(InstanceConsistencyEngine::new(
            event_originator,
            self.instance_store
                .unwrap_or_else(|| Arc::new(MemoryInstanceStore::new())),
            types.clone(),
            directory.clone(),
            trail.component("instances"),
        )
        .with_watermark_limit(config.watermark_limit, DEFAULT_WATERMARK_RETENTION));
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(MemoryEventBus::new()));

        let mut routers = Vec::with_capacity(config.cohorts.len());
        for cohort in &config.cohorts {
            let store: Arc<dyn CohortRegistryStore> = match &cohort.registry {
                RegistryStoreConfig::Memory => Arc::new(MemoryRegistryStore::new()),
                RegistryStoreConfig::File { path } => {
                    Arc::new(FileRegistryStore::open(path).await?)
                }
            };
            let registry = Arc::new(CohortRegistry::new(
                &cohort.name,
                local.clone(),
                store,
                directory.clone(),
                trail.component(format!("registry:{}", cohort.name)),
            )?);
            let router = EventRouter::new(
                registry,
                types.clone(),
                instances.clone(),
                bus.clone(),
                trail.component(format!("router:{}", cohort.name)),
            )
            .with_topic(cohort.topic())
            .with_retry(config.retry.clone());
            routers.push(Arc::new(router));
        }

        tracing::info!(
            server = %config.server_name,
            metadata_collection_id = %id,
            cohorts = routers.len(),
            "cohort server built"
        );

        Ok(CohortServer {
            audit: trail.component("server"),
            config,
            trail,
            memory,
            directory,
            types,
            instances,
            bus,
            routers,
            listeners: Mutex::new(Vec::new()),
            left: Mutex::new(HashSet::new()),
        })
    }
}

/// A member of one or more cohorts.
pub struct CohortServer {
    config: ServerConfig,
    trail: Arc<AuditTrail>,
    audit: ComponentAudit,
    memory: Option<Arc<MemoryDestination>>,
    directory: Arc<PeerDirectory>,
    types: Arc<TypeDefReconciler>,
    instances: Arc<InstanceConsistencyEngine>,
    bus: Arc<dyn EventBus>,
    routers: Vec<Arc<EventRouter>>,
    listeners: Mutex<Vec<InboundListener>>,
    left: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for CohortServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CohortServer")
            .field("server", &self.config.server_name)
            .field("metadata_collection_id", &self.metadata_collection_id())
            .field("cohorts", &self.routers.len())
            .finish()
    }
}

impl CohortServer {
    /// Starts a builder for `config`.
    pub fn builder(config: ServerConfig) -> CohortServerBuilder {
        CohortServerBuilder::new(config)
    }

    /// Returns the configuration, including a generated collection id.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the server name.
    pub fn server_name(&self) -> &str {
        &self.config.server_name
    }

    /// Returns the local metadata collection id.
    pub fn metadata_collection_id(&self) -> &str {
        self.config.metadata_collection_id.as_deref().unwrap_or_default()
    }

    /// Returns the audit trail.
    pub fn trail(&self) -> &Arc<AuditTrail> {
        &self.trail
    }

    /// Returns the first configured memory audit destination.
    pub fn audit_log(&self) -> Option<&Arc<MemoryDestination>> {
        self.memory.as_ref()
    }

    /// Returns the peer directory.
    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    /// Returns the type reconciler.
    pub fn types(&self) -> &Arc<TypeDefReconciler> {
        &self.types
    }

    /// Returns the instance engine.
    pub fn instances(&self) -> &Arc<InstanceConsistencyEngine> {
        &self.instances
    }

    /// Returns the routers, one per cohort.
    pub fn routers(&self) -> &[Arc<EventRouter>] {
        &self.routers
    }

    /// Returns the router for `cohort`.
    pub fn router(&self, cohort: &str) -> Result<&Arc<EventRouter>> {
        self.routers
            .iter()
            .find(|r| r.cohort() == cohort)
            .ok_or_else(|| NodeError::UnknownCohort(cohort.to_string()))
    }

    /// Loads the held types, then connects to and registers with every
    /// cohort.
    ///
    /// A cohort that fails to start is audited and skipped; the others
    /// still start.
    pub async fn start(&self) -> Result<()> {
        if !self.listeners.lock().is_empty() {
            return Ok(());
        }
        self.audit.log(
            codes::SERVER_STARTING,
            &[self.server_name(), self.metadata_collection_id()],
        );

        let loaded = self.types.load().await?;
        tracing::debug!(types = loaded, "type definitions loaded");

        for router in &self.routers {
            let subscription = self.bus.subscribe(router.topic())?;
            let listener = InboundListener::spawn(router.clone(), subscription);
            self.listeners.lock().push(listener);

            if let Err(e) = router.start().await {
                tracing::error!(cohort = %router.cohort(), error = %e, "failed to join cohort");
            }
        }
        Ok(())
    }

    /// Re-broadcasts this member's registration to every cohort.
    pub async fn refresh(&self) -> Result<()> {
        self.sync_type_summaries();
        for router in self.active_routers() {
            router.refresh().await?;
        }
        Ok(())
    }

    /// Permanently leaves `cohort`.
    pub async fn leave(&self, cohort: &str) -> Result<()> {
        let router = self.router(cohort)?;
        router.unregister().await?;
        self.left.lock().insert(cohort.to_string());

        let listener = {
            let mut listeners = self.listeners.lock();
            listeners
                .iter()
                .position(|l| l.cohort() == cohort)
                .map(|i| listeners.remove(i))
        };
        if let Some(listener) = listener {
            listener.shutdown().await;
        }
        router.registry().complete_disconnect();
        Ok(())
    }

    /// Stops processing inbound events. Registrations are kept so the
    /// server can rejoin with [`CohortServer::start`].
    pub async fn stop(&self) {
        for router in &self.routers {
            router.registry().disconnect();
        }
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener.shutdown().await;
        }
        for router in &self.routers {
            router.registry().complete_disconnect();
        }
        self.audit
            .log(codes::SERVER_STOPPED, &[self.server_name()]);
    }

    fn active_routers(&self) -> Vec<Arc<EventRouter>> {
        let left = self.left.lock();
        self.routers
            .iter()
            .filter(|r| !left.contains(r.cohort()))
            .cloned()
            .collect()
    }

    /// Publishes events to every cohort this server has not left.
    pub async fn broadcast(&self, events: Vec<CohortEvent>) {
        if events.is_empty() {
            return;
        }
        for router in self.active_routers() {
            router.publish(events.clone()).await;
        }
    }

    fn sync_type_summaries(&self) {
        let summaries = self.types.summaries();
        for router in &self.routers {
            router.registry().update_type_summaries(summaries.clone());
        }
    }

    async fn publish_type_change(&self, outcome: TypeDefOutcome) -> TypeDefOutcome {
        if outcome.changed() {
            self.sync_type_summaries();
        }
        self.broadcast(outcome.outbound.clone()).await;
        outcome
    }

    /// Installs or upgrades a type definition in the local repository and
    /// announces it.
    pub async fn install_type(&self, typedef: TypeDef) -> Result<TypeDefOutcome> {
        let outcome = self.types.install_local(typedef).await?;
        Ok(self.publish_type_change(outcome).await)
    }

    /// Removes an ad hoc type definition and announces the removal.
    pub async fn remove_type(&self, guid: &str, requester: &str) -> Result<TypeDefOutcome> {
        let outcome = self.types.remove_type(guid, requester).await?;
        Ok(self.publish_type_change(outcome).await)
    }

    /// Returns the held copy of an instance.
    pub async fn instance(&self, guid: &str) -> Result<Option<Instance>> {
        Ok(self.instances.get(guid).await?)
    }

    /// Creates or updates an instance homed in this server and announces it.
    pub async fn save_instance(&self, instance: Instance) -> Result<InstanceOutcome> {
        let outcome = self.instances.save_local(instance).await?;
        self.broadcast(outcome.outbound.clone()).await;
        Ok(outcome)
    }

    /// Deletes an instance homed in this server and announces it.
    pub async fn delete_instance(&self, guid: &str) -> Result<InstanceOutcome> {
        let outcome = self.instances.delete_local(guid).await?;
        self.broadcast(outcome.outbound.clone()).await;
        Ok(outcome)
    }

    /// Moves an instance homed in this server to a new guid and announces it.
    pub async fn reidentify_instance(&self, guid: &str, new_guid: &str) -> Result<InstanceOutcome> {
        let outcome = self.instances.reidentify_local(guid, new_guid).await?;
        self.broadcast(outcome.outbound.clone()).await;
        Ok(outcome)
    }
}
