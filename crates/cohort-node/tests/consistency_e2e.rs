//! Metadata consistency E2E tests.
//!
//! These tests run servers on one in-process bus and verify that:
//! 1. Instance changes are replicated to peers
//! 2. Redelivered events are not applied twice
//! 3. Unknown event kinds are audited without stopping the cohort
//! 4. A type patch older than the held version is refused and reported
//! 5. A guid claimed by two homes is resolved by re-identifying one of them

use async_trait::async_trait;
use cohort_audit::{codes, MemoryDestination, Severity};
use cohort_node::{AuditDestinationConfig, CohortConfig, CohortServer, ServerConfig};
use cohort_registry::{
    CohortState, PeerConnector, PeerConnectorFactory, RegistryError,
};
use cohort_router::{EventBus, MemoryEventBus, RetryPolicy};
use cohort_types::{
    CohortEvent, Instance, InstanceKind, MemberRegistration, Provenance, TypeDef,
    TypeDefCategory, TypeDefEvent, TypeDefOrigin,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

fn config(id: &str, name: &str) -> ServerConfig {
    ServerConfig::new(name)
        .with_collection_id(id)
        .with_endpoint(
            format!("{name}:9443"),
            serde_json::json!({ "endpoint": format!("https://{name}:9443") }),
        )
        .with_cohort(CohortConfig::new("cohortA"))
        .with_audit(vec![AuditDestinationConfig::Memory {
            capacity: 5000,
            severities: Vec::new(),
        }])
        .with_retry(RetryPolicy::none())
}

async fn launch(bus: &Arc<MemoryEventBus>, config: ServerConfig) -> Arc<CohortServer> {
    let server = CohortServer::builder(config)
        .bus(bus.clone())
        .build()
        .await
        .expect("server builds");
    server.start().await.expect("server starts");
    Arc::new(server)
}

fn audit(server: &CohortServer) -> &Arc<MemoryDestination> {
    server.audit_log().expect("memory audit configured")
}

fn state(server: &CohortServer) -> CohortState {
    server.router("cohortA").unwrap().registry().state()
}

async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

fn asset() -> TypeDef {
    TypeDef::new(
        "g-asset",
        "Asset",
        TypeDefCategory::Entity,
        TypeDefOrigin::Archive {
            name: "core".into(),
        },
    )
}

fn entity(guid: &str, home: &str) -> Instance {
    Instance::new(guid, InstanceKind::Entity, "Asset", "g-asset", home)
}

/// Two active servers where `a` has installed Asset and `b` has learned it.
async fn pair(bus: &Arc<MemoryEventBus>) -> (Arc<CohortServer>, Arc<CohortServer>) {
    let a = launch(bus, config("mc-1", "server-a")).await;
    let b = launch(bus, config("mc-2", "server-b")).await;
    eventually("both active", || async {
        state(&a) == CohortState::Active && state(&b) == CohortState::Active
    })
    .await;
    a.install_type(asset()).await.unwrap();
    eventually("b learns Asset", || async {
        b.types().cached("g-asset").is_some()
    })
    .await;
    (a, b)
}

/// Test that creates, updates and deletes follow the home member.
#[tokio::test]
async fn test_instance_changes_replicated() {
    let bus = Arc::new(MemoryEventBus::new());
    let (a, b) = pair(&bus).await;

    a.save_instance(entity("i-1", "mc-1")).await.unwrap();
    eventually("b holds the copy", || async {
        b.instance("i-1").await.unwrap().is_some()
    })
    .await;
    let copy = b.instance("i-1").await.unwrap().unwrap();
    assert_eq!(copy.provenance, Provenance::ReferenceCopy);
    assert_eq!(copy.version, 1);

    a.save_instance(
        entity("i-1", "mc-1").with_properties(serde_json::json!({ "owner": "ops" })),
    )
    .await
    .unwrap();
    eventually("b sees the update", || async {
        b.instance("i-1").await.unwrap().map(|i| i.version) == Some(2)
    })
    .await;
    assert_eq!(
        b.instance("i-1").await.unwrap().unwrap().properties["owner"],
        "ops"
    );

    a.delete_instance("i-1").await.unwrap();
    eventually("b drops the copy", || async {
        b.instance("i-1").await.unwrap().is_none()
    })
    .await;

    assert!(b.save_instance(entity("i-9", "mc-1")).await.is_err());
    a.stop().await;
    b.stop().await;
}

/// Test that a redelivered create is recognized and not applied again.
#[tokio::test]
async fn test_redelivered_event_is_idempotent() {
    let bus = Arc::new(MemoryEventBus::new());
    let (a, b) = pair(&bus).await;

    let created = a.save_instance(entity("i-1", "mc-1")).await.unwrap();
    eventually("b holds the copy", || async {
        b.instance("i-1").await.unwrap().is_some()
    })
    .await;
    let applied = audit(&b).by_message_id(codes::INCOMING_EVENT).len();

    a.router("cohortA")
        .unwrap()
        .publish(created.outbound.clone())
        .await;
    a.save_instance(entity("i-2", "mc-1")).await.unwrap();
    eventually("b holds the sentinel", || async {
        b.instance("i-2").await.unwrap().is_some()
    })
    .await;

    assert_eq!(
        audit(&b).by_message_id(codes::INCOMING_EVENT).len(),
        applied + 1
    );
    assert_eq!(b.instance("i-1").await.unwrap().unwrap().version, 1);
}

/// Test that an event of a category this build does not know is audited and
/// the cohort keeps working.
#[tokio::test]
async fn test_unknown_event_kind_tolerated() {
    let bus = Arc::new(MemoryEventBus::new());
    let (a, b) = pair(&bus).await;

    let unknown = serde_json::to_vec(&serde_json::json!({
        "category": "FutureKind",
        "kind": "hologram",
        "originator": { "metadata_collection_id": "mc-2", "server_name": "server-b" },
        "payload": { "anything": true },
    }))
    .unwrap();
    bus.publish("cohortA", unknown.into()).await.unwrap();

    eventually("a audits the unknown event", || async {
        audit(&a).contains(codes::PROCESS_UNKNOWN_EVENT)
    })
    .await;
    let record = &audit(&a).by_message_id(codes::PROCESS_UNKNOWN_EVENT)[0];
    assert_eq!(record.severity, Severity::Error);
    assert!(record.formatted_message.contains("FutureKind"));

    b.save_instance(entity("i-3", "mc-2")).await.unwrap();
    eventually("a still applies events", || async {
        a.instance("i-3").await.unwrap().is_some()
    })
    .await;
    assert_eq!(state(&a), CohortState::Active);
}

/// Test that a patch older than the held version is refused and the sender
/// is told.
#[tokio::test]
async fn test_type_regression_refused() {
    let bus = Arc::new(MemoryEventBus::new());
    let a = launch(&bus, config("mc-1", "server-a")).await;
    a.install_type(asset().with_version(3)).await.unwrap();
    let b = launch(&bus, config("mc-2", "server-b")).await;
    eventually("both active", || async {
        state(&a) == CohortState::Active && state(&b) == CohortState::Active
    })
    .await;

    let router = b.router("cohortA").unwrap();
    let patch = CohortEvent::typedef(
        router.registry().originator(),
        TypeDefEvent::TypePatch(asset().with_version(2).with_description("older")),
    );
    router.publish(vec![patch]).await;

    eventually("a refuses the patch", || async {
        audit(&a).contains(codes::INCOMING_TYPEDEF_PATCH_MISMATCH)
    })
    .await;
    eventually("b is told", || async {
        audit(&b).contains(codes::OUTGOING_TYPEDEF_PATCH_MISMATCH)
    })
    .await;
    assert_eq!(a.types().cached("g-asset").unwrap().version, 3);
}

type Servers = Arc<RwLock<HashMap<String, Weak<CohortServer>>>>;

/// Reaches peers in the same process.
struct LoopbackFactory {
    servers: Servers,
}

struct LoopbackConnector {
    id: String,
    servers: Servers,
}

impl PeerConnectorFactory for LoopbackFactory {
    fn connect(
        &self,
        registration: &MemberRegistration,
    ) -> cohort_registry::Result<Arc<dyn PeerConnector>> {
        Ok(Arc::new(LoopbackConnector {
            id: registration.collection_id().to_string(),
            servers: self.servers.clone(),
        }))
    }
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    fn metadata_collection_id(&self) -> &str {
        &self.id
    }

    async fn reidentify(
        &self,
        _kind: InstanceKind,
        guid: &str,
        new_guid: &str,
    ) -> cohort_registry::Result<Instance> {
        let server = self
            .servers
            .read()
            .get(&self.id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| RegistryError::Connector(format!("{} is unreachable", self.id)))?;
        let outcome = server
            .reidentify_instance(guid, new_guid)
            .await
            .map_err(|e| RegistryError::Connector(e.to_string()))?;
        outcome
            .instance
            .ok_or_else(|| RegistryError::Connector(format!("{guid} was not moved")))
    }
}

async fn launch_reachable(
    bus: &Arc<MemoryEventBus>,
    servers: &Servers,
    config: ServerConfig,
) -> Arc<CohortServer> {
    let id = config.metadata_collection_id.clone().unwrap_or_default();
    let server = Arc::new(
        CohortServer::builder(config)
            .bus(bus.clone())
            .connectors(Arc::new(LoopbackFactory {
                servers: servers.clone(),
            }))
            .build()
            .await
            .expect("server builds"),
    );
    servers.write().insert(id, Arc::downgrade(&server));
    server.start().await.expect("server starts");
    server
}

/// Test that saving a local instance under a guid already held as a peer's
/// copy moves the peer's instance to a new guid.
#[tokio::test]
async fn test_guid_collision_reidentifies_peer() {
    let bus = Arc::new(MemoryEventBus::new());
    let servers: Servers = Arc::default();
    let a = launch_reachable(&bus, &servers, config("mc-1", "server-a")).await;
    let b = launch_reachable(&bus, &servers, config("mc-2", "server-b")).await;
    eventually("both active", || async {
        state(&a) == CohortState::Active && state(&b) == CohortState::Active
    })
    .await;
    a.install_type(asset()).await.unwrap();
    eventually("b learns Asset", || async {
        b.types().cached("g-asset").is_some()
    })
    .await;

    a.save_instance(entity("i-1", "mc-1")).await.unwrap();
    eventually("b holds the copy", || async {
        b.instance("i-1").await.unwrap().is_some()
    })
    .await;

    b.save_instance(entity("i-1", "mc-2")).await.unwrap();
    assert!(audit(&b).contains(codes::DUPLICATE_INSTANCES_FOR_GUID));
    let moved = &audit(&b).by_message_id(codes::INSTANCE_SUCCESSFULLY_REIDENTIFIED)[0];
    let new_guid = moved.parameters[2].clone();

    eventually("a holds b's instance", || async {
        a.instance("i-1").await.unwrap().map(|i| i.metadata_collection_id)
            == Some("mc-2".to_string())
    })
    .await;
    eventually("b holds a's moved instance", || async {
        b.instance(&new_guid).await.unwrap().is_some()
    })
    .await;

    let local = a.instance(&new_guid).await.unwrap().unwrap();
    assert_eq!(local.provenance, Provenance::Local);
    let copy = b.instance(&new_guid).await.unwrap().unwrap();
    assert_eq!(copy.metadata_collection_id, "mc-1");
    assert_eq!(copy.provenance, Provenance::ReferenceCopy);
    let kept = b.instance("i-1").await.unwrap().unwrap();
    assert_eq!(kept.provenance, Provenance::Local);
    assert!(!audit(&b).contains(codes::UNABLE_TO_RE_IDENTIFY_INSTANCE));
}
