//! Cohort membership E2E tests.
//!
//! These tests run several servers on one in-process bus and verify that:
//! 1. Servers discover each other and become active
//! 2. A server reusing another's metadata collection id is refused everywhere
//! 3. Reference copies of a departed member are kept and relabelled
//! 4. Peer registrations survive a restart with a file-backed registry

use cohort_audit::{codes, MemoryDestination, Severity};
use cohort_node::{AuditDestinationConfig, CohortConfig, CohortServer, ServerConfig};
use cohort_registry::CohortState;
use cohort_router::{MemoryEventBus, RetryPolicy};
use cohort_types::{Instance, InstanceKind, Provenance, TypeDef, TypeDefCategory, TypeDefOrigin};
use std::future::Future;
use std::sync::Arc;
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

/// Test that three servers discover each other through registration and refresh.
#[tokio::test]
async fn test_three_servers_become_active() {
    let bus = Arc::new(MemoryEventBus::new());
    let servers = [
        launch(&bus, config("mc-1", "server-a")).await,
        launch(&bus, config("mc-2", "server-b")).await,
        launch(&bus, config("mc-3", "server-c")).await,
    ];

    eventually("every server active", || async {
        servers.iter().all(|s| state(s) == CohortState::Active)
    })
    .await;
    eventually("every server knows both peers", || async {
        let mut all = true;
        for server in &servers {
            let peers = server.router("cohortA").unwrap().registry().peers().await.unwrap();
            all &= peers.len() == 2;
        }
        all
    })
    .await;

    for server in &servers {
        assert!(server.directory().len() == 2);
        assert!(!audit(server).contains(codes::UNEXPECTED_EXCEPTION_FROM_EVENT));
        server.stop().await;
    }
}

/// Test that a second server claiming mc-1 under another name does not
/// replace the first one anywhere.
#[tokio::test]
async fn test_duplicate_collection_id_refused() {
    let bus = Arc::new(MemoryEventBus::new());
    let x = launch(&bus, config("mc-1", "server-x")).await;
    let b = launch(&bus, config("mc-2", "server-b")).await;
    eventually("x and b active", || async {
        state(&x) == CohortState::Active && state(&b) == CohortState::Active
    })
    .await;

    let y = launch(&bus, config("mc-1", "server-y")).await;

    eventually("b audits the conflict", || async {
        audit(&b).contains(codes::INCOMING_CONFLICTING_METADATA_COLLECTION_ID)
    })
    .await;
    eventually("x audits the conflict", || async {
        audit(&x).contains(codes::INCOMING_CONFLICTING_LOCAL_METADATA_COLLECTION_ID)
    })
    .await;
    eventually("y is told it was refused", || async {
        audit(&y).contains(codes::REGISTRATION_ERROR)
    })
    .await;

    let conflict = &audit(&b).by_message_id(codes::INCOMING_CONFLICTING_METADATA_COLLECTION_ID)[0];
    assert_eq!(conflict.severity, Severity::Action);
    assert!(conflict.formatted_message.contains("server-y"));

    let registry = b.router("cohortA").unwrap().registry();
    let held = registry.peer("mc-1").await.unwrap().unwrap();
    assert_eq!(held.server_name.as_deref(), Some("server-x"));
    assert_eq!(registry.peers().await.unwrap().len(), 1);
    assert_eq!(state(&x), CohortState::Active);
}

/// Test that reference copies homed in a member that unregisters are kept
/// and marked deregistered, then restored when it registers again.
#[tokio::test]
async fn test_departed_member_copies_relabelled() {
    let bus = Arc::new(MemoryEventBus::new());
    let a = launch(&bus, config("mc-1", "server-a")).await;
    let b = launch(&bus, config("mc-2", "server-b")).await;
    eventually("a active", || async { state(&a) == CohortState::Active }).await;

    b.install_type(TypeDef::new(
        "g-asset",
        "Asset",
        TypeDefCategory::Entity,
        TypeDefOrigin::Archive {
            name: "core".into(),
        },
    ))
    .await
    .unwrap();
    b.save_instance(Instance::new("i-1", InstanceKind::Entity, "Asset", "g-asset", "mc-2"))
        .await
        .unwrap();
    eventually("a holds the copy", || async {
        a.instance("i-1").await.unwrap().is_some()
    })
    .await;
    assert_eq!(
        a.instance("i-1").await.unwrap().unwrap().provenance,
        Provenance::ReferenceCopy
    );

    b.leave("cohortA").await.unwrap();

    eventually("copy relabelled", || async {
        a.instance("i-1").await.unwrap().map(|i| i.provenance) == Some(Provenance::Deregistered)
    })
    .await;
    assert!(audit(&a).contains(codes::MEMBER_UNREGISTERED));
    assert!(audit(&a).contains(codes::MEMBER_DEPARTED_INSTANCES));
    assert!(!a.directory().is_member("mc-2"));

    let b2 = launch(&bus, config("mc-2", "server-b")).await;
    eventually("copy restored", || async {
        a.instance("i-1").await.unwrap().map(|i| i.provenance) == Some(Provenance::ReferenceCopy)
    })
    .await;
    b2.stop().await;
}

/// Test that a restarted server still knows its peers from the registry file.
#[tokio::test]
async fn test_file_registry_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cohortA.registry.json");
    let bus = Arc::new(MemoryEventBus::new());

    let mut with_file = config("mc-1", "server-a");
    with_file.cohorts = vec![CohortConfig::new("cohortA").with_registry_file(&path)];

    let a = launch(&bus, with_file.clone()).await;
    let b = launch(&bus, config("mc-2", "server-b")).await;
    eventually("a knows b", || async {
        a.router("cohortA").unwrap().registry().peer("mc-2").await.unwrap().is_some()
    })
    .await;
    a.stop().await;
    drop(a);

    let restarted = CohortServer::builder(with_file)
        .bus(bus.clone())
        .build()
        .await
        .unwrap();
    let peer = restarted
        .router("cohortA")
        .unwrap()
        .registry()
        .peer("mc-2")
        .await
        .unwrap()
        .expect("peer kept across restart");
    assert_eq!(peer.server_name.as_deref(), Some("server-b"));
    b.stop().await;
}
