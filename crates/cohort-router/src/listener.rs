//! Inbound event listener for one cohort.

use crate::{EventRouter, EventSubscription};
use cohort_types::RawEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

/// How long a member's worker may sit idle before it is retired.
pub const DEFAULT_LANE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Reads a cohort's subscription and hands events to per-member workers.
///
/// Events from one member are processed in order. Events from different
/// members are processed concurrently. Buffered outbound events are flushed
/// whenever the bus becomes ready.
#[derive(Debug)]
pub struct InboundListener {
    cohort: String,
    shutdown: watch::Sender<bool>,
    lanes: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl InboundListener {
    /// Starts listening.
    pub fn spawn(router: Arc<EventRouter>, subscription: EventSubscription) -> Self {
        Self::spawn_with_idle_timeout(router, subscription, DEFAULT_LANE_IDLE_TIMEOUT)
    }

    /// Starts listening, retiring member workers idle for `idle`.
    pub fn spawn_with_idle_timeout(
        router: Arc<EventRouter>,
        subscription: EventSubscription,
        idle: Duration,
    ) -> Self {
        let cohort = router.cohort().to_string();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let lanes = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(listen(
            router,
            subscription,
            shutdown_rx,
            lanes.clone(),
            idle,
        ));

        tracing::info!(cohort = %cohort, "inbound listener started");
        Self {
            cohort,
            shutdown,
            lanes,
            handle,
        }
    }

    /// Returns the cohort being listened to.
    pub fn cohort(&self) -> &str {
        &self.cohort
    }

    /// Returns the number of member workers running.
    pub fn lanes(&self) -> usize {
        self.lanes.load(Ordering::Relaxed)
    }

    /// Returns true once the listener has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops reading new events and waits for the workers to finish the
    /// events already handed to them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(cohort = %self.cohort, error = %e, "inbound listener failed");
        }
        tracing::info!(cohort = %self.cohort, "inbound listener stopped");
    }
}

/// One member's ordered queue.
struct Lane {
    sender: mpsc::UnboundedSender<RawEvent>,
    pending: Arc<AtomicUsize>,
    last_used: Instant,
}

impl Lane {
    fn open(router: &Arc<EventRouter>, workers: &mut JoinSet<()>) -> Self {
        let (sender, events) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        workers.spawn(work(router.clone(), events, pending.clone()));
        Self {
            sender,
            pending,
            last_used: Instant::now(),
        }
    }

    fn is_idle(&self, idle: Duration) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && self.last_used.elapsed() >= idle
    }
}

async fn listen(
    router: Arc<EventRouter>,
    mut subscription: EventSubscription,
    mut shutdown: watch::Receiver<bool>,
    lane_count: Arc<AtomicUsize>,
    idle: Duration,
) {
    let mut lanes: HashMap<String, Lane> = HashMap::new();
    let mut workers = JoinSet::new();
    let mut ready = router.readiness();
    let mut watching_ready = true;
    let mut sweep = tokio::time::interval((idle / 2).max(Duration::from_millis(10)));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            changed = ready.changed(), if watching_ready => {
                if changed.is_err() {
                    watching_ready = false;
                    continue;
                }
                if *ready.borrow_and_update() && router.queued() > 0 {
                    let router = router.clone();
                    workers.spawn(async move {
                        router.flush().await;
                    });
                }
            }

            received = subscription.recv() => {
                let Some(bytes) = received else {
                    tracing::debug!(cohort = %router.cohort(), "subscription closed");
                    break;
                };

                // Envelopes that cannot be parsed have no member to order by.
                let raw = match RawEvent::from_slice(&bytes) {
                    Ok(raw) => raw,
                    Err(_) => {
                        router.route(&bytes).await;
                        continue;
                    }
                };

                let member = raw.originator.collection_id().to_string();
                let lane = lanes
                    .entry(member)
                    .or_insert_with(|| Lane::open(&router, &mut workers));
                lane.pending.fetch_add(1, Ordering::SeqCst);
                lane.last_used = Instant::now();
                if let Err(mpsc::error::SendError(_)) = lane.sender.send(raw) {
                    lane.pending.fetch_sub(1, Ordering::SeqCst);
                    tracing::warn!(cohort = %router.cohort(), "member worker stopped unexpectedly");
                }
                lane_count.store(lanes.len(), Ordering::Relaxed);
            }

            _ = sweep.tick() => {
                let before = lanes.len();
                lanes.retain(|_, lane| !lane.is_idle(idle));
                if lanes.len() != before {
                    tracing::debug!(
                        cohort = %router.cohort(),
                        retired = before - lanes.len(),
                        "idle member workers retired"
                    );
                    lane_count.store(lanes.len(), Ordering::Relaxed);
                }
                while workers.try_join_next().is_some() {}
            }
        }
    }

    drop(lanes);
    lane_count.store(0, Ordering::Relaxed);
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            tracing::error!(cohort = %router.cohort(), error = %e, "member worker failed");
        }
    }
}

async fn work(
    router: Arc<EventRouter>,
    mut events: mpsc::UnboundedReceiver<RawEvent>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(raw) = events.recv().await {
        router.route_raw(raw).await;
        pending.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventBus, MemoryEventBus, RetryPolicy};
    use bytes::Bytes;
    use cohort_audit::{codes, AuditOriginator, AuditTrail, MemoryDestination};
    use cohort_consistency::{InstanceConsistencyEngine, TypeDefReconciler};
    use cohort_registry::{CohortRegistry, CohortState, PeerDirectory, UnsupportedConnectorFactory};
    use cohort_storage::{MemoryInstanceStore, MemoryRegistryStore, MemoryTypeDefStore};
    use cohort_types::MemberRegistration;
    use std::time::Duration;

    fn router(bus: Arc<MemoryEventBus>, id: &str, name: &str) -> (Arc<EventRouter>, Arc<MemoryDestination>) {
        let audit = Arc::new(MemoryDestination::new());
        let trail = Arc::new(
            AuditTrail::new(AuditOriginator::new(name, id)).with_destination(audit.clone()),
        );
        let directory = Arc::new(PeerDirectory::new(Arc::new(UnsupportedConnectorFactory)));
        let registry = Arc::new(
            CohortRegistry::new(
                "cohortA",
                MemberRegistration::new(id, name)
                    .with_network_address(format!("{name}:9443"))
                    .with_connection(serde_json::json!({ "endpoint": name })),
                Arc::new(MemoryRegistryStore::new()),
                directory.clone(),
                trail.component("registry"),
            )
            .unwrap(),
        );
        let types = Arc::new(TypeDefReconciler::new(
            registry.originator(),
            Arc::new(MemoryTypeDefStore::new()),
            trail.component("typedefs"),
        ));
        let engine = Arc::new(InstanceConsistencyEngine::new(
            registry.originator(),
            Arc::new(MemoryInstanceStore::new()),
            types.clone(),
            directory,
            trail.component("instances"),
        ));
        let router = EventRouter::new(registry, types, engine, bus, trail.component("router"))
            .with_retry(RetryPolicy::none());
        (Arc::new(router), audit)
    }

    async fn join(bus: &Arc<MemoryEventBus>, id: &str, name: &str) -> (Arc<EventRouter>, Arc<MemoryDestination>, InboundListener) {
        let (router, audit) = router(bus.clone(), id, name);
        let listener = InboundListener::spawn(router.clone(), bus.subscribe("cohortA").unwrap());
        router.start().await.unwrap();
        (router, audit, listener)
    }

    async fn wait_for(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_members_discover_each_other() {
        let bus = Arc::new(MemoryEventBus::new());
        let (a, audit_a, listener_a) = join(&bus, "mc-1", "server-a").await;
        let (b, audit_b, listener_b) = join(&bus, "mc-2", "server-b").await;

        wait_for(|| {
            a.registry().state() == CohortState::Active
                && b.registry().state() == CohortState::Active
        })
        .await;
        wait_for(|| audit_b.contains(codes::NEW_MEMBER_REGISTERED)).await;

        assert!(audit_a.contains(codes::NEW_MEMBER_REGISTERED));
        assert!(a.registry().peer("mc-2").await.unwrap().is_some());
        assert!(b.registry().peer("mc-1").await.unwrap().is_some());

        listener_a.shutdown().await;
        listener_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_garbage_does_not_stop_listener() {
        let bus = Arc::new(MemoryEventBus::new());
        let (a, audit, listener) = join(&bus, "mc-1", "server-a").await;

        bus.publish("cohortA", Bytes::from_static(b"\x00garbage")).await.unwrap();
        wait_for(|| audit.contains(codes::BAD_EVENT)).await;
        assert!(!listener.is_finished());

        let (_b, _, listener_b) = join(&bus, "mc-2", "server-b").await;
        wait_for(|| a.registry().state() == CohortState::Active).await;

        listener.shutdown().await;
        listener_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_prompt() {
        let bus = Arc::new(MemoryEventBus::new());
        let (_a, _, listener) = join(&bus, "mc-1", "server-a").await;

        tokio::time::timeout(Duration::from_secs(1), listener.shutdown())
            .await
            .expect("listener did not stop");
    }

    #[tokio::test]
    async fn test_closed_topic_ends_listener() {
        let bus = Arc::new(MemoryEventBus::new());
        let (_a, _, listener) = join(&bus, "mc-1", "server-a").await;

        bus.close("cohortA");
        wait_for(|| listener.is_finished()).await;
    }

    #[tokio::test]
    async fn test_buffered_registration_sent_when_bus_ready() {
        let bus = Arc::new(MemoryEventBus::new());
        bus.set_ready(false);
        let (a, _, listener) = join(&bus, "mc-1", "server-a").await;
        assert_eq!(a.queued(), 1);
        assert_eq!(bus.published(), 0);

        bus.set_ready(true);
        wait_for(|| a.queued() == 0).await;
        assert_eq!(bus.published(), 1);

        let (_b, _, listener_b) = join(&bus, "mc-2", "server-b").await;
        wait_for(|| a.registry().state() == CohortState::Active).await;

        listener.shutdown().await;
        listener_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_member_lanes_retired() {
        let bus = Arc::new(MemoryEventBus::new());
        let (a, _) = router(bus.clone(), "mc-1", "server-a");
        let listener = InboundListener::spawn_with_idle_timeout(
            a.clone(),
            bus.subscribe("cohortA").unwrap(),
            Duration::from_millis(50),
        );
        a.start().await.unwrap();
        let (b, _, listener_b) = join(&bus, "mc-2", "server-b").await;
        wait_for(|| a.registry().directory().is_member("mc-2")).await;

        wait_for(|| listener.lanes() == 0).await;

        b.unregister().await.unwrap();
        wait_for(|| !a.registry().directory().is_member("mc-2")).await;

        listener.shutdown().await;
        listener_b.shutdown().await;
    }
}
