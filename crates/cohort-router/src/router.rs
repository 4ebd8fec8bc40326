//! Demultiplexes a cohort's inbound events and publishes outbound events.

use crate::{EventBus, OutboundQueue, Result, RetryPolicy};
use cohort_audit::{codes, ComponentAudit};
use cohort_consistency::{InstanceConsistencyEngine, TypeDefReconciler};
use cohort_registry::{CohortRegistry, RegistrationOutcome};
use cohort_types::{
    CohortEvent, DecodeError, EventBody, EventCategory, EventOriginator, RawEvent, RegistryEvent,
    TypeDefEvent,
};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What the router did with one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Processed by its component.
    Processed,
    /// Published by this member and echoed back by the bus.
    OwnEcho,
    /// The registry is not accepting events.
    NotAccepting,
    /// Not an event envelope.
    Malformed,
    /// Category or kind from a newer protocol version.
    Unknown,
    /// The payload does not fit the kind.
    BadPayload,
    /// The component returned an error or panicked.
    Failed,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Routes one cohort's events between the bus and the local components.
///
/// Failures while processing one event are audited and never reach other
/// events.
pub struct EventRouter {
    topic: String,
    registry: Arc<CohortRegistry>,
    types: Arc<TypeDefReconciler>,
    instances: Arc<InstanceConsistencyEngine>,
    bus: Arc<dyn EventBus>,
    outbound: OutboundQueue,
    flushing: tokio::sync::Mutex<()>,
    backlogged: AtomicBool,
    retry: RetryPolicy,
    audit: ComponentAudit,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("cohort", &self.registry.cohort_name())
            .field("topic", &self.topic)
            .field("queued", &self.outbound.len())
            .finish()
    }
}

impl EventRouter {
    /// Creates a router publishing on a topic named after the cohort.
    pub fn new(
        registry: Arc<CohortRegistry>,
        types: Arc<TypeDefReconciler>,
        instances: Arc<InstanceConsistencyEngine>,
        bus: Arc<dyn EventBus>,
        audit: ComponentAudit,
    ) -> Self {
        Self {
            topic: registry.cohort_name().to_string(),
            registry,
            types,
            instances,
            bus,
            outbound: OutboundQueue::new(),
            flushing: tokio::sync::Mutex::new(()),
            backlogged: AtomicBool::new(false),
            retry: RetryPolicy::default(),
            audit,
        }
    }

    /// Sets the bus topic.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Sets the retry policy for sends.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the cohort name.
    pub fn cohort(&self) -> &str {
        self.registry.cohort_name()
    }

    /// Returns the bus topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the cohort's registry.
    pub fn registry(&self) -> &Arc<CohortRegistry> {
        &self.registry
    }

    /// Returns the number of events waiting to be published.
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Watches the bus's readiness.
    pub fn readiness(&self) -> tokio::sync::watch::Receiver<bool> {
        self.bus.readiness()
    }

    fn sync_type_summaries(&self) {
        self.registry.update_type_summaries(self.types.summaries());
    }

    /// Connects to the cohort and broadcasts this member's registration.
    pub async fn start(&self) -> Result<()> {
        self.registry.connect().await?;
        self.sync_type_summaries();
        let events = self.registry.register().await?;
        self.publish(events).await;
        Ok(())
    }

    /// Re-broadcasts this member's registration with current type summaries.
    pub async fn refresh(&self) -> Result<()> {
        self.sync_type_summaries();
        let events = self.registry.refresh_registration().await?;
        self.publish(events).await;
        Ok(())
    }

    /// Asks every member to re-broadcast its registration.
    pub async fn request_refresh(&self) -> Result<()> {
        let events = self.registry.request_refresh()?;
        self.publish(events).await;
        Ok(())
    }

    /// Leaves the cohort permanently.
    pub async fn unregister(&self) -> Result<()> {
        let events = self.registry.unregister().await?;
        self.publish(events).await;
        Ok(())
    }

    /// Buffers `events` and publishes as many as the bus accepts.
    ///
    /// Returns the number published.
    pub async fn publish(&self, events: Vec<CohortEvent>) -> usize {
        for event in events {
            self.outbound.push(event);
        }
        self.flush().await
    }

    /// Publishes buffered events in order until the queue is empty, the bus is
    /// not ready, or a send fails after retries.
    pub async fn flush(&self) -> usize {
        let _flushing = self.flushing.lock().await;
        let cohort = self.registry.cohort_name();
        let mut sent = 0;

        while let Some(event) = self.outbound.pop() {
            if !self.bus.is_ready() {
                self.outbound.requeue(event);
                break;
            }
            let bytes = match event.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.audit.log_exception(
                        codes::OUTBOUND_EVENT_SEND_FAILED,
                        &[event.kind(), cohort],
                        &e,
                    );
                    continue;
                }
            };

            let result = self
                .retry
                .execute(|| self.bus.publish(&self.topic, bytes.clone()))
                .await;
            match result {
                Ok(()) => sent += 1,
                Err(e) => {
                    let code = if event.category() == EventCategory::Registry {
                        codes::REGISTRATION_SEND_FAILED
                    } else {
                        codes::OUTBOUND_EVENT_SEND_FAILED
                    };
                    self.audit.log_exception(code, &[event.kind(), cohort], &e);
                    self.outbound.requeue(event);
                    break;
                }
            }
        }

        if self.outbound.is_empty() {
            if self.backlogged.swap(false, Ordering::SeqCst) && sent > 0 {
                self.audit.log(
                    codes::OUTBOUND_EVENTS_DRAINED,
                    &[&sent.to_string(), cohort],
                );
            }
        } else {
            self.backlogged.store(true, Ordering::SeqCst);
            tracing::debug!(cohort, queued = self.outbound.len(), "outbound events buffered");
        }
        sent
    }

    fn is_own(&self, originator: &EventOriginator) -> bool {
        let local = self.registry.local_registration();
        originator.collection_id() == local.collection_id() && originator.name() == local.name()
    }

    /// Routes one encoded event from the bus.
    pub async fn route(&self, bytes: &[u8]) -> RouteOutcome {
        match RawEvent::from_slice(bytes) {
            Ok(raw) => self.route_raw(raw).await,
            Err(e) => {
                self.audit.log(
                    codes::BAD_EVENT,
                    &[self.registry.cohort_name(), &e.to_string()],
                );
                RouteOutcome::Malformed
            }
        }
    }

    /// Routes one parsed envelope.
    pub async fn route_raw(&self, raw: RawEvent) -> RouteOutcome {
        if self.is_own(&raw.originator) {
            return RouteOutcome::OwnEcho;
        }
        if !self.registry.state().accepts_events() {
            tracing::debug!(cohort = %self.cohort(), kind = %raw.kind, "dropping event while not connected");
            return RouteOutcome::NotAccepting;
        }

        let from = raw.originator.clone();
        let event = match raw.classify() {
            Ok(event) => event,
            Err(e) => return self.undecodable(e, &from),
        };

        let kind = event.kind();
        tracing::trace!(cohort = %self.cohort(), kind, from = %from.name(), "routing event");

        match AssertUnwindSafe(self.dispatch(event)).catch_unwind().await {
            Ok(Ok(outbound)) => {
                if !outbound.is_empty() {
                    self.publish(outbound).await;
                }
                RouteOutcome::Processed
            }
            Ok(Err(e)) => {
                self.audit.log_exception(
                    codes::UNEXPECTED_EXCEPTION_FROM_EVENT,
                    &[kind, from.name(), &e.to_string()],
                    &e,
                );
                RouteOutcome::Failed
            }
            Err(panic) => {
                let reason = panic_message(&*panic);
                self.audit.log(
                    codes::UNEXPECTED_EXCEPTION_FROM_EVENT,
                    &[kind, from.name(), &reason],
                );
                RouteOutcome::Failed
            }
        }
    }

    fn undecodable(&self, error: DecodeError, from: &EventOriginator) -> RouteOutcome {
        match error {
            DecodeError::UnknownCategory(category) => {
                self.audit.log(
                    codes::PROCESS_UNKNOWN_EVENT,
                    &[&category, "", from.name()],
                );
                RouteOutcome::Unknown
            }
            DecodeError::UnknownKind { category, kind } => {
                self.audit.log(
                    codes::PROCESS_UNKNOWN_EVENT,
                    &[&category, &kind, from.name()],
                );
                RouteOutcome::Unknown
            }
            DecodeError::BadPayload {
                category,
                kind,
                reason,
            } => {
                if category == EventCategory::Instance.as_str() {
                    self.audit
                        .log(codes::BAD_EVENT_INSTANCE, &[&kind, from.name(), &reason]);
                } else {
                    self.audit.log(
                        codes::BAD_EVENT,
                        &[self.registry.cohort_name(), &format!("{category}/{kind}: {reason}")],
                    );
                }
                RouteOutcome::BadPayload
            }
        }
    }

    /// Hands an event to its component and returns the events to publish.
    async fn dispatch(&self, event: CohortEvent) -> Result<Vec<CohortEvent>> {
        let from = event.originator;
        match event.body {
            EventBody::Registry(event) => self.dispatch_registry(event, &from).await,
            EventBody::TypeDef(event) => self.dispatch_typedef(event, &from).await,
            EventBody::Instance(event) => Ok(self.instances.process(&from, event).await?.outbound),
        }
    }

    async fn dispatch_registry(
        &self,
        event: RegistryEvent,
        from: &EventOriginator,
    ) -> Result<Vec<CohortEvent>> {
        match event {
            RegistryEvent::Registration(registration) => {
                let outcome = self.registry.on_incoming_registration(registration).await?;
                self.after_registration(outcome, from).await
            }
            RegistryEvent::Refresh(registration) => {
                let outcome = self.registry.on_incoming_refresh(registration).await?;
                self.after_registration(outcome, from).await
            }
            RegistryEvent::Unregistration => {
                let member = from.collection_id();
                let removed = self
                    .registry
                    .on_incoming_unregistration(member, from.server_name.as_deref())
                    .await?;
                if removed && !self.registry.directory().is_member(member) {
                    self.instances.on_member_departed(member).await?;
                }
                Ok(Vec::new())
            }
            RegistryEvent::RefreshRequest => {
                self.sync_type_summaries();
                Ok(self.registry.on_refresh_request().await?)
            }
            RegistryEvent::RegistrationError {
                target,
                code,
                message,
            } => {
                if self
                    .registry
                    .on_incoming_registration_error(from, &target, &message)
                {
                    tracing::warn!(cohort = %self.cohort(), ?code, from = %from.name(), "registration refused by peer");
                }
                Ok(Vec::new())
            }
        }
    }

    async fn after_registration(
        &self,
        outcome: RegistrationOutcome,
        from: &EventOriginator,
    ) -> Result<Vec<CohortEvent>> {
        let accepted = outcome.is_accepted();
        let mut outbound = outcome.outbound;

        if let (true, Some(registration)) = (accepted, outcome.registration) {
            outbound.extend(self.types.handshake(&registration.type_summaries, from));
            self.instances
                .on_member_registered(registration.collection_id())
                .await?;
        }
        Ok(outbound)
    }

    async fn dispatch_typedef(
        &self,
        event: TypeDefEvent,
        from: &EventOriginator,
    ) -> Result<Vec<CohortEvent>> {
        let outcome = match event {
            TypeDefEvent::NewType(typedef) => self.types.accept_new_type(typedef, from).await?,
            TypeDefEvent::TypePatch(typedef) => self.types.accept_patch(typedef, from).await?,
            TypeDefEvent::TypeRemoved { guid, name } => {
                self.types.on_type_removed(&guid, &name, from).await?
            }
            TypeDefEvent::Conflict {
                target,
                local,
                conflicting,
            } => {
                self.types
                    .on_conflict_report(&target, &local, &conflicting, from);
                return Ok(Vec::new());
            }
            TypeDefEvent::PatchMismatch {
                target,
                local,
                patch,
            } => {
                self.types
                    .on_patch_mismatch_report(&target, &local, &patch, from);
                return Ok(Vec::new());
            }
        };

        if outcome.changed() {
            self.sync_type_summaries();
        }
        Ok(outcome.outbound)
    }
}
