//! Instance event processing and conflict resolution.

use crate::watermark::{Watermark, Watermarks};
use crate::{ConsistencyError, InstanceTypeCheck, Result, TypeDefReconciler};
use cohort_audit::{codes, ComponentAudit};
use cohort_registry::PeerDirectory;
use cohort_storage::{InstanceStore, KeyedLocks};
use cohort_types::{CohortEvent, EventOriginator, Instance, InstanceEvent, Provenance};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;

/// What happened to an instance event or local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceDisposition {
    /// The change was stored.
    Applied,
    /// The instance was deleted.
    Removed,
    /// Already applied, or older than what is held.
    Duplicate,
    /// Not for this member.
    Ignored,
    /// The event is malformed.
    Rejected,
    /// The instance's type disagrees with the held type information.
    TypeConflict,
    /// Two homes claim the guid and this member owns one of them.
    Collision,
    /// Two other homes claim the guid; the cached copy was dropped.
    Dropped,
    /// A corrective report addressed to this member was audited.
    Reported,
}

/// Result of processing one instance event or local write.
#[derive(Debug, Clone)]
pub struct InstanceOutcome {
    /// What happened.
    pub disposition: InstanceDisposition,
    /// The instance as stored or removed, if any.
    pub instance: Option<Instance>,
    /// Events to publish.
    pub outbound: Vec<CohortEvent>,
}

impl InstanceOutcome {
    fn new(disposition: InstanceDisposition) -> Self {
        Self {
            disposition,
            instance: None,
            outbound: Vec::new(),
        }
    }

    fn with_instance(mut self, instance: Instance) -> Self {
        self.instance = Some(instance);
        self
    }

    fn with_events(mut self, events: impl IntoIterator<Item = CohortEvent>) -> Self {
        self.outbound.extend(events);
        self
    }
}

/// Applies instance events from peers and local writes to the repository.
///
/// Updates to one guid are serialized. Re-delivered or out-of-date events are
/// recognized by the instance version and the watermark left by deletes.
/// Watermarks are kept for a bounded number of guids, oldest evicted first.
pub struct InstanceConsistencyEngine {
    originator: EventOriginator,
    store: Arc<dyn InstanceStore>,
    types: Arc<TypeDefReconciler>,
    directory: Arc<PeerDirectory>,
    audit: ComponentAudit,
    locks: KeyedLocks,
    watermarks: Watermarks,
    departed: DashSet<String>,
}

impl std::fmt::Debug for InstanceConsistencyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceConsistencyEngine")
            .field("member", &self.originator.collection_id())
            .field("watermarks", &self.watermarks.len())
            .finish()
    }
}

fn missing_field(instance: &Instance) -> Option<&'static str> {
    if instance.guid.is_empty() {
        Some("guid is empty")
    } else if instance.type_name.is_empty() || instance.type_guid.is_empty() {
        Some("type is missing")
    } else if instance.metadata_collection_id.is_empty() {
        Some("home metadata collection id is missing")
    } else {
        None
    }
}

impl InstanceConsistencyEngine {
    /// Creates an engine for the member identified by `originator`.
    pub fn new(
        originator: EventOriginator,
        store: Arc<dyn InstanceStore>,
        types: Arc<TypeDefReconciler>,
        directory: Arc<PeerDirectory>,
        audit: ComponentAudit,
    ) -> Self {
        Self {
            originator,
            store,
            types,
            directory,
            audit,
            locks: KeyedLocks::new(),
            watermarks: Watermarks::default(),
            departed: DashSet::new(),
        }
    }

    /// Bounds how many removed or contested guids are remembered, and how
    /// long an entry is protected from eviction.
    pub fn with_watermark_limit(mut self, limit: usize, retention: Duration) -> Self {
        self.watermarks = Watermarks::new(limit, retention);
        self
    }

    /// Returns the number of guids with a watermark.
    pub fn watermarks(&self) -> usize {
        self.watermarks.len()
    }

    /// Returns the number of guids with a guid lock allocated.
    pub fn locked_guids(&self) -> usize {
        self.locks.len()
    }

    fn local_id(&self) -> &str {
        self.originator.collection_id()
    }

    fn event(&self, event: InstanceEvent) -> CohortEvent {
        CohortEvent::instance(self.originator.clone(), event)
    }

    /// Returns the held copy of an instance.
    pub async fn get(&self, guid: &str) -> Result<Option<Instance>> {
        Ok(self.store.get(guid).await?)
    }

    /// Processes an instance event published by `from`.
    pub async fn process(
        &self,
        from: &EventOriginator,
        event: InstanceEvent,
    ) -> Result<InstanceOutcome> {
        let kind = event.kind();

        match event {
            InstanceEvent::Conflict {
                target,
                guid,
                other_home,
            } => self.on_conflict_report(from, &target, &guid, &other_home).await,
            InstanceEvent::ConflictingType {
                target,
                instance,
                held_type_name,
                held_type_version,
            } => {
                self.on_conflicting_type_report(
                    from,
                    &target,
                    instance,
                    &held_type_name,
                    held_type_version,
                )
                .await
            }
            InstanceEvent::Create(instance)
            | InstanceEvent::Update(instance)
            | InstanceEvent::Refresh(instance) => {
                if let Some(outcome) = self.screen(kind, &instance, from) {
                    return Ok(outcome);
                }
                let _guard = self.locks.lock(&instance.guid).await;
                self.upsert(kind, instance, from, false).await
            }
            InstanceEvent::Retype {
                original_type_name,
                instance,
            } => {
                if let Some(outcome) = self.screen(kind, &instance, from) {
                    return Ok(outcome);
                }
                tracing::debug!(guid = %instance.guid, from = %original_type_name, to = %instance.type_name, "retype");
                let _guard = self.locks.lock(&instance.guid).await;
                self.upsert(kind, instance, from, true).await
            }
            InstanceEvent::Delete(instance) => {
                if let Some(outcome) = self.screen(kind, &instance, from) {
                    return Ok(outcome);
                }
                let _guard = self.locks.lock(&instance.guid).await;
                self.remove(instance, from).await
            }
            InstanceEvent::Reidentify {
                original_guid,
                instance,
            } => {
                if let Some(outcome) = self.screen(kind, &instance, from) {
                    return Ok(outcome);
                }
                if original_guid.is_empty() {
                    return Ok(self.reject(kind, from, "original guid is empty"));
                }
                let _guard = self
                    .locks
                    .lock_many(&[&original_guid, &instance.guid])
                    .await;
                self.retire(&original_guid, &instance.metadata_collection_id)
                    .await?;
                self.upsert(kind, instance, from, false).await
            }
        }
    }

    fn reject(&self, kind: &str, from: &EventOriginator, reason: &str) -> InstanceOutcome {
        self.audit
            .log(codes::BAD_EVENT_INSTANCE, &[kind, from.name(), reason]);
        InstanceOutcome::new(InstanceDisposition::Rejected)
    }

    /// Checks the fields every instance event needs. Returns the outcome if
    /// the event goes no further.
    fn screen(
        &self,
        kind: &str,
        instance: &Instance,
        from: &EventOriginator,
    ) -> Option<InstanceOutcome> {
        if let Some(reason) = missing_field(instance) {
            return Some(self.reject(kind, from, reason));
        }
        if instance.is_home(self.local_id()) {
            tracing::debug!(guid = %instance.guid, from = %from.name(), "event about a local instance");
            return Some(InstanceOutcome::new(InstanceDisposition::Ignored));
        }
        if instance.metadata_collection_id != from.collection_id() {
            let reason = format!(
                "instance is homed in {} but was published by {}",
                instance.metadata_collection_id,
                from.collection_id()
            );
            return Some(self.reject(kind, from, &reason));
        }
        None
    }

    /// Removes the copy of `guid` homed in `home` after a reidentify.
    async fn retire(&self, guid: &str, home: &str) -> Result<()> {
        if let Some(existing) = self.store.get(guid).await? {
            if existing.is_home(home) {
                self.store.delete(guid).await?;
            }
        }
        if self.watermarks.withdraw(guid, home, u64::MAX) {
            tracing::debug!(guid, home, "contest released");
        }
        Ok(())
    }

    /// Stores a peer's copy of an instance. Caller holds the guid lock.
    async fn upsert(
        &self,
        kind: &str,
        instance: Instance,
        from: &EventOriginator,
        retype: bool,
    ) -> Result<InstanceOutcome> {
        let home = instance.metadata_collection_id.clone();
        if self.watermarks.join_contest(&instance.guid, &home)
            || self.watermarks.is_stale(&instance.guid, &home, instance.version)
        {
            return Ok(InstanceOutcome::new(InstanceDisposition::Duplicate));
        }

        let existing = self.store.get(&instance.guid).await?;
        if let Some(existing) = &existing {
            if !existing.is_home(&home) {
                return self.collision(instance, existing.clone()).await;
            }
            if instance.version <= existing.version {
                return Ok(InstanceOutcome::new(InstanceDisposition::Duplicate)
                    .with_instance(existing.clone()));
            }
        }

        let regression = self.type_regression(&instance, existing.as_ref(), retype);
        if let Some((held_name, held_version)) = regression {
            return self
                .refuse_type(instance, existing.is_some(), from, held_name, held_version)
                .await;
        }

        let mut stored = instance.into_reference_copy();
        if self.departed.contains(&home) {
            stored.provenance = Provenance::Deregistered;
        }
        self.store.put(&stored).await?;
        self.watermarks.clear(&stored.guid);

        self.audit.log(
            codes::INCOMING_EVENT,
            &[kind, &stored.kind.to_string(), &stored.guid, from.name()],
        );
        Ok(InstanceOutcome::new(InstanceDisposition::Applied).with_instance(stored))
    }

    /// Returns the held type name and version when `incoming` would regress
    /// or contradict them.
    fn type_regression(
        &self,
        incoming: &Instance,
        existing: Option<&Instance>,
        retype: bool,
    ) -> Option<(String, u64)> {
        if let Some(existing) = existing {
            let changed_type = !incoming.same_type(existing);
            if (changed_type && !retype)
                || (!changed_type && incoming.type_version < existing.type_version)
            {
                return Some((existing.type_name.clone(), existing.type_version));
            }
        }
        match self.types.check_instance_type(
            &incoming.type_name,
            &incoming.type_guid,
            incoming.type_version,
        ) {
            InstanceTypeCheck::Mismatch(held) => Some((held.name, held.version)),
            InstanceTypeCheck::Known(_)
            | InstanceTypeCheck::Ahead(_)
            | InstanceTypeCheck::Unknown => None,
        }
    }

    async fn refuse_type(
        &self,
        instance: Instance,
        held_copy: bool,
        from: &EventOriginator,
        held_type_name: String,
        held_type_version: u64,
    ) -> Result<InstanceOutcome> {
        self.audit.log(
            codes::INSTANCES_WITH_CONFLICTING_TYPES,
            &[
                &instance.guid,
                from.name(),
                &instance.type_name,
                &instance.type_version.to_string(),
                &held_type_name,
                &held_type_version.to_string(),
            ],
        );

        if held_copy {
            self.store.delete(&instance.guid).await?;
        }
        self.watermarks.set(
            &instance.guid,
            Watermark::Version {
                home: instance.metadata_collection_id.clone(),
                version: instance.version,
            },
        );

        let event = self.event(InstanceEvent::ConflictingType {
            target: instance.metadata_collection_id.clone(),
            instance: instance.clone(),
            held_type_name,
            held_type_version,
        });
        Ok(InstanceOutcome::new(InstanceDisposition::TypeConflict)
            .with_instance(instance)
            .with_events([event]))
    }

    /// Resolves two homes claiming one guid. Caller holds the guid lock.
    async fn collision(&self, incoming: Instance, existing: Instance) -> Result<InstanceOutcome> {
        let guid = incoming.guid.clone();
        let home = incoming.metadata_collection_id.clone();

        if existing.is_home(self.local_id()) {
            let outbound = self.reidentify_remote(&incoming, &existing).await;
            return Ok(InstanceOutcome::new(InstanceDisposition::Collision)
                .with_instance(existing)
                .with_events(outbound));
        }

        let contested = [home.as_str(), existing.metadata_collection_id.as_str()];
        if self.watermarks.contest(&guid, contested) {
            self.audit.log(
                codes::DUPLICATE_INSTANCES_FOR_GUID,
                &[
                    &guid,
                    &incoming.type_name,
                    &home,
                    &existing.metadata_collection_id,
                ],
            );
        }
        self.store.delete(&guid).await?;
        Ok(InstanceOutcome::new(InstanceDisposition::Dropped).with_instance(existing))
    }

    /// Asks the home of `remote` to give up the guid it shares with this
    /// member's `local` instance. Attempted once per guid and home.
    async fn reidentify_remote(&self, remote: &Instance, local: &Instance) -> Vec<CohortEvent> {
        let guid = &remote.guid;
        let home = &remote.metadata_collection_id;
        if !self.watermarks.first_attempt(format!("{guid}@{home}")) {
            tracing::debug!(guid = %guid, home = %home, "reidentify already attempted");
            return Vec::new();
        }

        self.audit.log(
            codes::DUPLICATE_INSTANCES_FOR_GUID,
            &[guid, &local.type_name, home, self.local_id()],
        );

        let new_guid = uuid::Uuid::new_v4().to_string();
        let result = match self.directory.connector(home) {
            Some(connector) => connector
                .reidentify(remote.kind, guid, &new_guid)
                .await
                .map_err(|e| e.to_string()),
            None => Err(format!("no connector for member {home}")),
        };

        match result {
            Ok(moved) => {
                self.audit.log(
                    codes::INSTANCE_SUCCESSFULLY_REIDENTIFIED,
                    &[guid, home, &moved.guid],
                );
                self.watermarks.set(
                    guid,
                    Watermark::Version {
                        home: home.clone(),
                        version: u64::MAX,
                    },
                );
                Vec::new()
            }
            Err(reason) => {
                self.audit
                    .log(codes::UNABLE_TO_RE_IDENTIFY_INSTANCE, &[guid, home, &reason]);
                vec![self.event(InstanceEvent::Conflict {
                    target: home.clone(),
                    guid: guid.clone(),
                    other_home: self.local_id().to_string(),
                })]
            }
        }
    }

    /// Applies a peer's delete. Caller holds the guid lock.
    async fn remove(&self, instance: Instance, from: &EventOriginator) -> Result<InstanceOutcome> {
        let home = instance.metadata_collection_id.clone();
        if self.watermarks.is_contested(&instance.guid) {
            if self
                .watermarks
                .withdraw(&instance.guid, &home, instance.version)
            {
                tracing::info!(guid = %instance.guid, home = %home, "contest released");
            }
            return Ok(InstanceOutcome::new(InstanceDisposition::Ignored));
        }

        let existing = self.store.get(&instance.guid).await?;
        if let Some(existing) = &existing {
            if !existing.is_home(&home) {
                tracing::debug!(guid = %instance.guid, home = %home, "delete from a home that does not hold the guid");
                return Ok(InstanceOutcome::new(InstanceDisposition::Ignored));
            }
            if instance.version < existing.version {
                return Ok(InstanceOutcome::new(InstanceDisposition::Duplicate));
            }
        }
        if self.watermarks.is_stale(&instance.guid, &home, instance.version) {
            return Ok(InstanceOutcome::new(InstanceDisposition::Duplicate));
        }

        self.watermarks.set(
            &instance.guid,
            Watermark::Version {
                home,
                version: instance.version,
            },
        );
        let Some(removed) = existing else {
            return Ok(InstanceOutcome::new(InstanceDisposition::Ignored));
        };

        self.store.delete(&instance.guid).await?;
        self.audit.log(
            codes::INCOMING_EVENT,
            &["delete", &removed.kind.to_string(), &removed.guid, from.name()],
        );
        Ok(InstanceOutcome::new(InstanceDisposition::Removed).with_instance(removed))
    }

    /// Handles a peer's request that this member re-identify `guid`.
    async fn on_conflict_report(
        &self,
        from: &EventOriginator,
        target: &str,
        guid: &str,
        other_home: &str,
    ) -> Result<InstanceOutcome> {
        if target != self.local_id() {
            return Ok(InstanceOutcome::new(InstanceDisposition::Ignored));
        }
        self.audit.log(
            codes::INSTANCE_CONFLICT_REPORTED,
            &[from.name(), guid, other_home],
        );

        match self.store.get(guid).await? {
            Some(local) if local.is_home(self.local_id()) => {
                let new_guid = uuid::Uuid::new_v4().to_string();
                match self.reidentify_local(guid, &new_guid).await {
                    Ok(outcome) => Ok(InstanceOutcome {
                        disposition: InstanceDisposition::Reported,
                        ..outcome
                    }),
                    Err(e) => {
                        self.audit.log(
                            codes::UNABLE_TO_RE_IDENTIFY_INSTANCE,
                            &[guid, self.local_id(), &e.to_string()],
                        );
                        Ok(InstanceOutcome::new(InstanceDisposition::Reported))
                    }
                }
            }
            _ => Ok(InstanceOutcome::new(InstanceDisposition::Reported)),
        }
    }

    async fn on_conflicting_type_report(
        &self,
        from: &EventOriginator,
        target: &str,
        instance: Instance,
        held_type_name: &str,
        held_type_version: u64,
    ) -> Result<InstanceOutcome> {
        if target != self.local_id() {
            return Ok(InstanceOutcome::new(InstanceDisposition::Ignored));
        }
        let held = self.store.get(&instance.guid).await?;
        let local = held.unwrap_or(instance);
        self.audit.log(
            codes::LOCAL_INSTANCE_WITH_CONFLICTING_TYPES,
            &[
                &local.guid,
                &local.type_name,
                &local.type_version.to_string(),
                held_type_name,
                &held_type_version.to_string(),
                from.name(),
            ],
        );
        Ok(InstanceOutcome::new(InstanceDisposition::Reported).with_instance(local))
    }

    /// Creates or updates an instance homed in this member.
    ///
    /// Returns the event announcing the change. A reference copy already held
    /// under the same guid is deleted before its home is asked to re-identify.
    pub async fn save_local(&self, instance: Instance) -> Result<InstanceOutcome> {
        if let Some(reason) = missing_field(&instance) {
            return Err(ConsistencyError::InvalidInstance(reason.to_string()));
        }
        if !instance.is_home(self.local_id()) {
            return Err(ConsistencyError::ReferenceCopyReadOnly {
                guid: instance.guid,
                home: instance.metadata_collection_id,
            });
        }
        match self.types.check_instance_type(
            &instance.type_name,
            &instance.type_guid,
            instance.type_version,
        ) {
            InstanceTypeCheck::Known(_) => {}
            InstanceTypeCheck::Unknown => {
                return Err(ConsistencyError::UnknownType {
                    name: instance.type_name,
                    guid: instance.type_guid,
                })
            }
            InstanceTypeCheck::Ahead(held) => {
                return Err(ConsistencyError::InvalidInstance(format!(
                    "type {} is held at version {}, not {}",
                    held.name, held.version, instance.type_version
                )))
            }
            InstanceTypeCheck::Mismatch(held) => {
                return Err(ConsistencyError::TypeConflict(format!(
                    "{} ({}) is paired with {}",
                    held.name, held.guid, instance.type_guid
                )))
            }
        }

        let _guard = self.locks.lock(&instance.guid).await;
        let mut instance = instance;
        if instance.provenance != Provenance::Imported {
            instance.provenance = Provenance::Local;
        }

        match self.store.get(&instance.guid).await? {
            None => {
                self.store.put(&instance).await?;
                self.watermarks.clear(&instance.guid);
                let event = self.event(InstanceEvent::Create(instance.clone()));
                Ok(InstanceOutcome::new(InstanceDisposition::Applied)
                    .with_instance(instance)
                    .with_events([event]))
            }
            Some(existing) if existing.is_home(self.local_id()) => {
                instance.version = existing.version + 1;
                self.store.put(&instance).await?;
                let event = if instance.same_type(&existing) {
                    InstanceEvent::Update(instance.clone())
                } else {
                    InstanceEvent::Retype {
                        original_type_name: existing.type_name.clone(),
                        instance: instance.clone(),
                    }
                };
                Ok(InstanceOutcome::new(InstanceDisposition::Applied)
                    .with_instance(instance)
                    .with_events([self.event(event)]))
            }
            Some(copy) => {
                self.store.delete(&copy.guid).await?;
                self.store.put(&instance).await?;
                let mut outbound = vec![self.event(InstanceEvent::Create(instance.clone()))];
                outbound.extend(self.reidentify_remote(&copy, &instance).await);
                Ok(InstanceOutcome::new(InstanceDisposition::Collision)
                    .with_instance(instance)
                    .with_events(outbound))
            }
        }
    }

    /// Deletes an instance homed in this member.
    pub async fn delete_local(&self, guid: &str) -> Result<InstanceOutcome> {
        let _guard = self.locks.lock(guid).await;
        let Some(existing) = self.store.get(guid).await? else {
            return Err(ConsistencyError::NotFound(guid.to_string()));
        };
        if !existing.is_home(self.local_id()) {
            return Err(ConsistencyError::ReferenceCopyReadOnly {
                guid: guid.to_string(),
                home: existing.metadata_collection_id,
            });
        }

        self.store.delete(guid).await?;
        let mut removed = existing;
        removed.version += 1;
        self.watermarks.set(
            guid,
            Watermark::Version {
                home: self.local_id().to_string(),
                version: removed.version,
            },
        );
        let event = self.event(InstanceEvent::Delete(removed.clone()));
        Ok(InstanceOutcome::new(InstanceDisposition::Removed)
            .with_instance(removed)
            .with_events([event]))
    }

    /// Moves an instance homed in this member to `new_guid`.
    pub async fn reidentify_local(&self, guid: &str, new_guid: &str) -> Result<InstanceOutcome> {
        if new_guid.is_empty() || new_guid == guid {
            return Err(ConsistencyError::InvalidInstance(format!(
                "cannot re-identify {guid} as {new_guid:?}"
            )));
        }
        let _guard = self.locks.lock_many(&[guid, new_guid]).await;

        let Some(existing) = self.store.get(guid).await? else {
            return Err(ConsistencyError::NotFound(guid.to_string()));
        };
        if !existing.is_home(self.local_id()) {
            return Err(ConsistencyError::ReferenceCopyReadOnly {
                guid: guid.to_string(),
                home: existing.metadata_collection_id,
            });
        }
        if self.store.get(new_guid).await?.is_some() {
            return Err(ConsistencyError::GuidInUse(new_guid.to_string()));
        }

        let mut moved = existing;
        moved.guid = new_guid.to_string();
        moved.version += 1;
        self.store.put(&moved).await?;
        self.store.delete(guid).await?;
        self.watermarks.set(
            guid,
            Watermark::Version {
                home: self.local_id().to_string(),
                version: u64::MAX,
            },
        );
        tracing::info!(guid, new_guid, "re-identified local instance");

        let event = self.event(InstanceEvent::Reidentify {
            original_guid: guid.to_string(),
            instance: moved.clone(),
        });
        Ok(InstanceOutcome::new(InstanceDisposition::Applied)
            .with_instance(moved)
            .with_events([event]))
    }

    /// Relabels the reference copies homed in a member that left every
    /// cohort. Returns how many were relabelled.
    pub async fn on_member_departed(&self, metadata_collection_id: &str) -> Result<usize> {
        self.departed.insert(metadata_collection_id.to_string());
        let count = self
            .relabel(metadata_collection_id, Provenance::ReferenceCopy, Provenance::Deregistered)
            .await?;
        self.audit.log(
            codes::MEMBER_DEPARTED_INSTANCES,
            &[&count.to_string(), metadata_collection_id],
        );
        Ok(count)
    }

    /// Restores the reference copies of a member that registered again.
    pub async fn on_member_registered(&self, metadata_collection_id: &str) -> Result<usize> {
        if self.departed.remove(metadata_collection_id).is_none() {
            return Ok(0);
        }
        self.relabel(metadata_collection_id, Provenance::Deregistered, Provenance::ReferenceCopy)
            .await
    }

    async fn relabel(&self, home: &str, from: Provenance, to: Provenance) -> Result<usize> {
        let mut count = 0;
        for listed in self.store.list_by_home(home).await? {
            if listed.provenance != from {
                continue;
            }
            let _guard = self.locks.lock(&listed.guid).await;
            // The listing is a snapshot; an event may have replaced the row.
            let Some(mut current) = self.store.get(&listed.guid).await? else {
                continue;
            };
            if !current.is_home(home) || current.provenance != from {
                continue;
            }
            current.provenance = to;
            self.store.put(&current).await?;
            count += 1;
        }
        Ok(count)
    }
}
