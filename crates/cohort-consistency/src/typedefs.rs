//! Type definition reconciliation.
//!
//! Type identity is immutable: a name stays paired with one guid for the life
//! of the cohort. Within one identity the higher version wins, and two
//! definitions with the same version but different content are a hard
//! conflict.

use crate::{ConsistencyError, Result};
use cohort_audit::{codes, ComponentAudit};
use cohort_storage::{KeyGuard, KeyedLocks, TypeDefStore};
use cohort_types::{
    CohortEvent, EventOriginator, TypeDef, TypeDefEvent, TypeDefOrigin, TypeDefSummary,
};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What happened to a type definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeDefDisposition {
    /// A new type was installed.
    Added,
    /// A known type moved to a higher version.
    Updated,
    /// Already held at this version with the same content.
    Duplicate,
    /// Not applied, with no conflict to report.
    Discarded,
    /// Conflicts with the held definition.
    Rejected,
    /// The type was removed.
    Removed,
    /// The type may not be removed.
    Refused,
    /// Nothing to do.
    Ignored,
}

/// Result of reconciling one type definition.
#[derive(Debug, Clone)]
pub struct TypeDefOutcome {
    /// What happened.
    pub disposition: TypeDefDisposition,
    /// The definition held after processing, if any.
    pub typedef: Option<TypeDef>,
    /// Events to publish.
    pub outbound: Vec<CohortEvent>,
}

impl TypeDefOutcome {
    fn new(disposition: TypeDefDisposition) -> Self {
        Self {
            disposition,
            typedef: None,
            outbound: Vec::new(),
        }
    }

    fn with_typedef(mut self, typedef: TypeDef) -> Self {
        self.typedef = Some(typedef);
        self
    }

    fn with_event(mut self, event: CohortEvent) -> Self {
        self.outbound.push(event);
        self
    }

    /// Returns true if the local definitions changed.
    pub fn changed(&self) -> bool {
        matches!(
            self.disposition,
            TypeDefDisposition::Added | TypeDefDisposition::Updated | TypeDefDisposition::Removed
        )
    }
}

/// How a remote type summary compares with the local definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeDefCompatibility {
    /// Same identity, version and content.
    Compatible,
    /// The remote member holds a higher version.
    RemoteAhead,
    /// The local definition is the higher version.
    RemoteBehind,
    /// Identity or content disagree.
    Conflicting,
    /// The type is not held locally.
    Unknown,
}

/// Result of checking an instance's type against the local definitions.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceTypeCheck {
    /// The pairing matches and the version is held.
    Known(TypeDef),
    /// The pairing matches but the instance uses a newer version than held.
    Ahead(TypeDef),
    /// Neither the name nor the guid is held.
    Unknown,
    /// The pairing contradicts the held definition.
    Mismatch(TypeDef),
}

#[derive(Debug, Clone)]
struct TypeEntry {
    current: TypeDef,
    /// Fingerprint of every version seen for this identity.
    history: BTreeMap<u64, String>,
}

impl TypeEntry {
    fn new(typedef: TypeDef) -> Self {
        let mut history = BTreeMap::new();
        history.insert(typedef.version, typedef.fingerprint());
        Self {
            current: typedef,
            history,
        }
    }

    fn advance(&mut self, typedef: TypeDef) {
        self.history.insert(typedef.version, typedef.fingerprint());
        self.current = typedef;
    }

    fn saw(&self, version: u64, fingerprint: &str) -> bool {
        self.history.get(&version).map(String::as_str) == Some(fingerprint)
    }
}

/// Keeps the local type definitions consistent with the cohort.
pub struct TypeDefReconciler {
    originator: EventOriginator,
    store: Arc<dyn TypeDefStore>,
    audit: ComponentAudit,
    dynamic_types: bool,
    entries: DashMap<String, TypeEntry>,
    names: DashMap<String, String>,
    locks: KeyedLocks,
}

impl std::fmt::Debug for TypeDefReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDefReconciler")
            .field("member", &self.originator.collection_id())
            .field("types", &self.entries.len())
            .field("dynamic_types", &self.dynamic_types)
            .finish()
    }
}

impl TypeDefReconciler {
    /// Creates a reconciler that accepts new types from peers.
    pub fn new(
        originator: EventOriginator,
        store: Arc<dyn TypeDefStore>,
        audit: ComponentAudit,
    ) -> Self {
        Self {
            originator,
            store,
            audit,
            dynamic_types: true,
            entries: DashMap::new(),
            names: DashMap::new(),
            locks: KeyedLocks::new(),
        }
    }

    /// Sets whether types first introduced by peers are installed.
    pub fn with_dynamic_types(mut self, enabled: bool) -> Self {
        self.dynamic_types = enabled;
        self
    }

    /// Returns true if types introduced by peers are installed.
    pub fn dynamic_types(&self) -> bool {
        self.dynamic_types
    }

    /// Loads the held definitions from the store. Returns how many were loaded.
    pub async fn load(&self) -> Result<usize> {
        let types = self.store.list().await?;
        let count = types.len();
        for typedef in types {
            self.cache(TypeEntry::new(typedef));
        }
        tracing::debug!(types = count, "loaded type definitions");
        Ok(count)
    }

    /// Returns the held definition for `guid`.
    pub fn cached(&self, guid: &str) -> Option<TypeDef> {
        self.entries.get(guid).map(|e| e.current.clone())
    }

    /// Returns the held definition named `name`.
    pub fn cached_by_name(&self, name: &str) -> Option<TypeDef> {
        let guid = self.names.get(name)?.clone();
        self.cached(&guid)
    }

    /// Returns the summaries advertised in this member's registration, by name.
    pub fn summaries(&self) -> Vec<TypeDefSummary> {
        let mut summaries: Vec<_> = self
            .entries
            .iter()
            .map(|e| e.current.summary())
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Returns the number of held definitions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no definition is held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn cache(&self, entry: TypeEntry) {
        self.names
            .insert(entry.current.name.clone(), entry.current.guid.clone());
        self.entries.insert(entry.current.guid.clone(), entry);
    }

    fn forget(&self, typedef: &TypeDef) {
        self.entries.remove(&typedef.guid);
        self.names.remove_if(&typedef.name, |_, guid| *guid == typedef.guid);
    }

    /// Returns the held definition whose identity contradicts `name`/`guid`.
    fn pairing_conflict(&self, guid: &str, name: &str) -> Option<TypeDef> {
        if let Some(entry) = self.entries.get(guid) {
            if entry.current.name != name {
                return Some(entry.current.clone());
            }
        }
        let other = self.names.get(name).map(|g| g.clone())?;
        if other != guid {
            return self.cached(&other);
        }
        None
    }

    async fn lock_identity(&self, guid: &str, name: &str) -> KeyGuard {
        let guid_key = format!("guid:{guid}");
        let name_key = format!("name:{name}");
        self.locks.lock_many(&[&guid_key, &name_key]).await
    }

    fn event(&self, event: TypeDefEvent) -> CohortEvent {
        CohortEvent::typedef(self.originator.clone(), event)
    }

    fn conflict(&self, incoming: &TypeDef, held: &TypeDef, from: &EventOriginator) -> TypeDefOutcome {
        self.audit.log(
            codes::CONFLICTING_TYPEDEFS,
            &[
                &incoming.name,
                &incoming.guid,
                from.name(),
                &held.name,
                &held.guid,
            ],
        );
        TypeDefOutcome::new(TypeDefDisposition::Rejected)
            .with_typedef(held.clone())
            .with_event(self.event(TypeDefEvent::Conflict {
                target: from.collection_id().to_string(),
                local: held.summary(),
                conflicting: incoming.summary(),
            }))
    }

    /// Installs a definition introduced by this member.
    ///
    /// A new identity is announced as a new type, a higher version as a patch.
    pub async fn install_local(&self, typedef: TypeDef) -> Result<TypeDefOutcome> {
        let _guard = self.lock_identity(&typedef.guid, &typedef.name).await;

        if let Some(held) = self.pairing_conflict(&typedef.guid, &typedef.name) {
            return Err(ConsistencyError::TypeConflict(format!(
                "{} ({}) is paired with {} ({})",
                typedef.name, typedef.guid, held.name, held.guid
            )));
        }

        let Some(held) = self.cached(&typedef.guid) else {
            self.store.put(&typedef).await?;
            self.cache(TypeEntry::new(typedef.clone()));
            tracing::info!(type_name = %typedef.name, version = typedef.version, "installed type");
            let event = self.event(TypeDefEvent::NewType(typedef.clone()));
            return Ok(TypeDefOutcome::new(TypeDefDisposition::Added)
                .with_typedef(typedef)
                .with_event(event));
        };

        if typedef.version > held.version {
            self.apply_update(typedef.clone()).await?;
            let event = self.event(TypeDefEvent::TypePatch(typedef.clone()));
            return Ok(TypeDefOutcome::new(TypeDefDisposition::Updated)
                .with_typedef(typedef)
                .with_event(event));
        }

        if typedef.version == held.version && typedef.fingerprint() == held.fingerprint() {
            return Ok(TypeDefOutcome::new(TypeDefDisposition::Duplicate).with_typedef(held));
        }

        Err(ConsistencyError::TypeConflict(format!(
            "{} v{} does not supersede held v{}",
            typedef.name, typedef.version, held.version
        )))
    }

    async fn apply_update(&self, typedef: TypeDef) -> Result<()> {
        self.store.put(&typedef).await?;
        if let Some(mut entry) = self.entries.get_mut(&typedef.guid) {
            entry.advance(typedef);
        }
        Ok(())
    }

    /// Processes a new type announced by a peer.
    pub async fn accept_new_type(
        &self,
        typedef: TypeDef,
        from: &EventOriginator,
    ) -> Result<TypeDefOutcome> {
        let _guard = self.lock_identity(&typedef.guid, &typedef.name).await;

        if let Some(held) = self.pairing_conflict(&typedef.guid, &typedef.name) {
            return Ok(self.conflict(&typedef, &held, from));
        }
        if self.entries.contains_key(&typedef.guid) {
            return self.reconcile_version(typedef, from).await;
        }

        if !self.dynamic_types {
            self.audit.log(
                codes::NEW_TYPE_NOT_SUPPORTED,
                &[&typedef.name, &typedef.guid, from.name()],
            );
            return Ok(TypeDefOutcome::new(TypeDefDisposition::Discarded));
        }

        let mut typedef = typedef;
        if let TypeDefOrigin::AdHoc { .. } = typedef.origin {
            typedef.origin = TypeDefOrigin::Server {
                name: from.name().to_string(),
            };
        }

        self.store.put(&typedef).await?;
        self.cache(TypeEntry::new(typedef.clone()));
        self.audit.log(
            codes::NEW_TYPE_ADDED,
            &[
                &typedef.name,
                &typedef.guid,
                &typedef.version.to_string(),
                from.name(),
            ],
        );
        Ok(TypeDefOutcome::new(TypeDefDisposition::Added).with_typedef(typedef))
    }

    /// Processes a newer version of a type sent by a peer.
    pub async fn accept_patch(
        &self,
        typedef: TypeDef,
        from: &EventOriginator,
    ) -> Result<TypeDefOutcome> {
        let _guard = self.lock_identity(&typedef.guid, &typedef.name).await;

        if let Some(held) = self.pairing_conflict(&typedef.guid, &typedef.name) {
            return Ok(self.conflict(&typedef, &held, from));
        }
        if !self.entries.contains_key(&typedef.guid) {
            self.audit.log(
                codes::TYPE_PATCH_FOR_UNKNOWN_TYPE,
                &[
                    &typedef.name,
                    &typedef.guid,
                    &typedef.version.to_string(),
                    from.name(),
                ],
            );
            return Ok(TypeDefOutcome::new(TypeDefDisposition::Discarded));
        }
        self.reconcile_version(typedef, from).await
    }

    /// Applies a version of a held identity. Caller holds the identity lock.
    async fn reconcile_version(
        &self,
        typedef: TypeDef,
        from: &EventOriginator,
    ) -> Result<TypeDefOutcome> {
        let Some(entry) = self.entries.get(&typedef.guid).map(|e| e.clone()) else {
            return Ok(TypeDefOutcome::new(TypeDefDisposition::Discarded));
        };
        let held = entry.current.clone();

        if typedef.version > held.version {
            let mut typedef = typedef;
            typedef.origin = held.origin.clone();
            self.apply_update(typedef.clone()).await?;
            self.audit.log(
                codes::TYPE_UPDATED,
                &[
                    &typedef.name,
                    &typedef.guid,
                    &held.version.to_string(),
                    &typedef.version.to_string(),
                    from.name(),
                ],
            );
            return Ok(TypeDefOutcome::new(TypeDefDisposition::Updated).with_typedef(typedef));
        }

        if entry.saw(typedef.version, &typedef.fingerprint()) {
            return Ok(TypeDefOutcome::new(TypeDefDisposition::Duplicate).with_typedef(held));
        }

        self.audit.log(
            codes::INCOMING_TYPEDEF_PATCH_MISMATCH,
            &[
                &typedef.name,
                &typedef.guid,
                &typedef.version.to_string(),
                from.name(),
                &held.version.to_string(),
            ],
        );
        let event = self.event(TypeDefEvent::PatchMismatch {
            target: from.collection_id().to_string(),
            local: held.summary(),
            patch: typedef.summary(),
        });
        Ok(TypeDefOutcome::new(TypeDefDisposition::Rejected)
            .with_typedef(held)
            .with_event(event))
    }

    /// Removes an ad hoc type at the request of a local user.
    pub async fn remove_type(&self, guid: &str, requester: &str) -> Result<TypeDefOutcome> {
        let Some(held) = self.cached(guid) else {
            return Ok(TypeDefOutcome::new(TypeDefDisposition::Ignored));
        };
        let _guard = self.lock_identity(&held.guid, &held.name).await;

        if !held.origin.is_removable() {
            self.audit.log(
                codes::TYPE_REMOVAL_REFUSED,
                &[requester, &held.name, &held.guid, &held.origin.to_string()],
            );
            return Ok(TypeDefOutcome::new(TypeDefDisposition::Refused).with_typedef(held));
        }

        self.store.delete(&held.guid).await?;
        self.forget(&held);
        self.audit
            .log(codes::TYPE_REMOVED, &[&held.name, &held.guid, requester]);

        let event = self.event(TypeDefEvent::TypeRemoved {
            guid: held.guid.clone(),
            name: held.name.clone(),
        });
        Ok(TypeDefOutcome::new(TypeDefDisposition::Removed)
            .with_typedef(held)
            .with_event(event))
    }

    /// Processes a peer's removal of a type.
    ///
    /// Only types installed ad hoc, or learned from that peer, follow it.
    pub async fn on_type_removed(
        &self,
        guid: &str,
        name: &str,
        from: &EventOriginator,
    ) -> Result<TypeDefOutcome> {
        let Some(held) = self.cached(guid) else {
            return Ok(TypeDefOutcome::new(TypeDefDisposition::Ignored));
        };
        if held.name != name {
            tracing::debug!(guid, name, held = %held.name, "removal names a different type");
            return Ok(TypeDefOutcome::new(TypeDefDisposition::Ignored));
        }
        let _guard = self.lock_identity(&held.guid, &held.name).await;

        let allowed = match &held.origin {
            TypeDefOrigin::AdHoc { .. } => true,
            TypeDefOrigin::Server { name } => name == from.name(),
            TypeDefOrigin::Archive { .. } => false,
        };
        if !allowed {
            self.audit.log(
                codes::TYPE_REMOVAL_REFUSED,
                &[from.name(), &held.name, &held.guid, &held.origin.to_string()],
            );
            return Ok(TypeDefOutcome::new(TypeDefDisposition::Refused).with_typedef(held));
        }

        self.store.delete(&held.guid).await?;
        self.forget(&held);
        self.audit
            .log(codes::TYPE_REMOVED, &[&held.name, &held.guid, from.name()]);
        Ok(TypeDefOutcome::new(TypeDefDisposition::Removed).with_typedef(held))
    }

    /// Compares a peer's type summary with the local definition.
    pub fn validate_against_remote(&self, remote: &TypeDefSummary) -> TypeDefCompatibility {
        let entry = match self.entries.get(&remote.guid) {
            Some(entry) => entry.clone(),
            None => {
                return if self.names.contains_key(&remote.name) {
                    TypeDefCompatibility::Conflicting
                } else {
                    TypeDefCompatibility::Unknown
                };
            }
        };
        if entry.current.name != remote.name {
            return TypeDefCompatibility::Conflicting;
        }

        let local = entry.current.version;
        if remote.version > local {
            return TypeDefCompatibility::RemoteAhead;
        }
        if let Some(seen) = entry.history.get(&remote.version) {
            if *seen != remote.fingerprint {
                return TypeDefCompatibility::Conflicting;
            }
        } else if remote.version == local {
            return TypeDefCompatibility::Conflicting;
        }

        if remote.version < local {
            TypeDefCompatibility::RemoteBehind
        } else {
            TypeDefCompatibility::Compatible
        }
    }

    /// Reconciles the type summaries a peer advertised at registration.
    ///
    /// Returns the corrective events to publish.
    pub fn handshake(&self, summaries: &[TypeDefSummary], from: &EventOriginator) -> Vec<CohortEvent> {
        let mut outbound = Vec::new();

        for remote in summaries {
            let compatibility = self.validate_against_remote(remote);
            let held = self
                .cached(&remote.guid)
                .or_else(|| self.cached_by_name(&remote.name));
            let Some(held) = held else {
                continue;
            };

            match compatibility {
                TypeDefCompatibility::Compatible | TypeDefCompatibility::Unknown => {}
                TypeDefCompatibility::RemoteAhead => {
                    self.audit.log(
                        codes::REMOTE_TYPE_AHEAD,
                        &[
                            from.name(),
                            &held.name,
                            &held.guid,
                            &remote.version.to_string(),
                            &held.version.to_string(),
                        ],
                    );
                }
                TypeDefCompatibility::RemoteBehind => {
                    self.audit.log(
                        codes::LOCAL_TYPE_AHEAD,
                        &[
                            from.name(),
                            &held.name,
                            &held.guid,
                            &remote.version.to_string(),
                            &held.version.to_string(),
                        ],
                    );
                    outbound.push(self.event(TypeDefEvent::TypePatch(held)));
                }
                TypeDefCompatibility::Conflicting => {
                    self.audit.log(
                        codes::CONFLICTING_TYPEDEFS,
                        &[&remote.name, &remote.guid, from.name(), &held.name, &held.guid],
                    );
                    outbound.push(self.event(TypeDefEvent::Conflict {
                        target: from.collection_id().to_string(),
                        local: held.summary(),
                        conflicting: remote.clone(),
                    }));
                }
            }
        }

        outbound
    }

    /// Audits a peer's report that one of this member's types conflicts with
    /// its own. Returns false if the report is addressed to another member.
    pub fn on_conflict_report(
        &self,
        target: &str,
        theirs: &TypeDefSummary,
        ours: &TypeDefSummary,
        from: &EventOriginator,
    ) -> bool {
        if target != self.originator.collection_id() {
            return false;
        }
        self.audit.log(
            codes::INCOMING_CONFLICTING_TYPEDEFS,
            &[from.name(), &ours.name, &ours.guid, &theirs.name, &theirs.guid],
        );
        true
    }

    /// Audits a peer's refusal of a patch this member sent. Returns false if
    /// the report is addressed to another member.
    pub fn on_patch_mismatch_report(
        &self,
        target: &str,
        theirs: &TypeDefSummary,
        patch: &TypeDefSummary,
        from: &EventOriginator,
    ) -> bool {
        if target != self.originator.collection_id() {
            return false;
        }
        self.audit.log(
            codes::OUTGOING_TYPEDEF_PATCH_MISMATCH,
            &[
                from.name(),
                &patch.version.to_string(),
                &patch.name,
                &patch.guid,
                &theirs.version.to_string(),
            ],
        );
        true
    }

    /// Checks an instance's type pairing and version against the held
    /// definitions.
    pub fn check_instance_type(
        &self,
        type_name: &str,
        type_guid: &str,
        type_version: u64,
    ) -> InstanceTypeCheck {
        if let Some(held) = self.pairing_conflict(type_guid, type_name) {
            return InstanceTypeCheck::Mismatch(held);
        }
        match self.cached(type_guid) {
            Some(held) if type_version > held.version => InstanceTypeCheck::Ahead(held),
            Some(held) => InstanceTypeCheck::Known(held),
            None => InstanceTypeCheck::Unknown,
        }
    }
}
