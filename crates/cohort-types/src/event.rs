//! Cohort event envelopes.
//!
//! Events travel as JSON envelopes:
//!
//! ```json
//! {"category": "typedef", "kind": "type_patch", "originator": {...}, "payload": {...}}
//! ```
//!
//! Decoding happens in two steps so that a newer peer's events can be told
//! apart from corrupt ones: [`RawEvent::from_slice`] only checks the envelope,
//! then [`RawEvent::classify`] maps category and kind to a typed
//! [`CohortEvent`].

use crate::{
    DecodeError, Instance, MemberRegistration, Result, TypeDef, TypeDefSummary, TypesError,
    MAX_EVENT_SIZE,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Event family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Membership events.
    Registry,
    /// Type definition events.
    TypeDef,
    /// Entity and relationship events.
    Instance,
}

impl EventCategory {
    /// Wire name of the category.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Registry => "registry",
            EventCategory::TypeDef => "typedef",
            EventCategory::Instance => "instance",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registry" => Some(EventCategory::Registry),
            "typedef" => Some(EventCategory::TypeDef),
            "instance" => Some(EventCategory::Instance),
            _ => None,
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The member that published an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOriginator {
    /// Publisher's metadata collection id.
    #[serde(default)]
    pub metadata_collection_id: Option<String>,
    /// Publisher's server name.
    #[serde(default)]
    pub server_name: Option<String>,
    /// Publisher's server type.
    #[serde(default)]
    pub server_type: Option<String>,
    /// Publisher's organization.
    #[serde(default)]
    pub organization_name: Option<String>,
}

impl EventOriginator {
    /// Creates an originator with a collection id and server name.
    pub fn new(metadata_collection_id: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            metadata_collection_id: Some(metadata_collection_id.into()),
            server_name: Some(server_name.into()),
            server_type: None,
            organization_name: None,
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

    /// Returns the collection id, or an empty string when absent.
    #[must_use]
    pub fn collection_id(&self) -> &str {
        self.metadata_collection_id.as_deref().unwrap_or_default()
    }

    /// Returns the server name, or an empty string when absent.
    #[must_use]
    pub fn name(&self) -> &str {
        self.server_name.as_deref().unwrap_or_default()
    }
}

/// Why a registration was refused by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationErrorCode {
    /// Another member already uses the collection id.
    ConflictingCollectionId,
    /// Mandatory registration fields were missing.
    InvalidRegistration,
}

/// Membership events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// A member joins the cohort.
    Registration(MemberRegistration),
    /// A member re-announces itself.
    Refresh(MemberRegistration),
    /// A member leaves the cohort permanently.
    Unregistration,
    /// A member asks everyone to re-announce.
    RefreshRequest,
    /// A member refuses another member's registration.
    RegistrationError {
        /// Collection id of the member being refused.
        target: String,
        /// Reason code.
        code: RegistrationErrorCode,
        /// Human explanation.
        message: String,
    },
}

impl RegistryEvent {
    /// Kinds understood by this protocol version.
    pub const KINDS: &'static [&'static str] = &[
        "registration",
        "refresh",
        "unregistration",
        "refresh_request",
        "registration_error",
    ];

    /// Returns the wire name of this kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryEvent::Registration(_) => "registration",
            RegistryEvent::Refresh(_) => "refresh",
            RegistryEvent::Unregistration => "unregistration",
            RegistryEvent::RefreshRequest => "refresh_request",
            RegistryEvent::RegistrationError { .. } => "registration_error",
        }
    }
}

/// Type definition events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum TypeDefEvent {
    /// A type was introduced.
    NewType(TypeDef),
    /// A newer version of a type.
    TypePatch(TypeDef),
    /// An ad hoc type was removed.
    TypeRemoved {
        /// Type guid.
        guid: String,
        /// Type name.
        name: String,
    },
    /// The sender holds a different name/guid pairing.
    Conflict {
        /// Collection id of the member whose definition conflicts.
        target: String,
        /// The sender's definition.
        local: TypeDefSummary,
        /// The definition it conflicts with.
        conflicting: TypeDefSummary,
    },
    /// The sender refused a patch that would regress its version.
    PatchMismatch {
        /// Collection id of the member that sent the patch.
        target: String,
        /// The sender's current definition.
        local: TypeDefSummary,
        /// The refused patch.
        patch: TypeDefSummary,
    },
}

impl TypeDefEvent {
    /// Kinds understood by this protocol version.
    pub const KINDS: &'static [&'static str] = &[
        "new_type",
        "type_patch",
        "type_removed",
        "conflict",
        "patch_mismatch",
    ];

    /// Returns the wire name of this kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            TypeDefEvent::NewType(_) => "new_type",
            TypeDefEvent::TypePatch(_) => "type_patch",
            TypeDefEvent::TypeRemoved { .. } => "type_removed",
            TypeDefEvent::Conflict { .. } => "conflict",
            TypeDefEvent::PatchMismatch { .. } => "patch_mismatch",
        }
    }
}

/// Entity and relationship events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum InstanceEvent {
    /// An instance was created at its home.
    Create(Instance),
    /// An instance was updated at its home.
    Update(Instance),
    /// An instance was deleted at its home.
    Delete(Instance),
    /// The home re-sent its current copy.
    Refresh(Instance),
    /// The home changed an instance's guid.
    Reidentify {
        /// Guid before the change.
        original_guid: String,
        /// The instance under its new guid.
        instance: Instance,
    },
    /// The home changed an instance's type.
    Retype {
        /// Type name before the change.
        original_type_name: String,
        /// The instance with its new type.
        instance: Instance,
    },
    /// Two homes claim the same guid; `target` is expected to re-identify.
    Conflict {
        /// Collection id of the member expected to act.
        target: String,
        /// The contested guid.
        guid: String,
        /// Home of the copy that keeps the guid.
        other_home: String,
    },
    /// The sender refused `instance` because its type disagrees with the
    /// type information the sender holds.
    ConflictingType {
        /// Home of the refused instance.
        target: String,
        /// The refused copy.
        instance: Instance,
        /// Type name held by the sender.
        held_type_name: String,
        /// Type version held by the sender.
        held_type_version: u64,
    },
}

impl InstanceEvent {
    /// Kinds understood by this protocol version.
    pub const KINDS: &'static [&'static str] = &[
        "create",
        "update",
        "delete",
        "refresh",
        "reidentify",
        "retype",
        "conflict",
        "conflicting_type",
    ];

    /// Returns the wire name of this kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            InstanceEvent::Create(_) => "create",
            InstanceEvent::Update(_) => "update",
            InstanceEvent::Delete(_) => "delete",
            InstanceEvent::Refresh(_) => "refresh",
            InstanceEvent::Reidentify { .. } => "reidentify",
            InstanceEvent::Retype { .. } => "retype",
            InstanceEvent::Conflict { .. } => "conflict",
            InstanceEvent::ConflictingType { .. } => "conflicting_type",
        }
    }

    /// Guid the event is about.
    #[must_use]
    pub fn guid(&self) -> &str {
        match self {
            InstanceEvent::Create(i)
            | InstanceEvent::Update(i)
            | InstanceEvent::Delete(i)
            | InstanceEvent::Refresh(i)
            | InstanceEvent::Retype { instance: i, .. }
            | InstanceEvent::ConflictingType { instance: i, .. } => &i.guid,
            InstanceEvent::Reidentify { original_guid, .. } => original_guid,
            InstanceEvent::Conflict { guid, .. } => guid,
        }
    }
}

/// Category-specific event body.
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    /// Membership event.
    Registry(RegistryEvent),
    /// Type definition event.
    TypeDef(TypeDefEvent),
    /// Instance event.
    Instance(InstanceEvent),
}

/// A typed cohort event.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortEvent {
    /// Who published the event.
    pub originator: EventOriginator,
    /// What happened.
    pub body: EventBody,
}

impl CohortEvent {
    /// Creates a registry event.
    #[must_use]
    pub fn registry(originator: EventOriginator, event: RegistryEvent) -> Self {
        Self {
            originator,
            body: EventBody::Registry(event),
        }
    }

    /// Creates a type definition event.
    #[must_use]
    pub fn typedef(originator: EventOriginator, event: TypeDefEvent) -> Self {
        Self {
            originator,
            body: EventBody::TypeDef(event),
        }
    }

    /// Creates an instance event.
    #[must_use]
    pub fn instance(originator: EventOriginator, event: InstanceEvent) -> Self {
        Self {
            originator,
            body: EventBody::Instance(event),
        }
    }

    /// Returns the event category.
    #[must_use]
    pub fn category(&self) -> EventCategory {
        match self.body {
            EventBody::Registry(_) => EventCategory::Registry,
            EventBody::TypeDef(_) => EventCategory::TypeDef,
            EventBody::Instance(_) => EventCategory::Instance,
        }
    }

    /// Returns the wire name of the event kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match &self.body {
            EventBody::Registry(e) => e.kind(),
            EventBody::TypeDef(e) => e.kind(),
            EventBody::Instance(e) => e.kind(),
        }
    }

    /// Converts to the wire envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_raw(&self) -> Result<RawEvent> {
        let (kind, payload) = match &self.body {
            EventBody::Registry(e) => split(e)?,
            EventBody::TypeDef(e) => split(e)?,
            EventBody::Instance(e) => split(e)?,
        };
        Ok(RawEvent {
            category: self.category().as_str().to_string(),
            kind,
            originator: self.originator.clone(),
            payload,
        })
    }

    /// Encodes the event to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<Bytes> {
        self.to_raw()?.to_bytes()
    }

    /// Decodes and classifies an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope is malformed or cannot be classified.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(RawEvent::from_slice(bytes)?.classify()?)
    }
}

/// Wire envelope of an event, before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event category name.
    pub category: String,
    /// Event kind name.
    pub kind: String,
    /// Publisher.
    #[serde(default)]
    pub originator: EventOriginator,
    /// Category-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl RawEvent {
    /// Parses the envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are oversized or not an envelope.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_EVENT_SIZE {
            return Err(TypesError::TooLarge {
                size: bytes.len(),
                max: MAX_EVENT_SIZE,
            });
        }
        serde_json::from_slice(bytes).map_err(|e| TypesError::Malformed(e.to_string()))
    }

    /// Serializes the envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Maps category and kind to a typed event.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownCategory`] or [`DecodeError::UnknownKind`]
    /// for events from a newer protocol, and [`DecodeError::BadPayload`] when
    /// the payload does not fit the kind.
    pub fn classify(self) -> std::result::Result<CohortEvent, DecodeError> {
        let category = EventCategory::parse(&self.category)
            .ok_or_else(|| DecodeError::UnknownCategory(self.category.clone()))?;

        let known = match category {
            EventCategory::Registry => RegistryEvent::KINDS,
            EventCategory::TypeDef => TypeDefEvent::KINDS,
            EventCategory::Instance => InstanceEvent::KINDS,
        };
        if !known.contains(&self.kind.as_str()) {
            return Err(DecodeError::UnknownKind {
                category: self.category,
                kind: self.kind,
            });
        }

        let body = match category {
            EventCategory::Registry => {
                EventBody::Registry(join(&self.category, &self.kind, self.payload)?)
            }
            EventCategory::TypeDef => {
                EventBody::TypeDef(join(&self.category, &self.kind, self.payload)?)
            }
            EventCategory::Instance => {
                EventBody::Instance(join(&self.category, &self.kind, self.payload)?)
            }
        };

        Ok(CohortEvent {
            originator: self.originator,
            body,
        })
    }
}

/// Splits an adjacently tagged enum into its kind and payload.
fn split<T: Serialize>(value: &T) -> Result<(String, Value)> {
    let Value::Object(mut map) = serde_json::to_value(value)? else {
        return Err(TypesError::Malformed("event body is not an object".into()));
    };
    let kind = match map.remove("kind") {
        Some(Value::String(kind)) => kind,
        _ => return Err(TypesError::Malformed("event body has no kind".into())),
    };
    let payload = map.remove("payload").unwrap_or(Value::Null);
    Ok((kind, payload))
}

/// Rebuilds an adjacently tagged enum from kind and payload.
fn join<T: DeserializeOwned>(
    category: &str,
    kind: &str,
    payload: Value,
) -> std::result::Result<T, DecodeError> {
    let mut map = serde_json::Map::new();
    map.insert("kind".into(), Value::String(kind.to_string()));
    if !payload.is_null() {
        map.insert("payload".into(), payload);
    }
    serde_json::from_value(Value::Object(map)).map_err(|e| DecodeError::BadPayload {
        category: category.to_string(),
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}
