//! Metadata instances (entities and relationships).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether an instance is an entity or a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    /// An entity.
    Entity,
    /// A relationship between entities.
    Relationship,
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKind::Entity => write!(f, "entity"),
            InstanceKind::Relationship => write!(f, "relationship"),
        }
    }
}

/// How an instance came to be held by a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Homed in this repository.
    Local,
    /// Imported from an archive; homed in this repository.
    Imported,
    /// A cached copy of an instance homed elsewhere.
    ReferenceCopy,
    /// A copy whose home has left the cohort.
    Deregistered,
}

/// An entity or relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Instance identity, expected unique across the cohort.
    pub guid: String,
    /// Entity or relationship.
    pub kind: InstanceKind,
    /// Name of the instance's type.
    pub type_name: String,
    /// Guid of the instance's type.
    pub type_guid: String,
    /// Version of the type the instance conforms to.
    pub type_version: u64,
    /// Collection id of the home repository.
    pub metadata_collection_id: String,
    /// How the holder obtained the instance.
    pub provenance: Provenance,
    /// Update sequence, incremented by the home repository on every change.
    pub version: u64,
    /// Property values. Opaque to the cohort layer.
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl Instance {
    /// Creates a version 1 local instance.
    pub fn new(
        guid: impl Into<String>,
        kind: InstanceKind,
        type_name: impl Into<String>,
        type_guid: impl Into<String>,
        home: impl Into<String>,
    ) -> Self {
        Self {
            guid: guid.into(),
            kind,
            type_name: type_name.into(),
            type_guid: type_guid.into(),
            type_version: 1,
            metadata_collection_id: home.into(),
            provenance: Provenance::Local,
            version: 1,
            properties: serde_json::Value::Null,
        }
    }

    /// Sets the type version.
    pub fn with_type_version(mut self, type_version: u64) -> Self {
        self.type_version = type_version;
        self
    }

    /// Sets the update sequence.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Sets the property values.
    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }

    /// Returns true if this instance is homed in `local_collection_id`.
    #[must_use]
    pub fn is_home(&self, local_collection_id: &str) -> bool {
        self.metadata_collection_id == local_collection_id
    }

    /// Returns true if this copy is an authoritative home copy.
    #[must_use]
    pub fn is_authoritative(&self) -> bool {
        matches!(self.provenance, Provenance::Local | Provenance::Imported)
    }

    /// Returns this instance relabelled as a reference copy.
    #[must_use]
    pub fn into_reference_copy(mut self) -> Self {
        self.provenance = Provenance::ReferenceCopy;
        self
    }

    /// Returns true if the type pairing matches `other`.
    #[must_use]
    pub fn same_type(&self, other: &Instance) -> bool {
        self.type_name == other.type_name && self.type_guid == other.type_guid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_home() {
        let inst = Instance::new("i-1", InstanceKind::Entity, "Asset", "g-asset", "mc-1");
        assert!(inst.is_home("mc-1"));
        assert!(!inst.is_home("mc-2"));
        assert!(inst.is_authoritative());

        let copy = inst.into_reference_copy();
        assert_eq!(copy.provenance, Provenance::ReferenceCopy);
        assert!(!copy.is_authoritative());
    }

    #[test]
    fn test_same_type() {
        let a = Instance::new("i-1", InstanceKind::Entity, "Asset", "g-asset", "mc-1");
        let b = a.clone().with_type_version(3);
        let c = Instance::new("i-1", InstanceKind::Entity, "Asset", "g-other", "mc-1");
        assert!(a.same_type(&b));
        assert!(!a.same_type(&c));
    }

    #[test]
    fn test_provenance_serialization() {
        let json = serde_json::to_string(&Provenance::ReferenceCopy).unwrap();
        assert_eq!(json, "\"reference_copy\"");
    }
}
