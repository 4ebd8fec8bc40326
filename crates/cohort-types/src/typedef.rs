//! Type definitions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// The shape of metadata a type describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeDefCategory {
    /// Entity type.
    Entity,
    /// Relationship type.
    Relationship,
    /// Classification type.
    Classification,
}

/// Where a type definition was introduced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum TypeDefOrigin {
    /// Loaded from a content archive. Not removable.
    Archive {
        /// Archive name.
        name: String,
    },
    /// Received from another cohort member.
    Server {
        /// Name of the originating server.
        name: String,
    },
    /// Installed ad hoc in this server's runtime.
    AdHoc {
        /// Who installed it.
        requester: String,
    },
}

impl TypeDefOrigin {
    /// Returns true if the type may be removed at runtime.
    #[must_use]
    pub fn is_removable(&self) -> bool {
        matches!(self, TypeDefOrigin::AdHoc { .. })
    }
}

impl fmt::Display for TypeDefOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDefOrigin::Archive { name } => write!(f, "archive:{name}"),
            TypeDefOrigin::Server { name } => write!(f, "server:{name}"),
            TypeDefOrigin::AdHoc { requester } => write!(f, "adhoc:{requester}"),
        }
    }
}

/// A named, versioned type description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Stable identity across versions.
    pub guid: String,
    /// Type name. Paired with `guid` for the lifetime of the cohort.
    pub name: String,
    /// Monotonically increasing version.
    pub version: u64,
    /// Where this definition came from.
    pub origin: TypeDefOrigin,
    /// Shape of the type.
    pub category: TypeDefCategory,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// Name of the super type, if any.
    #[serde(default)]
    pub super_type: Option<String>,
    /// Attribute name to attribute type name.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Fields that take part in the content fingerprint. `origin` is excluded so
/// the same definition relayed through different servers compares equal.
#[derive(Serialize)]
struct FingerprintView<'a> {
    guid: &'a str,
    name: &'a str,
    version: u64,
    category: TypeDefCategory,
    description: &'a str,
    super_type: &'a Option<String>,
    attributes: &'a BTreeMap<String, String>,
}

impl TypeDef {
    /// Creates a version 1 type definition.
    pub fn new(
        guid: impl Into<String>,
        name: impl Into<String>,
        category: TypeDefCategory,
        origin: TypeDefOrigin,
    ) -> Self {
        Self {
            guid: guid.into(),
            name: name.into(),
            version: 1,
            origin,
            category,
            description: String::new(),
            super_type: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Sets the version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the super type.
    pub fn with_super_type(mut self, super_type: impl Into<String>) -> Self {
        self.super_type = Some(super_type.into());
        self
    }

    /// Adds an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), type_name.into());
        self
    }

    /// Returns a hex SHA-256 fingerprint of the definition's content.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let view = FingerprintView {
            guid: &self.guid,
            name: &self.name,
            version: self.version,
            category: self.category,
            description: &self.description,
            super_type: &self.super_type,
            attributes: &self.attributes,
        };
        // Serializing plain strings and maps cannot fail.
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Returns the summary exchanged during registration.
    #[must_use]
    pub fn summary(&self) -> TypeDefSummary {
        TypeDefSummary {
            guid: self.guid.clone(),
            name: self.name.clone(),
            version: self.version,
            fingerprint: self.fingerprint(),
        }
    }
}

/// Identity, version and content fingerprint of a type definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDefSummary {
    /// Type guid.
    pub guid: String,
    /// Type name.
    pub name: String,
    /// Type version.
    pub version: u64,
    /// Content fingerprint of this version.
    pub fingerprint: String,
}

impl fmt::Display for TypeDefSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) v{}", self.name, self.guid, self.version)
    }
}
