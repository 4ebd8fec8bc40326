//! Server configuration.
//!
//! A server is described by one YAML or JSON document:
//!
//! ```yaml
//! server_name: server-a
//! network_address: server-a:9443
//! connection:
//!   endpoint: https://server-a:9443
//! cohorts:
//!   - name: cohortA
//!     registry:
//!       kind: file
//!       path: ./data/cohortA.registry.json
//! audit:
//!   - kind: tracing
//!   - kind: memory
//!     capacity: 5000
//!     severities: [ACTION, ERROR, EXCEPTION]
//! logging:
//!   level: info
//!   format: json
//! ```

use crate::error::{NodeError, Result};
use crate::observability::LogFormat;
use cohort_audit::Severity;
use cohort_consistency::DEFAULT_WATERMARK_LIMIT;
use cohort_router::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Where a cohort's peer registrations are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistryStoreConfig {
    /// In memory; lost on restart.
    #[default]
    Memory,
    /// A JSON file rewritten on every change.
    File {
        /// File path.
        path: PathBuf,
    },
}

/// Membership in one cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortConfig {
    /// Cohort name.
    pub name: String,

    /// Bus topic. Defaults to the cohort name.
    #[serde(default)]
    pub topic: Option<String>,

    /// Registry store.
    #[serde(default)]
    pub registry: RegistryStoreConfig,
}

impl CohortConfig {
    /// Creates an in-memory cohort membership.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: None,
            registry: RegistryStoreConfig::Memory,
        }
    }

    /// Sets the bus topic.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Keeps registrations in a file.
    pub fn with_registry_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry = RegistryStoreConfig::File { path: path.into() };
        self
    }

    /// Returns the bus topic.
    pub fn topic(&self) -> &str {
        self.topic.as_deref().unwrap_or(&self.name)
    }
}

/// An audit destination.
///
/// An empty severity list means every severity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditDestinationConfig {
    /// Emits records as `tracing` events.
    Tracing {
        /// Severities to emit.
        #[serde(default)]
        severities: Vec<Severity>,
    },
    /// Keeps recent records in memory for queries.
    Memory {
        /// Records kept before the oldest is dropped.
        #[serde(default = "default_memory_capacity")]
        capacity: usize,
        /// Severities to keep.
        #[serde(default)]
        severities: Vec<Severity>,
    },
    /// Appends records to a JSON lines file.
    JsonLines {
        /// File path.
        path: PathBuf,
        /// Severities to write.
        #[serde(default)]
        severities: Vec<Severity>,
    },
}

fn default_memory_capacity() -> usize {
    10_000
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the cohort crates (trace, debug, info, warn, error).
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Returns the parsed output format.
    pub fn format(&self) -> LogFormat {
        LogFormat::parse(&self.format)
    }
}

fn default_true() -> bool {
    true
}

fn default_watermark_limit() -> usize {
    DEFAULT_WATERMARK_LIMIT
}

fn default_audit() -> Vec<AuditDestinationConfig> {
    vec![AuditDestinationConfig::Tracing {
        severities: Vec::new(),
    }]
}

/// Complete server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name, unique within each cohort.
    pub server_name: String,

    /// Server type reported in registrations.
    #[serde(default)]
    pub server_type: Option<String>,

    /// Owning organization.
    #[serde(default)]
    pub organization: Option<String>,

    /// Identity of the local repository. Generated when absent.
    #[serde(default)]
    pub metadata_collection_id: Option<String>,

    /// Address peers use to reach this server.
    #[serde(default)]
    pub network_address: Option<String>,

    /// Connection descriptor peers use to build a connector to this server.
    #[serde(default)]
    pub connection: Option<serde_json::Value>,

    /// Whether types first introduced by peers are installed.
    #[serde(default = "default_true")]
    pub dynamic_types: bool,

    /// Number of removed or contested guids remembered to recognize
    /// redelivered events.
    #[serde(default = "default_watermark_limit")]
    pub watermark_limit: usize,

    /// Cohorts to join.
    #[serde(default)]
    pub cohorts: Vec<CohortConfig>,

    /// Audit destinations.
    #[serde(default = "default_audit")]
    pub audit: Vec<AuditDestinationConfig>,

    /// Retry policy for outbound sends.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServerConfig {
    /// Creates a configuration with no cohorts.
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            server_type: None,
            organization: None,
            metadata_collection_id: None,
            network_address: None,
            connection: None,
            dynamic_types: true,
            watermark_limit: DEFAULT_WATERMARK_LIMIT,
            cohorts: Vec::new(),
            audit: default_audit(),
            retry: RetryPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Sets the metadata collection id.
    pub fn with_collection_id(mut self, id: impl Into<String>) -> Self {
        self.metadata_collection_id = Some(id.into());
        self
    }

    /// Sets the network address and connection descriptor.
    pub fn with_endpoint(
        mut self,
        network_address: impl Into<String>,
        connection: serde_json::Value,
    ) -> Self {
        self.network_address = Some(network_address.into());
        self.connection = Some(connection);
        self
    }

    /// Adds a cohort.
    pub fn with_cohort(mut self, cohort: CohortConfig) -> Self {
        self.cohorts.push(cohort);
        self
    }

    /// Replaces the audit destinations.
    pub fn with_audit(mut self, audit: Vec<AuditDestinationConfig>) -> Self {
        self.audit = audit;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets whether peer-introduced types are installed.
    pub fn with_dynamic_types(mut self, enabled: bool) -> Self {
        self.dynamic_types = enabled;
        self
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ServerConfig =
            serde_yaml::from_str(content).map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a JSON document.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: ServerConfig =
            serde_json::from_str(content).map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file. `.json` files are read as JSON, anything
    /// else as YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            NodeError::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Saves the configuration as YAML.
    pub fn save_yaml(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| NodeError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Returns the metadata collection id, generating one if none is set.
    ///
    /// Save the configuration afterwards to keep the id across restarts.
    pub fn ensure_collection_id(&mut self) -> &str {
        self.metadata_collection_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
    }

    /// Checks the configuration for errors.
    pub fn validate(&self) -> Result<()> {
        if self.server_name.trim().is_empty() {
            return Err(NodeError::Config("server_name is empty".into()));
        }
        if matches!(self.metadata_collection_id.as_deref(), Some(id) if id.trim().is_empty()) {
            return Err(NodeError::Config("metadata_collection_id is empty".into()));
        }
        if self.cohorts.is_empty() {
            return Err(NodeError::Config("no cohorts configured".into()));
        }
        if self.watermark_limit == 0 {
            return Err(NodeError::Config("watermark_limit must be positive".into()));
        }

        let mut names = HashSet::new();
        let mut topics = HashSet::new();
        let mut files = HashSet::new();
        for cohort in &self.cohorts {
            if cohort.name.trim().is_empty() {
                return Err(NodeError::Config("cohort name is empty".into()));
            }
            if !names.insert(cohort.name.as_str()) {
                return Err(NodeError::Config(format!(
                    "duplicate cohort: {}",
                    cohort.name
                )));
            }
            if cohort.topic().trim().is_empty() {
                return Err(NodeError::Config(format!(
                    "cohort {} has an empty topic",
                    cohort.name
                )));
            }
            if !topics.insert(cohort.topic()) {
                return Err(NodeError::Config(format!(
                    "topic {} is used by more than one cohort",
                    cohort.topic()
                )));
            }
            if let RegistryStoreConfig::File { path } = &cohort.registry {
                if path.as_os_str().is_empty() {
                    return Err(NodeError::Config(format!(
                        "cohort {} has an empty registry path",
                        cohort.name
                    )));
                }
                if !files.insert(path) {
                    return Err(NodeError::Config(format!(
                        "registry file {} is shared by more than one cohort",
                        path.display()
                    )));
                }
            }
        }

        for destination in &self.audit {
            match destination {
                AuditDestinationConfig::Memory { capacity: 0, .. } => {
                    return Err(NodeError::Config(
                        "memory audit destination needs a capacity".into(),
                    ));
                }
                AuditDestinationConfig::JsonLines { path, .. } if path.as_os_str().is_empty() => {
                    return Err(NodeError::Config(
                        "json_lines audit destination needs a path".into(),
                    ));
                }
                _ => {}
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(NodeError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(NodeError::Config("retry.multiplier must be at least 1".into()));
        }

        Ok(())
    }
}
