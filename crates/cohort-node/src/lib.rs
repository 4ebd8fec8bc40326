//! # Cohort Node
//!
//! A server that joins one or more cohorts on behalf of a local metadata
//! repository.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      CohortServer                        │
//! ├──────────────────────────────────────────────────────────┤
//! │  per cohort:  CohortRegistry ─ EventRouter ─ Listener    │
//! │                      │              │                    │
//! │  shared:      PeerDirectory   TypeDefReconciler          │
//! │                               InstanceConsistencyEngine  │
//! │                      │              │                    │
//! │               AuditTrail ──> tracing / memory / jsonl    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Local changes go through the server so that they are announced to every
//! cohort.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cohort_node::{CohortServer, ServerConfig};
//! use cohort_node::observability::init_logging;
//!
//! # async fn run() -> cohort_node::Result<()> {
//! let config = ServerConfig::load("server.yaml")?;
//! init_logging(&config.logging.level, config.logging.format());
//!
//! let server = CohortServer::builder(config).build().await?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod observability;
pub mod server;

pub use config::{
    AuditDestinationConfig, CohortConfig, LoggingConfig, RegistryStoreConfig, ServerConfig,
};
pub use error::{NodeError, Result};
pub use server::{CohortServer, CohortServerBuilder};
