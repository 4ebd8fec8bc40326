//! # Observability
//!
//! Structured logging for the cohort server. Audit records are a separate
//! concern handled by `cohort-audit`; a `tracing` audit destination bridges
//! the two.

mod logging;

pub use logging::{init_logging, LogFormat};
