//! Audit severities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classification of an audit record.
///
/// Severity routes records to destinations; it has no effect on control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// General information.
    Info,
    /// An event was received or sent.
    Event,
    /// A decision was taken.
    Decision,
    /// An administrator needs to act.
    Action,
    /// A problem that stopped an operation.
    Error,
    /// An unexpected failure.
    Exception,
    /// A security-relevant condition.
    Security,
    /// Component startup.
    Startup,
    /// Component shutdown.
    Shutdown,
    /// Change to a metadata asset.
    Asset,
    /// Change to type definitions.
    Types,
    /// Change to cohort membership.
    Cohort,
    /// Diagnostic trace.
    Trace,
    /// Performance monitoring.
    PerfMon,
}

impl Severity {
    /// Every severity.
    pub const ALL: [Severity; 14] = [
        Severity::Info,
        Severity::Event,
        Severity::Decision,
        Severity::Action,
        Severity::Error,
        Severity::Exception,
        Severity::Security,
        Severity::Startup,
        Severity::Shutdown,
        Severity::Asset,
        Severity::Types,
        Severity::Cohort,
        Severity::Trace,
        Severity::PerfMon,
    ];

    /// Returns the upper-case name used in records and configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Event => "EVENT",
            Severity::Decision => "DECISION",
            Severity::Action => "ACTION",
            Severity::Error => "ERROR",
            Severity::Exception => "EXCEPTION",
            Severity::Security => "SECURITY",
            Severity::Startup => "STARTUP",
            Severity::Shutdown => "SHUTDOWN",
            Severity::Asset => "ASSET",
            Severity::Types => "TYPES",
            Severity::Cohort => "COHORT",
            Severity::Trace => "TRACE",
            Severity::PerfMon => "PERFMON",
        }
    }

    /// Returns true for severities mirrored to the local error stream.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Severity::Error | Severity::Exception)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .into_iter()
            .find(|sev| sev.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown severity: {s}"))
    }
}
