//! The audit trail.

use crate::catalogue::{self, AuditDefinition};
use crate::{AuditDestination, AuditLogRecord, AuditOriginator, Severity};
use cohort_types::Timestamp;
use std::fmt;
use std::sync::Arc;

/// Formats records and fans them out to destinations.
///
/// Recording never fails: a destination error is logged locally and the
/// remaining destinations still receive the record.
pub struct AuditTrail {
    originator: AuditOriginator,
    destinations: Vec<Arc<dyn AuditDestination>>,
}

impl fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditTrail")
            .field("originator", &self.originator)
            .field("destinations", &self.destinations.len())
            .finish()
    }
}

impl AuditTrail {
    /// Creates a trail with no destinations.
    pub fn new(originator: AuditOriginator) -> Self {
        Self {
            originator,
            destinations: Vec::new(),
        }
    }

    /// Adds a destination.
    pub fn with_destination(mut self, destination: Arc<dyn AuditDestination>) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Returns the originator stamped on records.
    pub fn originator(&self) -> &AuditOriginator {
        &self.originator
    }

    /// Formats a record and delivers it to every supporting destination.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        component: &str,
        severity: Severity,
        message_id: &str,
        template: &str,
        params: &[&str],
        additional_information: Vec<String>,
        system_action: &str,
        user_action: &str,
    ) -> AuditLogRecord {
        let record = AuditLogRecord {
            guid: uuid::Uuid::new_v4().to_string(),
            timestamp: Timestamp::now(),
            originator: self.originator.clone(),
            reporting_component: component.to_string(),
            severity,
            message_id: message_id.to_string(),
            formatted_message: catalogue::format_message(template, params),
            parameters: params.iter().map(|p| p.to_string()).collect(),
            additional_information,
            system_action: system_action.to_string(),
            user_action: user_action.to_string(),
        };

        if severity.is_error() {
            tracing::error!(
                message_id = %record.message_id,
                component = %record.reporting_component,
                details = ?record.additional_information,
                "{}",
                record.formatted_message
            );
        }

        for destination in &self.destinations {
            if !destination.supports(severity) {
                continue;
            }
            if let Err(e) = destination.store(&record) {
                tracing::warn!(
                    destination = %destination.descriptor().name,
                    message_id = %record.message_id,
                    error = %e,
                    "audit destination failed"
                );
            }
        }

        record
    }

    /// Records a catalogued condition.
    pub fn record_definition(
        &self,
        component: &str,
        definition: &AuditDefinition,
        params: &[&str],
        additional_information: Vec<String>,
    ) -> AuditLogRecord {
        self.record(
            component,
            definition.severity,
            definition.id,
            definition.template,
            params,
            additional_information,
            definition.system_action,
            definition.user_action,
        )
    }

    /// Records the catalogued condition `code`.
    ///
    /// Returns `None`, after logging a warning, if the code is not catalogued.
    pub fn log(
        &self,
        component: &str,
        code: &str,
        params: &[&str],
        additional_information: Vec<String>,
    ) -> Option<AuditLogRecord> {
        match catalogue::lookup(code) {
            Some(definition) => {
                Some(self.record_definition(component, definition, params, additional_information))
            }
            None => {
                tracing::warn!(component, code, "unknown audit code");
                None
            }
        }
    }

    /// Records `code` with the failure description appended to the
    /// additional information.
    pub fn log_exception(
        &self,
        component: &str,
        code: &str,
        params: &[&str],
        mut additional_information: Vec<String>,
        error: &dyn fmt::Display,
    ) -> Option<AuditLogRecord> {
        additional_information.push(error.to_string());
        self.log(component, code, params, additional_information)
    }

    /// Returns a handle that reports as `component`.
    pub fn component(self: &Arc<Self>, component: impl Into<String>) -> ComponentAudit {
        ComponentAudit {
            trail: Arc::clone(self),
            component: component.into(),
        }
    }
}

/// An audit trail bound to one reporting component.
#[derive(Debug, Clone)]
pub struct ComponentAudit {
    trail: Arc<AuditTrail>,
    component: String,
}

impl ComponentAudit {
    /// Returns the component name.
    pub fn name(&self) -> &str {
        &self.component
    }

    /// Returns the underlying trail.
    pub fn trail(&self) -> &Arc<AuditTrail> {
        &self.trail
    }

    /// Records a catalogued condition.
    pub fn log(&self, code: &str, params: &[&str]) -> Option<AuditLogRecord> {
        self.trail.log(&self.component, code, params, Vec::new())
    }

    /// Records a catalogued condition with additional information.
    pub fn log_with(
        &self,
        code: &str,
        params: &[&str],
        additional_information: Vec<String>,
    ) -> Option<AuditLogRecord> {
        self.trail
            .log(&self.component, code, params, additional_information)
    }

    /// Records a catalogued condition caused by `error`.
    pub fn log_exception(
        &self,
        code: &str,
        params: &[&str],
        error: &dyn fmt::Display,
    ) -> Option<AuditLogRecord> {
        self.trail
            .log_exception(&self.component, code, params, Vec::new(), error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::codes;
    use crate::error::{AuditError, Result};
    use crate::{DestinationDescriptor, MemoryDestination};

    struct FailingDestination;

    impl AuditDestination for FailingDestination {
        fn descriptor(&self) -> DestinationDescriptor {
            DestinationDescriptor {
                name: "broken".into(),
                supported_severities: Severity::ALL.to_vec(),
                implementation: "test".into(),
            }
        }

        fn store(&self, _record: &AuditLogRecord) -> Result<()> {
            Err(AuditError::Destination {
                name: "broken".into(),
                reason: "offline".into(),
            })
        }
    }

    fn trail_with(destinations: Vec<Arc<dyn AuditDestination>>) -> Arc<AuditTrail> {
        let mut trail = AuditTrail::new(AuditOriginator::new("server-a", "mc-1"));
        for d in destinations {
            trail = trail.with_destination(d);
        }
        Arc::new(trail)
    }

    #[test]
    fn test_record_formats_and_stamps() {
        let memory = Arc::new(MemoryDestination::new());
        let trail = trail_with(vec![memory.clone()]);

        let record = trail.record(
            "registry",
            Severity::Startup,
            "COHORT_CONNECTING",
            "Connecting to cohort {0}",
            &["cohortA"],
            vec![],
            "",
            "",
        );

        assert_eq!(record.formatted_message, "Connecting to cohort cohortA");
        assert_eq!(record.originator.metadata_collection_id, "mc-1");
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn test_failing_destination_isolated() {
        let first = Arc::new(MemoryDestination::new());
        let last = Arc::new(MemoryDestination::new());
        let trail = trail_with(vec![first.clone(), Arc::new(FailingDestination), last.clone()]);

        let record = trail.log("router", codes::BAD_EVENT, &["c1", "eof"], vec![]);
        assert!(record.is_some());
        assert_eq!(first.len(), 1);
        assert_eq!(last.len(), 1);
    }

    #[test]
    fn test_unsupported_severity_skipped() {
        let errors_only =
            Arc::new(MemoryDestination::new().with_severities(vec![Severity::Error]));
        let trail = trail_with(vec![errors_only.clone()]);

        trail.log("router", codes::INCOMING_EVENT, &["create", "entity", "i-1", "mc-2"], vec![]);
        assert!(errors_only.is_empty());

        trail.log("router", codes::BAD_EVENT, &["c1", "eof"], vec![]);
        assert_eq!(errors_only.len(), 1);
    }

    #[test]
    fn test_log_uses_catalogue() {
        let memory = Arc::new(MemoryDestination::new());
        let trail = trail_with(vec![memory.clone()]);

        let record = trail
            .log(
                "registry",
                codes::INCOMING_CONFLICTING_METADATA_COLLECTION_ID,
                &["Y", "cohortA", "mc-1", "X"],
                vec![],
            )
            .unwrap();
        assert_eq!(record.severity, Severity::Action);
        assert!(record.formatted_message.contains("already used by server X"));
        assert!(!record.user_action.is_empty());
        assert_eq!(record.parameters.len(), 4);
    }

    #[test]
    fn test_unknown_code() {
        let trail = trail_with(vec![]);
        assert!(trail.log("c", "NO_SUCH_CODE", &[], vec![]).is_none());
    }

    #[test]
    fn test_log_exception_appends_error() {
        let memory = Arc::new(MemoryDestination::new());
        let trail = trail_with(vec![memory.clone()]);
        let audit = trail.component("router");

        let err = std::io::Error::other("bus closed");
        let record = audit
            .log_exception(
                codes::UNEXPECTED_EXCEPTION_FROM_EVENT,
                &["create", "mc-2", "bus closed"],
                &err,
            )
            .unwrap();

        assert_eq!(record.reporting_component, "router");
        assert_eq!(record.severity, Severity::Exception);
        assert_eq!(record.additional_information, vec!["bus closed".to_string()]);
    }
}
