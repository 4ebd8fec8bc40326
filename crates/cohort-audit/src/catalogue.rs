//! Audit message catalogue.
//!
//! Every condition the cohort layer reports is a static [`AuditDefinition`]
//! keyed by a stable id. Components refer to definitions through the
//! constants in [`codes`] and supply positional parameters; the text of a
//! message is produced by [`format_message`].

use crate::Severity;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// One catalogued audit condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditDefinition {
    /// Stable message id.
    pub id: &'static str,
    /// Severity of records produced for this condition.
    pub severity: Severity,
    /// Message template with `{n}` placeholders.
    pub template: &'static str,
    /// What the system did.
    pub system_action: &'static str,
    /// What an administrator should do.
    pub user_action: &'static str,
}

/// Stable message ids.
pub mod codes {
    #![allow(missing_docs)]

    pub const SERVER_STARTING: &str = "SERVER_STARTING";
    pub const SERVER_STOPPED: &str = "SERVER_STOPPED";
    pub const COHORT_CONNECTING: &str = "COHORT_CONNECTING";
    pub const COHORT_REGISTERING: &str = "COHORT_REGISTERING";
    pub const COHORT_ACTIVE: &str = "COHORT_ACTIVE";
    pub const COHORT_REFRESHING: &str = "COHORT_REFRESHING";
    pub const COHORT_REFRESH_REQUESTED: &str = "COHORT_REFRESH_REQUESTED";
    pub const COHORT_DISCONNECTING: &str = "COHORT_DISCONNECTING";
    pub const COHORT_UNREGISTERING: &str = "COHORT_UNREGISTERING";
    pub const NEW_MEMBER_REGISTERED: &str = "NEW_MEMBER_REGISTERED";
    pub const MEMBER_REFRESHED: &str = "MEMBER_REFRESHED";
    pub const MEMBER_UNREGISTERED: &str = "MEMBER_UNREGISTERED";
    pub const MEMBER_DEPARTED_INSTANCES: &str = "MEMBER_DEPARTED_INSTANCES";
    pub const REGISTRATION_MISSING_COLLECTION_ID: &str = "REGISTRATION_MISSING_COLLECTION_ID";
    pub const REGISTRATION_MISSING_SERVER_NAME: &str = "REGISTRATION_MISSING_SERVER_NAME";
    pub const REGISTRATION_MISSING_ADDRESS: &str = "REGISTRATION_MISSING_ADDRESS";
    pub const REGISTRATION_MISSING_CONNECTION: &str = "REGISTRATION_MISSING_CONNECTION";
    pub const DUPLICATE_SERVER_NAME: &str = "DUPLICATE_SERVER_NAME";
    pub const DUPLICATE_NETWORK_ADDRESS: &str = "DUPLICATE_NETWORK_ADDRESS";
    pub const DUPLICATE_CONNECTION: &str = "DUPLICATE_CONNECTION";
    pub const INCOMING_CONFLICTING_METADATA_COLLECTION_ID: &str =
        "INCOMING_CONFLICTING_METADATA_COLLECTION_ID";
    pub const INCOMING_CONFLICTING_LOCAL_METADATA_COLLECTION_ID: &str =
        "INCOMING_CONFLICTING_LOCAL_METADATA_COLLECTION_ID";
    pub const REGISTRATION_ERROR: &str = "REGISTRATION_ERROR";
    pub const REGISTRATION_SEND_FAILED: &str = "REGISTRATION_SEND_FAILED";
    pub const REGISTRY_STORE_FAILED: &str = "REGISTRY_STORE_FAILED";
    pub const NEW_TYPE_ADDED: &str = "NEW_TYPE_ADDED";
    pub const NEW_TYPE_NOT_SUPPORTED: &str = "NEW_TYPE_NOT_SUPPORTED";
    pub const TYPE_UPDATED: &str = "TYPE_UPDATED";
    pub const INCOMING_TYPEDEF_PATCH_MISMATCH: &str = "INCOMING_TYPEDEF_PATCH_MISMATCH";
    pub const OUTGOING_TYPEDEF_PATCH_MISMATCH: &str = "OUTGOING_TYPEDEF_PATCH_MISMATCH";
    pub const CONFLICTING_TYPEDEFS: &str = "CONFLICTING_TYPEDEFS";
    pub const INCOMING_CONFLICTING_TYPEDEFS: &str = "INCOMING_CONFLICTING_TYPEDEFS";
    pub const TYPE_REMOVED: &str = "TYPE_REMOVED";
    pub const TYPE_REMOVAL_REFUSED: &str = "TYPE_REMOVAL_REFUSED";
    pub const TYPE_PATCH_FOR_UNKNOWN_TYPE: &str = "TYPE_PATCH_FOR_UNKNOWN_TYPE";
    pub const REMOTE_TYPE_AHEAD: &str = "REMOTE_TYPE_AHEAD";
    pub const LOCAL_TYPE_AHEAD: &str = "LOCAL_TYPE_AHEAD";
    pub const DUPLICATE_INSTANCES_FOR_GUID: &str = "DUPLICATE_INSTANCES_FOR_GUID";
    pub const INSTANCE_SUCCESSFULLY_REIDENTIFIED: &str = "INSTANCE_SUCCESSFULLY_REIDENTIFIED";
    pub const UNABLE_TO_RE_IDENTIFY_INSTANCE: &str = "UNABLE_TO_RE_IDENTIFY_INSTANCE";
    pub const INSTANCE_CONFLICT_REPORTED: &str = "INSTANCE_CONFLICT_REPORTED";
    pub const INSTANCES_WITH_CONFLICTING_TYPES: &str = "INSTANCES_WITH_CONFLICTING_TYPES";
    pub const LOCAL_INSTANCE_WITH_CONFLICTING_TYPES: &str =
        "LOCAL_INSTANCE_WITH_CONFLICTING_TYPES";
    pub const INCOMING_EVENT: &str = "INCOMING_EVENT";
    pub const BAD_EVENT_INSTANCE: &str = "BAD_EVENT_INSTANCE";
    pub const BAD_EVENT: &str = "BAD_EVENT";
    pub const PROCESS_UNKNOWN_EVENT: &str = "PROCESS_UNKNOWN_EVENT";
    pub const UNEXPECTED_EXCEPTION_FROM_EVENT: &str = "UNEXPECTED_EXCEPTION_FROM_EVENT";
    pub const OUTBOUND_EVENT_SEND_FAILED: &str = "OUTBOUND_EVENT_SEND_FAILED";
    pub const OUTBOUND_EVENTS_DRAINED: &str = "OUTBOUND_EVENTS_DRAINED";
}

const fn def(
    id: &'static str,
    severity: Severity,
    template: &'static str,
    system_action: &'static str,
    user_action: &'static str,
) -> AuditDefinition {
    AuditDefinition {
        id,
        severity,
        template,
        system_action,
        user_action,
    }
}

static DEFINITIONS: &[AuditDefinition] = &[
    def(
        codes::SERVER_STARTING,
        Severity::Startup,
        "Server {0} is starting with metadata collection id {1}",
        "The server is connecting to its configured cohorts.",
        "No action is required.",
    ),
    def(
        codes::SERVER_STOPPED,
        Severity::Shutdown,
        "Server {0} has left all cohorts",
        "Inbound event processing has stopped.",
        "No action is required.",
    ),
    def(
        codes::COHORT_CONNECTING,
        Severity::Startup,
        "Connecting to cohort {0}",
        "The server is subscribing to the cohort topic.",
        "No action is required.",
    ),
    def(
        codes::COHORT_REGISTERING,
        Severity::Cohort,
        "Registering with cohort {0} using metadata collection id {1}",
        "The local registration was broadcast to the cohort.",
        "No action is required.",
    ),
    def(
        codes::COHORT_ACTIVE,
        Severity::Cohort,
        "Registration with cohort {0} is active; first response came from {1}",
        "The server is exchanging metadata with the cohort.",
        "No action is required.",
    ),
    def(
        codes::COHORT_REFRESHING,
        Severity::Cohort,
        "Refreshing registration with cohort {0}",
        "The local registration was re-broadcast to the cohort.",
        "No action is required.",
    ),
    def(
        codes::COHORT_REFRESH_REQUESTED,
        Severity::Cohort,
        "Requesting every member of cohort {0} to refresh its registration",
        "A refresh request was broadcast to the cohort.",
        "No action is required.",
    ),
    def(
        codes::COHORT_DISCONNECTING,
        Severity::Shutdown,
        "Disconnecting from cohort {0}",
        "Inbound events for the cohort are no longer dispatched. The registration is kept.",
        "No action is required.",
    ),
    def(
        codes::COHORT_UNREGISTERING,
        Severity::Shutdown,
        "Unregistering from cohort {0}",
        "The unregistration was broadcast and the local registration purged.",
        "No action is required.",
    ),
    def(
        codes::NEW_MEMBER_REGISTERED,
        Severity::Cohort,
        "New member {0} with metadata collection id {1} registered with cohort {2}",
        "The member was added to the cohort registry.",
        "No action is required.",
    ),
    def(
        codes::MEMBER_REFRESHED,
        Severity::Cohort,
        "Member {0} with metadata collection id {1} refreshed its registration with cohort {2}",
        "The member's registration was updated in the cohort registry.",
        "No action is required.",
    ),
    def(
        codes::MEMBER_UNREGISTERED,
        Severity::Cohort,
        "Member with metadata collection id {0} unregistered from cohort {1}",
        "The member was removed from the cohort registry.",
        "No action is required.",
    ),
    def(
        codes::MEMBER_DEPARTED_INSTANCES,
        Severity::Cohort,
        "{0} reference copies homed in departed member {1} are now marked deregistered",
        "The copies are kept but no longer refreshed by their home.",
        "Purge the copies if the member is not expected to return.",
    ),
    def(
        codes::REGISTRATION_MISSING_COLLECTION_ID,
        Severity::Error,
        "Registration from server {0} in cohort {1} has no metadata collection id",
        "The registration was rejected.",
        "Configure a metadata collection id on the remote server and restart it.",
    ),
    def(
        codes::REGISTRATION_MISSING_SERVER_NAME,
        Severity::Error,
        "Registration for metadata collection id {0} in cohort {1} has no server name",
        "The registration was rejected.",
        "Configure a server name on the remote server and restart it.",
    ),
    def(
        codes::REGISTRATION_MISSING_ADDRESS,
        Severity::Action,
        "Member {0} with metadata collection id {1} registered with cohort {2} without a network address",
        "The registration was accepted but marked as suspect.",
        "Configure a network address on the remote server so that other members can reach it.",
    ),
    def(
        codes::REGISTRATION_MISSING_CONNECTION,
        Severity::Action,
        "Member {0} with metadata collection id {1} registered with cohort {2} without a connection descriptor",
        "The registration was accepted but marked as suspect. No connector can be built for the member.",
        "Configure a remote connector on the remote server.",
    ),
    def(
        codes::DUPLICATE_SERVER_NAME,
        Severity::Action,
        "Member with metadata collection id {0} registered with cohort {1} using server name {2}, which is already used by metadata collection id {3}",
        "The registration was accepted but marked as suspect.",
        "Give each server in the cohort a unique name.",
    ),
    def(
        codes::DUPLICATE_NETWORK_ADDRESS,
        Severity::Action,
        "Member with metadata collection id {0} registered with cohort {1} using network address {2}, which is already used by metadata collection id {3}",
        "The registration was accepted but marked as suspect.",
        "Check whether two servers are configured with the same address.",
    ),
    def(
        codes::DUPLICATE_CONNECTION,
        Severity::Action,
        "Member with metadata collection id {0} registered with cohort {1} using the same connection descriptor as metadata collection id {2}",
        "The registration was accepted but marked as suspect.",
        "Check whether two servers are configured with the same connector.",
    ),
    def(
        codes::INCOMING_CONFLICTING_METADATA_COLLECTION_ID,
        Severity::Action,
        "Server {0} registered with cohort {1} using metadata collection id {2}, which is already used by server {3}",
        "The registration was ignored and the existing registration kept.",
        "Update the metadata collection id of one of the servers to remove the conflict.",
    ),
    def(
        codes::INCOMING_CONFLICTING_LOCAL_METADATA_COLLECTION_ID,
        Severity::Action,
        "Server {0} registered with cohort {1} using this server's metadata collection id {2}",
        "The registration was ignored and the remote server was told of the conflict.",
        "Update the metadata collection id of one of the servers to remove the conflict.",
    ),
    def(
        codes::REGISTRATION_ERROR,
        Severity::Error,
        "Member {0} refused this server's registration with cohort {1}: {2}",
        "The member will not exchange metadata with this server.",
        "Correct this server's registration details and refresh the registration.",
    ),
    def(
        codes::REGISTRATION_SEND_FAILED,
        Severity::Exception,
        "Unable to send the {0} event to cohort {1}",
        "The event was not sent. The caller retries according to its policy.",
        "Check the event bus connection for the cohort.",
    ),
    def(
        codes::REGISTRY_STORE_FAILED,
        Severity::Exception,
        "The registry store for cohort {0} failed during {1}",
        "Participation in this cohort stopped. Other cohorts are unaffected.",
        "Check the registry store configuration for the cohort and reconnect.",
    ),
    def(
        codes::NEW_TYPE_ADDED,
        Severity::Types,
        "Type {0} ({1}) version {2} from {3} was added",
        "The type is available for use.",
        "No action is required.",
    ),
    def(
        codes::NEW_TYPE_NOT_SUPPORTED,
        Severity::Info,
        "Type {0} ({1}) from {2} was not added because this server does not support dynamic types",
        "The type was discarded.",
        "No action is required unless instances of this type are needed locally.",
    ),
    def(
        codes::TYPE_UPDATED,
        Severity::Types,
        "Type {0} ({1}) was updated from version {2} to version {3} by {4}",
        "The newer version is available for use.",
        "No action is required.",
    ),
    def(
        codes::INCOMING_TYPEDEF_PATCH_MISMATCH,
        Severity::Action,
        "Patch for type {0} ({1}) version {2} from {3} was rejected because the local version is {4}",
        "The local version was kept and the sender was told of the mismatch.",
        "Bring the type definitions on both servers to the same content and version.",
    ),
    def(
        codes::OUTGOING_TYPEDEF_PATCH_MISMATCH,
        Severity::Action,
        "Member {0} rejected this server's version {1} of type {2} ({3}) because it holds version {4}",
        "The remote member kept its version.",
        "Bring the type definitions on both servers to the same content and version.",
    ),
    def(
        codes::CONFLICTING_TYPEDEFS,
        Severity::Action,
        "Type {0} ({1}) from {2} conflicts with local type {3} ({4})",
        "The incoming definition was rejected and the sender was told of the conflict.",
        "Correct the type names or guids so that each name maps to one guid across the cohort.",
    ),
    def(
        codes::INCOMING_CONFLICTING_TYPEDEFS,
        Severity::Action,
        "Member {0} reports that local type {1} ({2}) conflicts with its type {3} ({4})",
        "No local change was made.",
        "Correct the type names or guids so that each name maps to one guid across the cohort.",
    ),
    def(
        codes::TYPE_REMOVED,
        Severity::Types,
        "Type {0} ({1}) was removed at the request of {2}",
        "The type is no longer available for use.",
        "No action is required.",
    ),
    def(
        codes::TYPE_REMOVAL_REFUSED,
        Severity::Action,
        "Request from {0} to remove type {1} ({2}) was refused because the type came from {3}",
        "The type was kept.",
        "Only types installed ad hoc can be removed at runtime.",
    ),
    def(
        codes::TYPE_PATCH_FOR_UNKNOWN_TYPE,
        Severity::Action,
        "Patch for unknown type {0} ({1}) version {2} from {3} was discarded",
        "The patch was not applied.",
        "Request a refresh from the cohort so that the full type definition is resent.",
    ),
    def(
        codes::REMOTE_TYPE_AHEAD,
        Severity::Types,
        "Member {0} holds type {1} ({2}) at version {3} and the local version is {4}",
        "The newer version will be applied when its patch arrives.",
        "No action is required.",
    ),
    def(
        codes::LOCAL_TYPE_AHEAD,
        Severity::Types,
        "Member {0} holds type {1} ({2}) at version {3}; local version {4} was offered",
        "The local version was sent to the cohort as a patch.",
        "No action is required.",
    ),
    def(
        codes::DUPLICATE_INSTANCES_FOR_GUID,
        Severity::Action,
        "Instance {0} of type {1} homed in {2} has the same guid as an instance homed in {3}",
        "Reference copies of the targeted instance were removed and a re-identification was attempted.",
        "Check that both repositories are not loading the same content as home instances.",
    ),
    def(
        codes::INSTANCE_SUCCESSFULLY_REIDENTIFIED,
        Severity::Decision,
        "Instance {0} homed in {1} was re-identified as {2}",
        "The guid collision was resolved.",
        "No action is required.",
    ),
    def(
        codes::UNABLE_TO_RE_IDENTIFY_INSTANCE,
        Severity::Error,
        "Unable to re-identify instance {0} homed in {1}: {2}",
        "The duplicate guid remains in the cohort. Local reference copies were removed.",
        "Re-identify one of the instances manually.",
    ),
    def(
        codes::INSTANCE_CONFLICT_REPORTED,
        Severity::Action,
        "Member {0} reports that local instance {1} shares its guid with an instance homed in {2}",
        "No local change was made.",
        "Re-identify the local instance if it is the later copy.",
    ),
    def(
        codes::INSTANCES_WITH_CONFLICTING_TYPES,
        Severity::Action,
        "Instance {0} from {1} has type {2} version {3}, which conflicts with type {4} version {5} held locally",
        "The local reference copy was removed until a reconciled version arrives.",
        "Check the type definitions on the home repository of the instance.",
    ),
    def(
        codes::LOCAL_INSTANCE_WITH_CONFLICTING_TYPES,
        Severity::Action,
        "Local instance {0} has type {1} version {2}, which conflicts with type {3} version {4} reported by {5}",
        "The local instance was kept and the sender was told of the conflict.",
        "Check the type definitions used by this repository.",
    ),
    def(
        codes::INCOMING_EVENT,
        Severity::Event,
        "Processed {0} event for {1} {2} from {3}",
        "The local repository was updated.",
        "No action is required.",
    ),
    def(
        codes::BAD_EVENT_INSTANCE,
        Severity::Error,
        "Instance event {0} from {1} could not be applied: {2}",
        "The event was dropped.",
        "Check the version of the sending server.",
    ),
    def(
        codes::BAD_EVENT,
        Severity::Error,
        "Unreadable event received from cohort {0}: {1}",
        "The event was dropped.",
        "Check which servers are publishing to the cohort topic.",
    ),
    def(
        codes::PROCESS_UNKNOWN_EVENT,
        Severity::Error,
        "Event with category {0} and kind {1} from {2} is not recognized",
        "The event was ignored.",
        "Check whether the sending server runs a newer protocol version.",
    ),
    def(
        codes::UNEXPECTED_EXCEPTION_FROM_EVENT,
        Severity::Exception,
        "Unexpected failure processing {0} event from {1}: {2}",
        "The event was abandoned. Later events are processed normally.",
        "Review the additional information to diagnose the failure.",
    ),
    def(
        codes::OUTBOUND_EVENT_SEND_FAILED,
        Severity::Exception,
        "Unable to publish {0} event to cohort {1}",
        "The event was kept in the outbound buffer.",
        "Check the event bus connection for the cohort.",
    ),
    def(
        codes::OUTBOUND_EVENTS_DRAINED,
        Severity::Info,
        "Sent {0} buffered events to cohort {1}",
        "The outbound buffer is empty.",
        "No action is required.",
    ),
];

static CATALOGUE: Lazy<HashMap<&'static str, &'static AuditDefinition>> =
    Lazy::new(|| DEFINITIONS.iter().map(|d| (d.id, d)).collect());

/// Looks up a definition by id.
#[must_use]
pub fn lookup(id: &str) -> Option<&'static AuditDefinition> {
    CATALOGUE.get(id).copied()
}

/// Returns every catalogued definition.
#[must_use]
pub fn definitions() -> &'static [AuditDefinition] {
    DEFINITIONS
}

/// Substitutes `{n}` placeholders with the n-th parameter.
///
/// Placeholders without a matching parameter are left as they are, and
/// substituted text is never rescanned.
#[must_use]
pub fn format_message(template: &str, params: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let param = after.find('}').and_then(|close| {
            let index = &after[..close];
            if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let value = index.parse::<usize>().ok().and_then(|i| params.get(i))?;
            Some((value, close))
        });

        match param {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_format_connecting() {
        assert_eq!(
            format_message("Connecting to cohort {0}", &["cohortA"]),
            "Connecting to cohort cohortA"
        );
    }

    #[test]
    fn test_format_out_of_order() {
        assert_eq!(format_message("{1} then {0}", &["a", "b"]), "b then a");
    }

    #[test]
    fn test_format_missing_param() {
        assert_eq!(format_message("{0} and {3}", &["a"]), "a and {3}");
        assert_eq!(format_message("{x} {", &["a"]), "{x} {");
    }

    #[test]
    fn test_format_no_rescan() {
        assert_eq!(format_message("{0}", &["{1}", "b"]), "{1}");
    }

    #[test]
    fn test_catalogue_ids_unique() {
        let ids: HashSet<_> = definitions().iter().map(|d| d.id).collect();
        assert_eq!(ids.len(), definitions().len());
    }

    #[test]
    fn test_catalogue_lookup() {
        let def = lookup(codes::INCOMING_CONFLICTING_METADATA_COLLECTION_ID).unwrap();
        assert_eq!(def.severity, Severity::Action);
        assert!(def.user_action.contains("metadata collection id"));

        assert_eq!(
            lookup(codes::PROCESS_UNKNOWN_EVENT).unwrap().severity,
            Severity::Error
        );
        assert_eq!(lookup(codes::INCOMING_EVENT).unwrap().severity, Severity::Event);
        assert!(lookup("NOT_A_CODE").is_none());
    }

    proptest! {
        #[test]
        fn prop_single_placeholder(prefix in "[^{}]*", param in "[^{}]*", suffix in "[^{}]*") {
            let template = format!("{prefix}{{0}}{suffix}");
            prop_assert_eq!(
                format_message(&template, &[param.as_str()]),
                format!("{prefix}{param}{suffix}")
            );
        }

        #[test]
        fn prop_plain_template_unchanged(template in "[^{]*", params in proptest::collection::vec(".*", 0..4)) {
            let params: Vec<&str> = params.iter().map(String::as_str).collect();
            prop_assert_eq!(format_message(&template, &params), template);
        }
    }
}
