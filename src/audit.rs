//! Audit logging for consent lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with structured fields,
//! making the audit trail queryable by any log aggregator, with one event
//! type per ledger action.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `consent.requested` | A developer/agent opens a new pending request |
//! | `consent.granted` | A user approves a pending request |
//! | `consent.denied` | A user denies a pending request |
//! | `consent.revoked` | A previously active grant is revoked |
//! | `consent.operation_performed` | A vault-owner operation runs under an active grant |

use serde::Serialize;

/// Structured audit event emitted for every consent lifecycle transition.
#[derive(Debug, Serialize)]
pub struct AuditEvent<'a> {
    /// Event type string (e.g. `"consent.granted"`).
    pub event: &'static str,
    /// Principal the event concerns.
    pub user_id: &'a str,
    /// Caller/agent identifier.
    pub agent_id: &'a str,
    /// Scope string involved.
    pub scope_str: &'a str,
    /// Correlating request id, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<&'a str>,
    /// Human-readable reason, for denial/revocation events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'a str>,
}

impl<'a> AuditEvent<'a> {
    /// Construct a `consent.requested` event.
    #[must_use]
    pub fn requested(user_id: &'a str, agent_id: &'a str, scope_str: &'a str, request_id: &'a str) -> Self {
        Self {
            event: "consent.requested",
            user_id,
            agent_id,
            scope_str,
            request_id: Some(request_id),
            reason: None,
        }
    }

    /// Construct a `consent.granted` event.
    #[must_use]
    pub fn granted(user_id: &'a str, agent_id: &'a str, scope_str: &'a str, request_id: &'a str) -> Self {
        Self {
            event: "consent.granted",
            user_id,
            agent_id,
            scope_str,
            request_id: Some(request_id),
            reason: None,
        }
    }

    /// Construct a `consent.denied` event.
    #[must_use]
    pub fn denied(user_id: &'a str, agent_id: &'a str, scope_str: &'a str, request_id: &'a str) -> Self {
        Self {
            event: "consent.denied",
            user_id,
            agent_id,
            scope_str,
            request_id: Some(request_id),
            reason: None,
        }
    }

    /// Construct a `consent.revoked` event.
    #[must_use]
    pub fn revoked(user_id: &'a str, scope_str: &'a str, reason: &'a str) -> Self {
        Self {
            event: "consent.revoked",
            user_id,
            agent_id: "",
            scope_str,
            request_id: None,
            reason: Some(reason),
        }
    }

    /// Construct a `consent.operation_performed` event.
    #[must_use]
    pub fn operation_performed(user_id: &'a str, agent_id: &'a str, target: &'a str) -> Self {
        Self {
            event: "consent.operation_performed",
            user_id,
            agent_id,
            scope_str: target,
            request_id: None,
            reason: None,
        }
    }
}

/// Emit an audit event via `tracing::info!` with a JSON blob in the `audit`
/// field, e.g. `INFO hushh_consent_core::audit audit={"event":"consent.granted",...}`.
pub fn emit(event: &AuditEvent<'_>) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "consent audit"),
        Err(ref e) => tracing::warn!(error = %e, "failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_event_has_correct_type_and_request_id() {
        let event = AuditEvent::requested("u1", "mcp_dev", "attr.food.*", "r1");
        assert_eq!(event.event, "consent.requested");
        assert_eq!(event.request_id, Some("r1"));
    }

    #[test]
    fn revoked_event_carries_reason_not_agent() {
        let event = AuditEvent::revoked("u1", "attr.food.*", "user requested logout");
        assert_eq!(event.event, "consent.revoked");
        assert_eq!(event.reason, Some("user requested logout"));
        assert_eq!(event.agent_id, "");
    }

    #[test]
    fn all_event_kinds_serialize_to_json() {
        let events = vec![
            AuditEvent::requested("u1", "mcp_dev", "attr.food.*", "r1"),
            AuditEvent::granted("u1", "mcp_dev", "attr.food.*", "r1"),
            AuditEvent::denied("u1", "mcp_dev", "attr.food.*", "r1"),
            AuditEvent::revoked("u1", "attr.food.*", "logout"),
            AuditEvent::operation_performed("u1", "mcp_dev", "read attr.food.cuisine"),
        ];
        for event in events {
            assert!(serde_json::to_string(&event).is_ok());
        }
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::granted("u1", "mcp_dev", "attr.food.*", "r1"));
    }
}
