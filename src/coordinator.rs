//! Approval Coordinator — orchestrates the two-step human-in-the-loop
//! consent flow: a developer/agent requests access, a human approves or
//! denies out-of-band, the coordinator mints a token on grant and resolves
//! the caller's wait via the Notification Bus.
//!
//! The state machine mirrors the source system's `request_consent`
//! endpoint: already-granted short-circuit, denial cooldown, pending-exists
//! dedup, and only then a fresh `REQUESTED` event. The coordinator never
//! blocks an HTTP handler itself — waiting for resolution is the caller's
//! choice, made by subscribing to the [`crate::notify`] bus.

use std::sync::Arc;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use serde_json::json;
use uuid::Uuid;

use crate::audit::{self, AuditEvent};
use crate::error::{ConsentError, Result};
use crate::ledger::{ConsentAction, ConsentEvent, Ledger, LedgerActiveLookup, NewConsentEvent};
use crate::notify::NotificationBus;
use crate::revocation::RevocationIndex;
use crate::scope::{describe, normalize, ScopeKind};
use crate::token::TokenCodec;

/// A developer/agent registered to request consent, with the set of scopes
/// it's been approved for.
#[derive(Debug, Clone)]
pub struct DeveloperInfo {
    /// Human-readable developer/agent name, for audit logging.
    pub name: String,
    /// Scopes this developer may request. `"*"` grants every scope.
    pub approved_scopes: Vec<String>,
}

impl DeveloperInfo {
    fn is_approved_for(&self, scope_str: &str) -> bool {
        self.approved_scopes.iter().any(|s| s == "*" || s == scope_str)
    }
}

/// External collaborator: resolves a developer token to its registration
/// record. Concrete implementation and data source are out of this core's
/// scope; [`StaticDeveloperRegistry`] is a minimal in-memory reference
/// implementation sufficient to exercise the coordinator end to end.
pub trait DeveloperRegistry: Send + Sync {
    /// Look up a developer by its bearer token. `None` means unregistered.
    fn lookup(&self, developer_token: &str) -> Option<DeveloperInfo>;
}

/// Config-loaded, in-memory [`DeveloperRegistry`].
pub struct StaticDeveloperRegistry {
    developers: std::collections::HashMap<String, DeveloperInfo>,
}

impl StaticDeveloperRegistry {
    /// Build a registry from `(developer_token, info)` pairs, typically
    /// loaded from configuration at startup.
    #[must_use]
    pub fn new(developers: impl IntoIterator<Item = (String, DeveloperInfo)>) -> Self {
        Self {
            developers: developers.into_iter().collect(),
        }
    }
}

impl DeveloperRegistry for StaticDeveloperRegistry {
    fn lookup(&self, developer_token: &str) -> Option<DeveloperInfo> {
        self.developers.get(developer_token).cloned()
    }
}

/// The outcome of a [`Coordinator::request_consent`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentOutcome {
    /// An unexpired grant for this `(user_id, scope_str)` already exists;
    /// here is its token.
    AlreadyGranted {
        /// Wire-format consent token.
        token: String,
    },
    /// No prior grant or pending request existed; a fresh `REQUESTED` event
    /// was appended.
    Pending {
        /// Id the caller should poll / subscribe on.
        request_id: String,
    },
    /// A request for this `(user_id, scope_str)` was already pending; no new
    /// event was appended.
    PendingExists {
        /// Id of the pre-existing pending request.
        request_id: String,
    },
    /// This scope was denied for this user within the cooldown window.
    DeniedCooldown,
}

/// Clamp bounds for the pending window, in hours.
const MIN_EXPIRY_HOURS: i64 = 1;
const MAX_EXPIRY_HOURS: i64 = 24;
const MS_PER_HOUR: i64 = 3_600_000;
const DEFAULT_DENIAL_COOLDOWN_S: i64 = 300;
const DEFAULT_TOKEN_TTL_MS: i64 = 7 * 24 * 3_600_000;

/// Orchestrates `request_consent`, `grant`, and `deny`, and the post-grant
/// bounded retry that closes the replication-lag window between a
/// `CONSENT_GRANTED` event landing and a waiting caller observing it.
pub struct Coordinator {
    ledger: Arc<dyn Ledger>,
    registry: Arc<dyn DeveloperRegistry>,
    codec: Arc<TokenCodec>,
    revocation: Arc<RevocationIndex>,
    bus: Option<Arc<NotificationBus>>,
    denial_cooldown_s: i64,
    default_token_ttl_ms: i64,
}

impl Coordinator {
    /// Build a coordinator from its collaborators, using the default denial
    /// cooldown (300s) and token TTL (7 days). No Notification Bus is
    /// wired; use [`with_bus`](Self::with_bus) to push ledger events to
    /// subscribers as they're appended.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        registry: Arc<dyn DeveloperRegistry>,
        codec: Arc<TokenCodec>,
        revocation: Arc<RevocationIndex>,
    ) -> Self {
        Self {
            ledger,
            registry,
            codec,
            revocation,
            bus: None,
            denial_cooldown_s: DEFAULT_DENIAL_COOLDOWN_S,
            default_token_ttl_ms: DEFAULT_TOKEN_TTL_MS,
        }
    }

    /// Wire a [`NotificationBus`]: every event this coordinator appends is
    /// published to it immediately after the ledger confirms the append,
    /// so subscribed SSE streams see it with no additional polling delay.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<NotificationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Override the denial cooldown window, in seconds.
    #[must_use]
    pub fn with_denial_cooldown_s(mut self, cooldown_s: i64) -> Self {
        self.denial_cooldown_s = cooldown_s;
        self
    }

    /// Override the token TTL minted on grant, in milliseconds.
    #[must_use]
    pub fn with_default_token_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.default_token_ttl_ms = ttl_ms;
        self
    }

    /// Append `event`, publishing it to the Notification Bus (if wired)
    /// immediately afterward.
    fn append_and_publish(&self, event: NewConsentEvent) -> ConsentEvent {
        let user_id = event.user_id.clone();
        let appended = self.ledger.append(event);
        if let Some(bus) = &self.bus {
            bus.publish(&user_id, appended.clone());
        }
        appended
    }

    /// Step 1 of the two-step flow: a developer/agent asks for consent to a
    /// scope on behalf of a user.
    ///
    /// `expiry_hours` bounds the *pending window* (clamped to `[1, 24]`);
    /// the eventual token's TTL is a separate, longer-lived parameter (see
    /// [`with_default_token_ttl_ms`](Self::with_default_token_ttl_ms)).
    pub fn request_consent(
        &self,
        developer_token: &str,
        user_id: &str,
        scope_str: &str,
        expiry_hours: i64,
        now_ms: i64,
    ) -> Result<ConsentOutcome> {
        let developer = self
            .registry
            .lookup(developer_token)
            .ok_or_else(|| ConsentError::UnregisteredDeveloper(developer_token.to_string()))?;

        let scope_str = normalize(scope_str);
        if matches!(ScopeKind::parse(&scope_str), ScopeKind::Unclassified(_)) {
            return Err(ConsentError::InvalidScope(scope_str));
        }

        if !developer.is_approved_for(&scope_str) {
            return Err(ConsentError::DeveloperNotApproved {
                developer: developer.name,
                scope: scope_str,
            });
        }

        // Already-granted short circuit: an unexpired grant exists.
        if let Some(event) = self.ledger.active_token_event(user_id, &scope_str, now_ms) {
            let token = event
                .metadata
                .get("token")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    ConsentError::Internal("active grant event missing token metadata".to_string())
                })?;
            return Ok(ConsentOutcome::AlreadyGranted { token });
        }

        // Denial cooldown.
        if self.ledger.recently_denied(user_id, &scope_str, self.denial_cooldown_s, now_ms) {
            return Ok(ConsentOutcome::DeniedCooldown);
        }

        // Pending-exists dedup: at most one open REQUESTED per (user, scope).
        if let Some(existing) = self
            .ledger
            .pending(user_id, now_ms)
            .into_iter()
            .find(|p| p.scope_str == scope_str)
        {
            return Ok(ConsentOutcome::PendingExists {
                request_id: existing.request_id,
            });
        }

        // Fresh REQUESTED event.
        let clamped_hours = expiry_hours.clamp(MIN_EXPIRY_HOURS, MAX_EXPIRY_HOURS);
        let request_id = Uuid::new_v4().to_string()[..8].to_string();
        let scope_kind = ScopeKind::parse(&scope_str);

        self.append_and_publish(NewConsentEvent {
            event_key: request_id.clone(),
            user_id: user_id.to_string(),
            agent_id: developer.name.clone(),
            scope_str: scope_str.clone(),
            action: ConsentAction::Requested,
            request_id: Some(request_id.clone()),
            scope_description: describe(&scope_kind),
            issued_at: now_ms,
            expires_at: None,
            poll_timeout_at: Some(now_ms + clamped_hours * MS_PER_HOUR),
            metadata: json!({}),
        });

        audit::emit(&AuditEvent::requested(user_id, &developer.name, &scope_str, &request_id));
        Ok(ConsentOutcome::Pending { request_id })
    }

    /// Step 2, approval branch: the user grants a pending request. Mints a
    /// token and appends `CONSENT_GRANTED` (the token's wire string is
    /// carried in the event's metadata so `request_consent`'s
    /// already-granted path, and [`Self::wait_for_token`], can recover it).
    pub fn grant(&self, user_id: &str, request_id: &str, now_ms: i64) -> Result<String> {
        let requested = self
            .ledger
            .requested_event(user_id, request_id)
            .ok_or_else(|| ConsentError::Internal(format!("no pending request {request_id} for {user_id}")))?;

        let (_token, wire) = self.codec.issue(
            user_id,
            &requested.agent_id,
            &requested.scope_str,
            now_ms,
            self.default_token_ttl_ms,
        )?;

        self.append_and_publish(NewConsentEvent {
            event_key: wire.clone(),
            user_id: user_id.to_string(),
            agent_id: requested.agent_id.clone(),
            scope_str: requested.scope_str.clone(),
            action: ConsentAction::ConsentGranted,
            request_id: Some(request_id.to_string()),
            scope_description: requested.scope_description.clone(),
            issued_at: now_ms,
            expires_at: Some(now_ms + self.default_token_ttl_ms),
            poll_timeout_at: None,
            metadata: json!({ "token": wire.clone() }),
        });

        audit::emit(&AuditEvent::granted(user_id, &requested.agent_id, &requested.scope_str, request_id));
        Ok(wire)
    }

    /// Step 2, denial branch: the user denies a pending request.
    pub fn deny(&self, user_id: &str, request_id: &str, now_ms: i64) -> Result<()> {
        let requested = self
            .ledger
            .requested_event(user_id, request_id)
            .ok_or_else(|| ConsentError::Internal(format!("no pending request {request_id} for {user_id}")))?;

        self.append_and_publish(NewConsentEvent {
            event_key: format!("deny-{request_id}"),
            user_id: user_id.to_string(),
            agent_id: requested.agent_id.clone(),
            scope_str: requested.scope_str.clone(),
            action: ConsentAction::ConsentDenied,
            request_id: Some(request_id.to_string()),
            scope_description: requested.scope_description.clone(),
            issued_at: now_ms,
            expires_at: None,
            poll_timeout_at: None,
            metadata: json!({}),
        });

        audit::emit(&AuditEvent::denied(user_id, &requested.agent_id, &requested.scope_str, request_id));
        Ok(())
    }

    /// Bounded post-grant retrieval: after a caller observes
    /// `consent_resolved` on the Notification Bus, the newly active token
    /// may not be visible to the active projection yet (replication lag).
    /// Retries five times, 500ms apart, against the active projection
    /// before giving up.
    pub async fn wait_for_token(&self, user_id: &str, scope_str: &str) -> Result<String> {
        let scope_str = scope_str.to_string();
        let user_id = user_id.to_string();
        let ledger = Arc::clone(&self.ledger);

        let backoff = ConstantBuilder::default()
            .with_delay(Duration::from_millis(500))
            .with_max_times(5);

        (|| {
            let ledger = Arc::clone(&ledger);
            let user_id = user_id.clone();
            let scope_str = scope_str.clone();
            async move {
                let now_ms = now_ms();
                ledger
                    .active_token_event(&user_id, &scope_str, now_ms)
                    .and_then(|e| e.metadata.get("token").and_then(|v| v.as_str().map(str::to_string)))
                    .ok_or_else(|| ConsentError::LedgerUnavailable("active grant not yet visible".to_string()))
            }
        })
        .retry(backoff)
        .await
    }

    /// Self-issuance for an already-authenticated principal (identity
    /// verification is an external collaborator; by the time this is
    /// called, `user_id` is assumed verified). Mints a token directly and
    /// appends `CONSENT_GRANTED` with no preceding `REQUESTED` — there is no
    /// developer to approve and no human to wait on, so the two-step flow
    /// doesn't apply. Used by `POST /api/consent/issue-token`.
    pub fn self_issue(&self, user_id: &str, scope_str: &str, ttl_ms: i64, now_ms: i64) -> Result<String> {
        let scope_str = normalize(scope_str);
        let scope_kind = ScopeKind::parse(&scope_str);
        if matches!(scope_kind, ScopeKind::Unclassified(_)) {
            return Err(ConsentError::InvalidScope(scope_str));
        }

        let (_token, wire) = self.codec.issue(user_id, "self", &scope_str, now_ms, ttl_ms)?;

        self.append_and_publish(NewConsentEvent {
            event_key: wire.clone(),
            user_id: user_id.to_string(),
            agent_id: "self".to_string(),
            scope_str: scope_str.clone(),
            action: ConsentAction::ConsentGranted,
            request_id: None,
            scope_description: describe(&scope_kind),
            issued_at: now_ms,
            expires_at: Some(now_ms + ttl_ms),
            poll_timeout_at: None,
            metadata: json!({ "token": wire.clone(), "self_issued": true }),
        });

        audit::emit(&AuditEvent::granted(user_id, "self", &scope_str, ""));
        Ok(wire)
    }

    /// Validate a token with the durable (cross-instance) path, consulting
    /// both the revocation index and the ledger's active projection.
    pub fn validate_token(&self, token_str: &str, expected_scope: Option<&str>, now_ms: i64) -> Result<crate::token::ConsentToken> {
        let lookup = LedgerActiveLookup::new(self.ledger.as_ref(), now_ms);
        self.codec
            .validate_with_ledger(token_str, expected_scope, &self.revocation, &lookup, now_ms)
    }

    /// Mass-revoke every active token for a user (`POST /api/consent/logout`).
    /// Returns the number of scopes revoked.
    pub fn revoke_all_for_user(&self, user_id: &str, now_ms: i64) -> usize {
        let active = self.ledger.active(user_id, now_ms);
        for grant in &active {
            self.revocation.revoke(&grant.token_id, user_id, &grant.scope_str, "user requested logout");
            self.append_and_publish(NewConsentEvent {
                event_key: format!("rev-{}-{}", grant.token_id, now_ms),
                user_id: user_id.to_string(),
                agent_id: String::new(),
                scope_str: grant.scope_str.clone(),
                action: ConsentAction::Revoked,
                request_id: None,
                scope_description: grant.scope_description.clone(),
                issued_at: now_ms,
                expires_at: None,
                poll_timeout_at: None,
                metadata: json!({}),
            });
            audit::emit(&AuditEvent::revoked(user_id, &grant.scope_str, "user requested logout"));
        }
        active.len()
    }

    /// Currently active grants for a user (`GET /api/consent/active`).
    #[must_use]
    pub fn active(&self, user_id: &str, now_ms: i64) -> Vec<crate::ledger::ActiveToken> {
        self.ledger.active(user_id, now_ms)
    }

    /// Paginated ledger history for a user (`GET /api/consent/history`).
    #[must_use]
    pub fn history(&self, user_id: &str, page: usize, limit: usize) -> crate::ledger::Page<crate::ledger::ConsentEvent> {
        self.ledger.history(user_id, page, limit)
    }

    /// The underlying ledger, for collaborators (the SSE poll handler) that
    /// need to check resolution state directly rather than through a
    /// coordinator method.
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Record a vault-owner operation performed under an active grant —
    /// audit-only, distinct from grant/deny events.
    pub fn log_operation(&self, user_id: &str, agent_id: &str, target: &str, metadata: serde_json::Value, now_ms: i64) {
        self.ledger.log_operation(user_id, agent_id, target, metadata, now_ms);
        audit::emit(&AuditEvent::operation_performed(user_id, agent_id, target));
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;

    fn coordinator() -> Coordinator {
        let ledger: Arc<dyn Ledger> = Arc::new(InMemoryLedger::new());
        let registry: Arc<dyn DeveloperRegistry> = Arc::new(StaticDeveloperRegistry::new([(
            "dev-token".to_string(),
            DeveloperInfo {
                name: "mcp_dev".to_string(),
                approved_scopes: vec!["attr.food.*".to_string(), "attr.health.*".to_string()],
            },
        )]));
        let codec = Arc::new(TokenCodec::new(b"k".to_vec()));
        let revocation = Arc::new(RevocationIndex::new());
        Coordinator::new(ledger, registry, codec, revocation)
    }

    #[test]
    fn unregistered_developer_rejected() {
        let coordinator = coordinator();
        let result = coordinator.request_consent("bogus-token", "u1", "attr.food.*", 1, 1_000);
        assert!(matches!(result, Err(ConsentError::UnregisteredDeveloper(_))));
    }

    #[test]
    fn unapproved_scope_rejected() {
        let coordinator = coordinator();
        let result = coordinator.request_consent("dev-token", "u1", "attr.financial.*", 1, 1_000);
        assert!(matches!(result, Err(ConsentError::DeveloperNotApproved { .. })));
    }

    #[test]
    fn fresh_request_is_pending() {
        let coordinator = coordinator();
        let outcome = coordinator.request_consent("dev-token", "u1", "attr.food.*", 1, 1_000).unwrap();
        assert!(matches!(outcome, ConsentOutcome::Pending { .. }));
    }

    #[test]
    fn duplicate_request_returns_existing_pending_id() {
        let coordinator = coordinator();
        let first = coordinator.request_consent("dev-token", "u1", "attr.food.*", 1, 1_000).unwrap();
        let ConsentOutcome::Pending { request_id: first_id } = first else {
            panic!("expected Pending")
        };

        let second = coordinator.request_consent("dev-token", "u1", "attr.food.*", 1, 1_100).unwrap();
        assert_eq!(second, ConsentOutcome::PendingExists { request_id: first_id });
    }

    #[test]
    fn grant_then_already_granted_returns_same_token() {
        let coordinator = coordinator();
        let outcome = coordinator.request_consent("dev-token", "u1", "attr.food.*", 1, 1_000).unwrap();
        let ConsentOutcome::Pending { request_id } = outcome else {
            panic!("expected Pending")
        };

        let token = coordinator.grant("u1", &request_id, 2_000).unwrap();
        assert!(token.starts_with("HCT:"));

        let second = coordinator.request_consent("dev-token", "u1", "attr.food.*", 1, 3_000).unwrap();
        assert_eq!(second, ConsentOutcome::AlreadyGranted { token });
    }

    #[test]
    fn deny_then_request_reports_cooldown() {
        let coordinator = coordinator().with_denial_cooldown_s(60);
        let outcome = coordinator.request_consent("dev-token", "u1", "attr.health.*", 1, 1_000).unwrap();
        let ConsentOutcome::Pending { request_id } = outcome else {
            panic!("expected Pending")
        };

        coordinator.deny("u1", &request_id, 2_000).unwrap();

        let second = coordinator.request_consent("dev-token", "u1", "attr.health.*", 1, 3_000).unwrap();
        assert_eq!(second, ConsentOutcome::DeniedCooldown);
    }

    #[test]
    fn deny_after_cooldown_allows_fresh_request() {
        let coordinator = coordinator().with_denial_cooldown_s(1);
        let outcome = coordinator.request_consent("dev-token", "u1", "attr.health.*", 1, 1_000).unwrap();
        let ConsentOutcome::Pending { request_id } = outcome else {
            panic!("expected Pending")
        };
        coordinator.deny("u1", &request_id, 2_000).unwrap();

        let second = coordinator.request_consent("dev-token", "u1", "attr.health.*", 1, 10_000).unwrap();
        assert!(matches!(second, ConsentOutcome::Pending { .. }));
    }

    #[test]
    fn expiry_hours_are_clamped() {
        let coordinator = coordinator();
        // 100 hours should clamp to 24.
        let outcome = coordinator.request_consent("dev-token", "u1", "attr.food.*", 100, 1_000).unwrap();
        let ConsentOutcome::Pending { request_id } = outcome else {
            panic!("expected Pending")
        };
        let pending = coordinator.ledger.pending("u1", 1_000);
        let entry = pending.iter().find(|p| p.request_id == request_id).unwrap();
        assert_eq!(entry.poll_timeout_at, 1_000 + 24 * MS_PER_HOUR);
    }

    #[test]
    fn revoke_all_for_user_revokes_every_active_scope() {
        let coordinator = coordinator();
        let outcome1 = coordinator.request_consent("dev-token", "u1", "attr.food.*", 1, 1_000).unwrap();
        let ConsentOutcome::Pending { request_id: r1 } = outcome1 else { panic!() };
        let token1 = coordinator.grant("u1", &r1, 1_100).unwrap();

        let outcome2 = coordinator.request_consent("dev-token", "u1", "attr.health.*", 1, 1_000).unwrap();
        let ConsentOutcome::Pending { request_id: r2 } = outcome2 else { panic!() };
        coordinator.grant("u1", &r2, 1_100).unwrap();

        let count = coordinator.revoke_all_for_user("u1", 1_200);
        assert_eq!(count, 2);
        assert!(!coordinator.ledger.is_active("u1", "attr.food.*", 1_300));
        assert!(!coordinator.ledger.is_active("u1", "attr.health.*", 1_300));
        // Hard revocation: the token is rejected immediately, not only once
        // something consults the ledger's active projection.
        assert!(coordinator.revocation.is_revoked(&token1));
    }

    #[test]
    fn self_issue_mints_token_with_no_pending_phase() {
        let coordinator = coordinator();
        let wire = coordinator.self_issue("u1", "vault.owner", 86_400_000, 1_000).unwrap();
        assert!(wire.starts_with("HCT:"));
        assert!(coordinator.ledger.is_active("u1", "vault.owner", 1_000));
        // No REQUESTED event was ever appended for this grant.
        assert!(coordinator.ledger.pending("u1", 1_000).is_empty());
    }

    #[test]
    fn self_issue_rejects_unclassified_scope() {
        let coordinator = coordinator();
        let result = coordinator.self_issue("u1", "not a real scope!!", 1_000, 1_000);
        assert!(matches!(result, Err(ConsentError::InvalidScope(_))));
    }

    #[tokio::test]
    async fn wait_for_token_returns_once_grant_is_visible() {
        let coordinator = coordinator();
        let outcome = coordinator.request_consent("dev-token", "u1", "attr.food.*", 1, 1_000).unwrap();
        let ConsentOutcome::Pending { request_id } = outcome else { panic!() };
        coordinator.grant("u1", &request_id, 1_100).unwrap();

        let token = coordinator.wait_for_token("u1", "attr.food.*").await.unwrap();
        assert!(token.starts_with("HCT:"));
    }
}
