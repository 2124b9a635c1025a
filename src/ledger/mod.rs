//! Consent Ledger — the append-only event store every other projection in
//! the core is computed from.
//!
//! Grounded directly on the source system's `ConsentDBService`: events are
//! never mutated or deleted, and every "current state" view (pending,
//! active, history) is a *projection*: the latest event per group, computed
//! by a portable post-processing fallback rather than a database-specific
//! `DISTINCT ON`. [`InMemoryLedger`] implements that fallback in plain Rust
//! so the same projection logic works whether or not the eventual storage
//! backend can express it natively.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::token::ActiveScopeLookup;

/// One row of the append-only ledger. Never mutated after [`Ledger::append`]
/// returns its id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentEvent {
    /// Monotonically increasing id, assigned by the ledger on append.
    pub id: u64,
    /// Either the token signature (for `CONSENT_GRANTED`), a generated
    /// request id (for `REQUESTED`), or a synthetic identifier.
    pub event_key: String,
    /// Principal the event concerns.
    pub user_id: String,
    /// Caller/agent identifier.
    pub agent_id: String,
    /// Scope string, preserved exactly as granted/requested — never coerced.
    pub scope_str: String,
    /// What kind of event this is.
    pub action: ConsentAction,
    /// Correlates a `REQUESTED` event with its resolving `CONSENT_GRANTED`/
    /// `CONSENT_DENIED`/timeout. `None` for events with no request lineage
    /// (e.g. a direct self-issuance or an `OPERATION_PERFORMED` record).
    pub request_id: Option<String>,
    /// Human-readable label, as produced by [`crate::scope::describe`].
    pub scope_description: String,
    /// Milliseconds since epoch when this event was recorded.
    pub issued_at: i64,
    /// Token expiry, for `CONSENT_GRANTED` events. `None` otherwise.
    pub expires_at: Option<i64>,
    /// Deadline for a `REQUESTED` event to be resolved. `None` once resolved
    /// or for events that never had one.
    pub poll_timeout_at: Option<i64>,
    /// Opaque structured attributes (e.g. an `OPERATION_PERFORMED` target).
    pub metadata: Value,
}

/// The kind of ledger event, per the append-only event taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentAction {
    /// A developer/agent asked for consent; awaiting a human decision.
    Requested,
    /// The user approved; a token has been minted.
    ConsentGranted,
    /// The user denied the request.
    ConsentDenied,
    /// A previously granted token was revoked.
    Revoked,
    /// A vault-owner operation was performed under an active grant — audit
    /// trail only, never itself part of a grant/deny projection.
    OperationPerformed,
}

/// A `REQUESTED` event still awaiting resolution, as surfaced to an external
/// developer/agent polling for their request's outcome.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    /// The request id to poll/correlate on.
    pub request_id: String,
    /// Agent/developer that asked for consent.
    pub agent_id: String,
    /// Scope requested.
    pub scope_str: String,
    /// Human-readable scope description.
    pub scope_description: String,
    /// When the request was made.
    pub requested_at: i64,
    /// When the pending window closes.
    pub poll_timeout_at: i64,
}

/// A currently valid grant, as surfaced by `GET /api/consent/active`.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveToken {
    /// Scope the grant covers.
    pub scope_str: String,
    /// Human-readable scope description.
    pub scope_description: String,
    /// Token identifier (its signature / event key).
    pub token_id: String,
    /// When the grant was issued.
    pub issued_at: i64,
    /// When the grant expires.
    pub expires_at: i64,
}

/// A page of ledger history, with a best-effort total.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    /// The page's items.
    pub items: Vec<T>,
    /// 1-indexed page number this page corresponds to.
    pub page: usize,
    /// Page size requested.
    pub limit: usize,
    /// Total matching rows, exact for this in-memory implementation.
    pub total: usize,
}

/// Append-only event store with "latest per group" projection queries.
///
/// A `sqlx`-backed implementation is not provided here — database driver
/// choice is an external collaborator per the core's scope — but this
/// trait's method shapes mirror the logical persisted schema exactly, so
/// such an implementation is a drop-in later.
pub trait Ledger: Send + Sync {
    /// Unconditionally append `event`, returning its assigned id. Never
    /// mutates or removes any prior event.
    fn append(&self, event: NewConsentEvent) -> ConsentEvent;

    /// Requests with action `REQUESTED` whose `poll_timeout_at` is still in
    /// the future, one per `request_id` (latest event wins).
    fn pending(&self, user_id: &str, now_ms: i64) -> Vec<PendingRequest>;

    /// Grants whose latest event per `(user_id, scope_str)` is
    /// `CONSENT_GRANTED` and unexpired.
    fn active(&self, user_id: &str, now_ms: i64) -> Vec<ActiveToken>;

    /// Existence-only form of [`active`](Self::active) for one scope.
    fn is_active(&self, user_id: &str, scope_str: &str, now_ms: i64) -> bool;

    /// Paginated, reverse-chronological event history for a user.
    fn history(&self, user_id: &str, page: usize, limit: usize) -> Page<ConsentEvent>;

    /// The latest `CONSENT_GRANTED`/`CONSENT_DENIED` event for a given
    /// request, if the request has been resolved.
    fn resolved(&self, user_id: &str, request_id: &str) -> Option<ConsentEvent>;

    /// Events for `user_id` with `issued_at > after_ms`, most relevant to
    /// the Notification Bus's polling loop. Capped at `limit`.
    fn recent_events_after(&self, user_id: &str, after_ms: i64, limit: usize) -> Vec<ConsentEvent>;

    /// Whether the latest event for `(user_id, scope_str)` is a
    /// `CONSENT_DENIED` recorded within the last `cooldown_s` seconds —
    /// used to suppress re-request spam.
    fn recently_denied(&self, user_id: &str, scope_str: &str, cooldown_s: i64, now_ms: i64) -> bool;

    /// The full active `CONSENT_GRANTED` event for `(user_id, scope_str)`,
    /// including its metadata (which carries the wire-format token string) —
    /// what [`active`](Self::active)'s summary view can't expose. Used by
    /// the Approval Coordinator to hand back the actual token on an
    /// `already_granted` outcome.
    fn active_token_event(&self, user_id: &str, scope_str: &str, now_ms: i64) -> Option<ConsentEvent>;

    /// The latest `REQUESTED` event for `(user_id, request_id)`, regardless
    /// of whether its poll window has elapsed. Used by the Approval
    /// Coordinator to recover the original scope/agent when a human
    /// resolves a request by id.
    fn requested_event(&self, user_id: &str, request_id: &str) -> Option<ConsentEvent>;

    /// Append an `OPERATION_PERFORMED` audit record for a vault-owner
    /// operation performed under an active grant. Distinct from grant/deny
    /// events; never considered by [`active`](Self::active) or
    /// [`pending`](Self::pending).
    fn log_operation(&self, user_id: &str, agent_id: &str, target: &str, metadata: Value, now_ms: i64) -> ConsentEvent {
        self.append(NewConsentEvent {
            event_key: format!("op-{user_id}-{now_ms}"),
            user_id: user_id.to_string(),
            agent_id: agent_id.to_string(),
            scope_str: target.to_string(),
            action: ConsentAction::OperationPerformed,
            request_id: None,
            scope_description: target.to_string(),
            issued_at: now_ms,
            expires_at: None,
            poll_timeout_at: None,
            metadata,
        })
    }
}

/// The fields the caller supplies when appending an event; `id` is assigned
/// by the ledger.
#[derive(Debug, Clone)]
pub struct NewConsentEvent {
    /// See [`ConsentEvent::event_key`].
    pub event_key: String,
    /// See [`ConsentEvent::user_id`].
    pub user_id: String,
    /// See [`ConsentEvent::agent_id`].
    pub agent_id: String,
    /// See [`ConsentEvent::scope_str`].
    pub scope_str: String,
    /// See [`ConsentEvent::action`].
    pub action: ConsentAction,
    /// See [`ConsentEvent::request_id`].
    pub request_id: Option<String>,
    /// See [`ConsentEvent::scope_description`].
    pub scope_description: String,
    /// See [`ConsentEvent::issued_at`].
    pub issued_at: i64,
    /// See [`ConsentEvent::expires_at`].
    pub expires_at: Option<i64>,
    /// See [`ConsentEvent::poll_timeout_at`].
    pub poll_timeout_at: Option<i64>,
    /// See [`ConsentEvent::metadata`].
    pub metadata: Value,
}

/// In-memory, single-process [`Ledger`]. Every projection is recomputed from
/// the full event vector on each query — correct by construction (it can
/// never disagree with the chronological event history) and fast enough for
/// the event volumes a human-approval-gated system produces.
pub struct InMemoryLedger {
    events: RwLock<Vec<ConsentEvent>>,
    next_id: RwLock<u64>,
}

impl InMemoryLedger {
    /// An empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            next_id: RwLock::new(1),
        }
    }

    /// Latest event per group, where `key` extracts the grouping key and
    /// events are ordered by `(issued_at, id)` — the strict order pending/
    /// active projections must respect.
    fn latest_per_group<'a, K, F>(events: &'a [ConsentEvent], key: F) -> Vec<&'a ConsentEvent>
    where
        K: Eq + std::hash::Hash,
        F: Fn(&ConsentEvent) -> Option<K>,
    {
        let mut latest: HashMap<K, &ConsentEvent> = HashMap::new();
        for event in events {
            let Some(k) = key(event) else { continue };
            match latest.get(&k) {
                Some(existing) if (existing.issued_at, existing.id) >= (event.issued_at, event.id) => {}
                _ => {
                    latest.insert(k, event);
                }
            }
        }
        latest.into_values().collect()
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger for InMemoryLedger {
    fn append(&self, new_event: NewConsentEvent) -> ConsentEvent {
        let mut next_id = self.next_id.write();
        let id = *next_id;
        *next_id += 1;
        drop(next_id);

        let event = ConsentEvent {
            id,
            event_key: new_event.event_key,
            user_id: new_event.user_id,
            agent_id: new_event.agent_id,
            scope_str: new_event.scope_str,
            action: new_event.action,
            request_id: new_event.request_id,
            scope_description: new_event.scope_description,
            issued_at: new_event.issued_at,
            expires_at: new_event.expires_at,
            poll_timeout_at: new_event.poll_timeout_at,
            metadata: new_event.metadata,
        };

        self.events.write().push(event.clone());
        event
    }

    fn pending(&self, user_id: &str, now_ms: i64) -> Vec<PendingRequest> {
        let events = self.events.read();
        let owned: Vec<ConsentEvent> = events.iter().filter(|e| e.user_id == user_id).cloned().collect();
        drop(events);

        Self::latest_per_group(&owned, |e| e.request_id.clone())
            .into_iter()
            .filter(|e| e.action == ConsentAction::Requested)
            .filter(|e| e.poll_timeout_at.is_some_and(|t| t > now_ms))
            .map(|e| PendingRequest {
                request_id: e.request_id.clone().unwrap_or_default(),
                agent_id: e.agent_id.clone(),
                scope_str: e.scope_str.clone(),
                scope_description: e.scope_description.clone(),
                requested_at: e.issued_at,
                poll_timeout_at: e.poll_timeout_at.unwrap_or(e.issued_at),
            })
            .collect()
    }

    fn active(&self, user_id: &str, now_ms: i64) -> Vec<ActiveToken> {
        let events = self.events.read();
        let owned: Vec<ConsentEvent> = events
            .iter()
            .filter(|e| e.user_id == user_id)
            .filter(|e| matches!(e.action, ConsentAction::ConsentGranted | ConsentAction::Revoked))
            .cloned()
            .collect();

        Self::latest_per_group(&owned, |e| Some(e.scope_str.clone()))
            .into_iter()
            .filter(|e| e.action == ConsentAction::ConsentGranted)
            .filter(|e| e.expires_at.is_some_and(|exp| exp > now_ms))
            .map(|e| ActiveToken {
                scope_str: e.scope_str.clone(),
                scope_description: e.scope_description.clone(),
                token_id: e.event_key.clone(),
                issued_at: e.issued_at,
                expires_at: e.expires_at.unwrap_or(e.issued_at),
            })
            .collect()
    }

    fn is_active(&self, user_id: &str, scope_str: &str, now_ms: i64) -> bool {
        self.active(user_id, now_ms).iter().any(|a| a.scope_str == scope_str)
    }

    fn history(&self, user_id: &str, page: usize, limit: usize) -> Page<ConsentEvent> {
        let events = self.events.read();
        let mut for_user: Vec<ConsentEvent> =
            events.iter().filter(|e| e.user_id == user_id).cloned().collect();
        for_user.sort_by(|a, b| (b.issued_at, b.id).cmp(&(a.issued_at, a.id)));

        let total = for_user.len();
        let page = page.max(1);
        let start = (page - 1) * limit;
        let items = for_user.into_iter().skip(start).take(limit).collect();

        Page { items, page, limit, total }
    }

    fn resolved(&self, user_id: &str, request_id: &str) -> Option<ConsentEvent> {
        let events = self.events.read();
        events
            .iter()
            .filter(|e| e.user_id == user_id)
            .filter(|e| e.request_id.as_deref() == Some(request_id))
            .filter(|e| matches!(e.action, ConsentAction::ConsentGranted | ConsentAction::ConsentDenied))
            .max_by_key(|e| (e.issued_at, e.id))
            .cloned()
    }

    fn recent_events_after(&self, user_id: &str, after_ms: i64, limit: usize) -> Vec<ConsentEvent> {
        let events = self.events.read();
        let mut matching: Vec<ConsentEvent> = events
            .iter()
            .filter(|e| e.user_id == user_id)
            .filter(|e| e.issued_at > after_ms)
            .filter(|e| {
                matches!(
                    e.action,
                    ConsentAction::Requested
                        | ConsentAction::ConsentGranted
                        | ConsentAction::ConsentDenied
                        | ConsentAction::Revoked
                )
            })
            .cloned()
            .collect();
        matching.sort_by_key(|e| (e.issued_at, e.id));
        matching.truncate(limit);
        matching
    }

    fn recently_denied(&self, user_id: &str, scope_str: &str, cooldown_s: i64, now_ms: i64) -> bool {
        let events = self.events.read();
        let owned: Vec<ConsentEvent> = events
            .iter()
            .filter(|e| e.user_id == user_id && e.scope_str == scope_str)
            .filter(|e| matches!(e.action, ConsentAction::ConsentDenied | ConsentAction::ConsentGranted))
            .cloned()
            .collect();

        let Some(latest) = owned.iter().max_by_key(|e| (e.issued_at, e.id)) else {
            return false;
        };

        latest.action == ConsentAction::ConsentDenied && now_ms - latest.issued_at < cooldown_s * 1_000
    }

    fn active_token_event(&self, user_id: &str, scope_str: &str, now_ms: i64) -> Option<ConsentEvent> {
        let events = self.events.read();
        let owned: Vec<ConsentEvent> = events
            .iter()
            .filter(|e| e.user_id == user_id && e.scope_str == scope_str)
            .filter(|e| matches!(e.action, ConsentAction::ConsentGranted | ConsentAction::Revoked))
            .cloned()
            .collect();
        drop(events);

        let latest = owned.into_iter().max_by_key(|e| (e.issued_at, e.id))?;
        if latest.action == ConsentAction::ConsentGranted && latest.expires_at.is_some_and(|exp| exp > now_ms) {
            Some(latest)
        } else {
            None
        }
    }

    fn requested_event(&self, user_id: &str, request_id: &str) -> Option<ConsentEvent> {
        let events = self.events.read();
        events
            .iter()
            .filter(|e| e.user_id == user_id)
            .filter(|e| e.request_id.as_deref() == Some(request_id))
            .filter(|e| e.action == ConsentAction::Requested)
            .max_by_key(|e| (e.issued_at, e.id))
            .cloned()
    }
}

/// Adapts any [`Ledger`] to the narrow [`ActiveScopeLookup`] the Token Codec
/// needs, without the codec depending on the full ledger trait.
pub struct LedgerActiveLookup<'a, L: Ledger + ?Sized> {
    ledger: &'a L,
    now_ms: i64,
}

impl<'a, L: Ledger + ?Sized> LedgerActiveLookup<'a, L> {
    /// Wrap `ledger`, evaluating activeness as of `now_ms`.
    #[must_use]
    pub fn new(ledger: &'a L, now_ms: i64) -> Self {
        Self { ledger, now_ms }
    }
}

impl<L: Ledger + ?Sized> ActiveScopeLookup for LedgerActiveLookup<'_, L> {
    fn is_active(&self, user_id: &str, scope_str: &str) -> bool {
        self.ledger.is_active(user_id, scope_str, self.now_ms)
    }
}
