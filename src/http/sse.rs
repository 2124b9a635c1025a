//! Server-push endpoints. Both handlers are thin: all the streaming logic
//! lives in [`crate::notify::NotificationBus`]; these just pull the
//! path/query parameters apart and hand them to it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use futures::Stream;
use serde::Deserialize;

use super::routes::AppState;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// `GET /api/consent/events/{user_id}` — every event for this user, pushed
/// as it's appended. Never resolves on its own; the connection stays open
/// until the client disconnects.
pub async fn events_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    state.bus.subscribe(&user_id)
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    /// Overrides the configured consent timeout, in seconds.
    pub timeout: Option<i64>,
}

/// `GET /api/consent/events/{user_id}/poll/{request_id}` — a stream scoped
/// to one pending request, terminating on its first resolution or on
/// timeout.
pub async fn poll_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, request_id)): Path<(String, String)>,
    Query(query): Query<PollQuery>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let timeout_s = query.timeout.or(Some(state.consent_timeout_s));
    state.bus.subscribe_specific(state.coordinator.ledger().as_ref(), &user_id, &request_id, timeout_s, now_ms())
}
