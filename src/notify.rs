//! Notification Bus — push delivery of consent resolutions over
//! server-sent events, so a waiting developer/agent doesn't have to poll.
//!
//! Mirrors the source system's `NotificationMultiplexer`: one
//! `tokio::sync::broadcast` channel per user, fanned out to however many
//! subscribers are currently watching that user's stream, plus a periodic
//! heartbeat so intermediaries don't time the connection out.

use std::collections::HashMap;
use std::time::Duration;

use async_stream::stream;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::ledger::{ConsentAction, ConsentEvent, Ledger};

const CHANNEL_CAPACITY: usize = 256;
const HEARTBEAT_INTERVAL_S: u64 = 30;
const POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_TIMEOUT_S: i64 = 120;

/// The envelope shape pushed to subscribers, independent of transport.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// A pending request changed state but hasn't fully resolved yet
    /// (currently only emitted for parity with the wire shape; the core
    /// only has two terminal states, granted/denied).
    ConsentUpdate {
        /// Ledger event id this notification corresponds to, for dedup.
        id: u64,
        /// The underlying event.
        data: ConsentEvent,
    },
    /// A request reached a terminal decision.
    ConsentResolved {
        /// Ledger event id this notification corresponds to, for dedup.
        id: u64,
        /// The resolving event.
        data: ConsentEvent,
    },
    /// A specific subscription's wait exceeded `CONSENT_TIMEOUT_SECONDS`
    /// with no decision.
    ConsentTimeout {
        /// The request id that timed out.
        request_id: String,
    },
}

/// Broadcasts every appended ledger event to whichever per-user channels
/// currently have subscribers. One channel per `user_id`, created lazily and
/// dropped once its last subscriber disconnects (broadcast channels close
/// themselves when all receivers are gone; the sender map entry is reaped on
/// the next publish to an empty channel).
pub struct NotificationBus {
    channels: Mutex<HashMap<String, broadcast::Sender<ConsentEvent>>>,
}

impl NotificationBus {
    /// An empty bus with no active channels.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender_for(&self, user_id: &str) -> broadcast::Sender<ConsentEvent> {
        let mut channels = self.channels.lock();
        channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish an event to `user_id`'s channel. A no-op (besides a debug
    /// log) if nobody is currently subscribed.
    pub fn publish(&self, user_id: &str, event: ConsentEvent) {
        let sender = self.sender_for(user_id);
        if sender.send(event).is_err() {
            debug!(user_id, "no active subscribers; notification dropped");
        }
    }

    /// Drop the channel for `user_id` if it currently has no subscribers.
    /// Call periodically to bound memory growth across long-lived
    /// processes with many distinct users.
    pub fn reap_idle(&self) {
        self.channels.lock().retain(|_, sender| sender.receiver_count() > 0);
    }

    /// Every event for `user_id`, as a [`Notification`] stream that never
    /// terminates on its own. The transport-level wrapping lives in
    /// [`subscribe`](Self::subscribe); this is the testable core.
    fn notifications_all(&self, user_id: &str) -> impl Stream<Item = Notification> {
        let mut receiver = self.sender_for(user_id).subscribe();

        stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => yield Notification::ConsentUpdate { id: event.id, data: event },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification subscriber lagged; some events were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Every event for `user_id`, as an SSE stream that never terminates on
    /// its own — callers close the connection by dropping it. Suitable for
    /// `GET /api/consent/events/{user_id}`.
    pub fn subscribe(&self, user_id: &str) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
        let events = {
            use futures::StreamExt as _;
            self.notifications_all(user_id).map(|n| to_sse_event(&n))
        };

        Sse::new(events).keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(HEARTBEAT_INTERVAL_S))
                .text("heartbeat"),
        )
    }

    /// [`Notification`] stream scoped to one pending `request_id`,
    /// terminating on the first resolving (`CONSENT_GRANTED`/
    /// `CONSENT_DENIED`) event for it, or after `timeout_s` seconds with a
    /// `consent_timeout` notification. Emits at most one notification per
    /// call — the testable core behind
    /// [`subscribe_specific`](Self::subscribe_specific).
    fn notifications_specific(
        &self,
        ledger: &(dyn Ledger),
        user_id: &str,
        request_id: &str,
        timeout_s: Option<i64>,
        now_ms: i64,
    ) -> impl Stream<Item = Notification> {
        let mut receiver = self.sender_for(user_id).subscribe();
        let request_id = request_id.to_string();
        let deadline = now_ms + timeout_s.unwrap_or(DEFAULT_TIMEOUT_S) * 1_000;

        // If the request already resolved before the subscriber attached,
        // surface that immediately instead of waiting for a new event.
        let already_resolved = ledger.resolved(user_id, &request_id);

        stream! {
            if let Some(event) = already_resolved {
                yield Notification::ConsentResolved { id: event.id, data: event };
                return;
            }

            loop {
                let remaining = deadline - now_ms_wall();
                if remaining <= 0 {
                    yield Notification::ConsentTimeout { request_id: request_id.clone() };
                    return;
                }

                let wait = tokio::time::timeout(
                    Duration::from_millis(POLL_INTERVAL_MS.min(remaining.max(0) as u64)),
                    receiver.recv(),
                )
                .await;

                match wait {
                    Ok(Ok(event)) => {
                        if event.request_id.as_deref() != Some(request_id.as_str()) {
                            continue;
                        }
                        if matches!(event.action, ConsentAction::ConsentGranted | ConsentAction::ConsentDenied) {
                            yield Notification::ConsentResolved { id: event.id, data: event };
                            return;
                        }
                    }
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        warn!(skipped, request_id = %request_id, "poll subscriber lagged");
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => return,
                    Err(_elapsed) => {
                        // No event this tick; loop back and re-check the deadline.
                    }
                }
            }
        }
    }

    /// A stream scoped to one pending `request_id`, terminating on the
    /// first resolving (`CONSENT_GRANTED`/`CONSENT_DENIED`) event for it, or
    /// after `timeout_s` seconds with a `consent_timeout` notification.
    /// Suitable for `GET /api/consent/events/{user_id}/poll/{request_id}`.
    pub fn subscribe_specific(
        &self,
        ledger: &(dyn Ledger),
        user_id: &str,
        request_id: &str,
        timeout_s: Option<i64>,
        now_ms: i64,
    ) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
        let events = {
            use futures::StreamExt as _;
            self.notifications_specific(ledger, user_id, request_id, timeout_s, now_ms)
                .map(|n| to_sse_event(&n))
        };

        Sse::new(events).keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(HEARTBEAT_INTERVAL_S))
                .text("heartbeat"),
        )
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms_wall() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn to_sse_event(notification: &Notification) -> Result<Event, std::convert::Infallible> {
    Ok(Event::default().json_data(notification).unwrap_or_else(|e| {
        warn!(error = %e, "failed to serialize notification; sending empty event");
        Event::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ConsentAction, InMemoryLedger, NewConsentEvent};
    use serde_json::Value;

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = NotificationBus::new();
        let ledger = InMemoryLedger::new();
        let event = ledger.append(NewConsentEvent {
            event_key: "r1".to_string(),
            user_id: "u1".to_string(),
            agent_id: "mcp_dev".to_string(),
            scope_str: "attr.food.*".to_string(),
            action: ConsentAction::Requested,
            request_id: Some("r1".to_string()),
            scope_description: "attr.food.*".to_string(),
            issued_at: 1_000,
            expires_at: None,
            poll_timeout_at: Some(2_000),
            metadata: Value::Null,
        });
        bus.publish("u1", event);
    }

    #[test]
    fn reap_idle_drops_channels_with_no_subscribers() {
        let bus = NotificationBus::new();
        let _ = bus.sender_for("u1");
        assert_eq!(bus.channels.lock().len(), 1);
        bus.reap_idle();
        assert!(bus.channels.lock().is_empty());
    }

    #[tokio::test]
    async fn subscribed_receiver_sees_published_event() {
        let bus = NotificationBus::new();
        let mut receiver = bus.sender_for("u1").subscribe();

        let ledger = InMemoryLedger::new();
        let event = ledger.append(NewConsentEvent {
            event_key: "r1".to_string(),
            user_id: "u1".to_string(),
            agent_id: "mcp_dev".to_string(),
            scope_str: "attr.food.*".to_string(),
            action: ConsentAction::ConsentGranted,
            request_id: Some("r1".to_string()),
            scope_description: "attr.food.*".to_string(),
            issued_at: 1_000,
            expires_at: Some(100_000),
            poll_timeout_at: None,
            metadata: Value::Null,
        });

        bus.publish("u1", event.clone());
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.id, event.id);
    }

    fn requested_event(ledger: &InMemoryLedger, user_id: &str, request_id: &str) -> ConsentEvent {
        ledger.append(NewConsentEvent {
            event_key: request_id.to_string(),
            user_id: user_id.to_string(),
            agent_id: "mcp_dev".to_string(),
            scope_str: "attr.food.*".to_string(),
            action: ConsentAction::Requested,
            request_id: Some(request_id.to_string()),
            scope_description: "attr.food.*".to_string(),
            issued_at: now_ms_wall(),
            expires_at: None,
            poll_timeout_at: Some(now_ms_wall() + 60_000),
            metadata: Value::Null,
        })
    }

    // ── at-most-one notification per specific-request subscription
    // (invariant 8) ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn specific_subscription_surfaces_already_resolved_request_once() {
        use futures::StreamExt as _;

        let bus = NotificationBus::new();
        let ledger = InMemoryLedger::new();
        requested_event(&ledger, "u1", "r1");
        let granted = ledger.append(NewConsentEvent {
            event_key: "tok-r1".to_string(),
            user_id: "u1".to_string(),
            agent_id: "mcp_dev".to_string(),
            scope_str: "attr.food.*".to_string(),
            action: ConsentAction::ConsentGranted,
            request_id: Some("r1".to_string()),
            scope_description: "attr.food.*".to_string(),
            issued_at: now_ms_wall(),
            expires_at: Some(now_ms_wall() + 100_000),
            poll_timeout_at: None,
            metadata: Value::Null,
        });

        let mut stream = Box::pin(bus.notifications_specific(&ledger, "u1", "r1", Some(120), now_ms_wall()));

        let first = stream.next().await.expect("expected one notification");
        match first {
            Notification::ConsentResolved { id, .. } => assert_eq!(id, granted.id),
            other => panic!("expected ConsentResolved, got {other:?}"),
        }
        // Already-resolved requests surface exactly once, then the stream closes.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn specific_subscription_resolves_on_live_grant_then_terminates() {
        use futures::StreamExt as _;

        let bus = NotificationBus::new();
        let ledger = InMemoryLedger::new();
        requested_event(&ledger, "u2", "r2");

        let mut stream = Box::pin(bus.notifications_specific(&ledger, "u2", "r2", Some(120), now_ms_wall()));

        let granted = ledger.append(NewConsentEvent {
            event_key: "tok-r2".to_string(),
            user_id: "u2".to_string(),
            agent_id: "mcp_dev".to_string(),
            scope_str: "attr.food.*".to_string(),
            action: ConsentAction::ConsentGranted,
            request_id: Some("r2".to_string()),
            scope_description: "attr.food.*".to_string(),
            issued_at: now_ms_wall(),
            expires_at: Some(now_ms_wall() + 100_000),
            poll_timeout_at: None,
            metadata: Value::Null,
        });
        bus.publish("u2", granted.clone());

        let resolved = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("stream should resolve before the test timeout")
            .expect("expected one notification");
        match resolved {
            Notification::ConsentResolved { id, .. } => assert_eq!(id, granted.id),
            other => panic!("expected ConsentResolved, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn specific_subscription_ignores_events_for_other_requests() {
        use futures::StreamExt as _;

        let bus = NotificationBus::new();
        let ledger = InMemoryLedger::new();
        requested_event(&ledger, "u3", "r3");

        let mut stream = Box::pin(bus.notifications_specific(&ledger, "u3", "r3", Some(1), now_ms_wall()));

        // An unrelated request's grant must not resolve this subscription.
        let unrelated = ledger.append(NewConsentEvent {
            event_key: "tok-other".to_string(),
            user_id: "u3".to_string(),
            agent_id: "mcp_dev".to_string(),
            scope_str: "attr.health.*".to_string(),
            action: ConsentAction::ConsentGranted,
            request_id: Some("other".to_string()),
            scope_description: "attr.health.*".to_string(),
            issued_at: now_ms_wall(),
            expires_at: Some(now_ms_wall() + 100_000),
            poll_timeout_at: None,
            metadata: Value::Null,
        });
        bus.publish("u3", unrelated);

        // With no matching event, this subscription eventually times out
        // rather than resolving on the unrelated grant.
        let timed_out = tokio::time::timeout(Duration::from_secs(3), stream.next())
            .await
            .expect("stream should time out before the test timeout")
            .expect("expected a timeout notification");
        assert!(matches!(timed_out, Notification::ConsentTimeout { request_id } if request_id == "r3"));
    }

    #[tokio::test]
    async fn specific_subscription_times_out_when_deadline_already_elapsed() {
        use futures::StreamExt as _;

        let bus = NotificationBus::new();
        let ledger = InMemoryLedger::new();
        requested_event(&ledger, "u4", "r4");

        // timeout_s = 0 means the deadline has already elapsed by the time
        // the stream is first polled.
        let mut stream = Box::pin(bus.notifications_specific(&ledger, "u4", "r4", Some(0), now_ms_wall()));

        let notification = stream.next().await.expect("expected a timeout notification");
        assert!(matches!(notification, Notification::ConsentTimeout { request_id } if request_id == "r4"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn all_events_stream_forwards_each_published_event_exactly_once() {
        use futures::StreamExt as _;

        let bus = NotificationBus::new();
        let mut stream = Box::pin(bus.notifications_all("u5"));

        let ledger = InMemoryLedger::new();
        let event = requested_event(&ledger, "u5", "r5");
        bus.publish("u5", event.clone());

        let first = stream.next().await.expect("expected one notification");
        match first {
            Notification::ConsentUpdate { id, .. } => assert_eq!(id, event.id),
            other => panic!("expected ConsentUpdate, got {other:?}"),
        }
    }
}
