//! Request/response handlers for the consent core's stable HTTP surface.
//! Router assembly follows the same shape as a typical `axum` gateway:
//! one `AppState`, one `build_router`-style function, `tower-http` tracing
//! and a rate-limit middleware layered in front of everything.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::error_handling::HandleErrorLayer;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{BoxError, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::{load_shed::LoadShedLayer, timeout::TimeoutLayer, ServiceBuilder};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::coordinator::{Coordinator, ConsentOutcome};
use crate::error::ConsentError;
use crate::notify::NotificationBus;
use crate::rate_limit::{rate_limit_key, RouteClass, RouteLimiter};

/// Shared application state handed to every handler.
pub struct AppState {
    /// Orchestrates the two-step approval flow and token validation.
    pub coordinator: Arc<Coordinator>,
    /// Server-push delivery of consent resolutions.
    pub bus: Arc<NotificationBus>,
    /// Per-route-class, per-key request throttling.
    pub limiter: Arc<RouteLimiter>,
    /// Default token TTL applied by `POST /api/consent/issue-token`.
    pub issue_token_ttl_ms: i64,
    /// Configured `CONSENT_TIMEOUT_SECONDS`, passed to the Notification Bus
    /// for specific-request subscriptions that don't override it.
    pub consent_timeout_s: i64,
    /// `FRONTEND_URL`, surfaced in error responses that point back to a
    /// human-facing approval surface.
    pub frontend_url: Option<String>,
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Assemble the router: the stable consent-core paths, the SSE routes from
/// [`super::sse`], a rate-limit layer keyed per the route-class table,
/// and the ambient resilience/observability stack (load shedding, a
/// per-request timeout, permissive CORS for the frontend origin, and
/// `tower-http`'s trace layer).
pub fn build_router(state: Arc<AppState>) -> Router {
    let resilience = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(handle_resilience_error))
        .layer(LoadShedLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(10)));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/request-consent", post(request_consent_handler))
        .route("/api/consent/issue-token", post(issue_token_handler))
        .route("/api/consent/active", get(active_handler))
        .route("/api/consent/history", get(history_handler))
        .route("/api/consent/logout", post(logout_handler))
        .route("/api/consent/events/{user_id}", get(super::sse::events_handler))
        .route(
            "/api/consent/events/{user_id}/poll/{request_id}",
            get(super::sse::poll_handler),
        )
        .layer(middleware::from_fn_with_state(Arc::clone(&state), rate_limit_middleware))
        .layer(resilience)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Converts a shed/timed-out request into a response instead of a panic.
/// `LoadShedLayer` rejects once the service is overloaded; `TimeoutLayer`
/// rejects once a request runs past its deadline — both surface here as
/// this single handler distinguishes between them only by message.
async fn handle_resilience_error(err: BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::REQUEST_TIMEOUT, Json(json!({ "error": "request timed out" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "server is overloaded, try again shortly" })),
        )
            .into_response()
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Maps a path to the [`RouteClass`] its rate limit is drawn from.
fn classify_route(path: &str) -> RouteClass {
    if path == "/api/v1/request-consent" {
        RouteClass::ConsentRequest
    } else if path.starts_with("/api/consent/issue-token") || path.starts_with("/api/consent/logout") {
        RouteClass::ConsentAction
    } else if path.starts_with("/api/consent/events") {
        RouteClass::TokenValidation
    } else {
        RouteClass::GlobalPerIp
    }
}

/// Rate-limits every request by `(route_class, rate_limit_key)`:
/// authenticated-user key if `X-User-Id` is present, remote IP otherwise.
/// `/health` is exempt and always public.
async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if path == "/health" {
        return next.run(request).await;
    }

    let user_id = request
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok());
    let key = rate_limit_key(user_id, addr.ip());
    let class = classify_route(&path);

    if !state.limiter.check(class, &key) {
        return (StatusCode::TOO_MANY_REQUESTS, Json(json!({ "error": "rate limit exceeded" }))).into_response();
    }
    if !state.limiter.check(RouteClass::GlobalPerIp, &addr.ip().to_string()) {
        return (StatusCode::TOO_MANY_REQUESTS, Json(json!({ "error": "rate limit exceeded" }))).into_response();
    }

    next.run(request).await
}

impl IntoResponse for ConsentError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({ "error": self.reason() });
        if let ConsentError::ScopeMismatch { requested, .. } = &self {
            body["required_scope"] = json!(requested);
        }
        (status, Json(body)).into_response()
    }
}

// ── POST /api/v1/request-consent ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ConsentRequestBody {
    pub developer_token: String,
    pub user_id: String,
    pub scope: String,
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: i64,
}

fn default_expiry_hours() -> i64 {
    1
}

#[derive(Debug, Serialize)]
pub struct ConsentResponseBody {
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

async fn request_consent_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConsentRequestBody>,
) -> Response {
    let outcome = state.coordinator.request_consent(
        &body.developer_token,
        &body.user_id,
        &body.scope,
        body.expiry_hours,
        now_ms(),
    );

    match outcome {
        Ok(ConsentOutcome::AlreadyGranted { token }) => Json(ConsentResponseBody {
            status: "already_granted",
            message: "User has already granted consent for this scope.".to_string(),
            consent_token: Some(token),
            request_id: None,
        })
        .into_response(),
        Ok(ConsentOutcome::Pending { request_id }) => Json(ConsentResponseBody {
            status: "pending",
            message: format!("Consent request submitted. Request ID: {request_id}"),
            consent_token: None,
            request_id: Some(request_id),
        })
        .into_response(),
        Ok(ConsentOutcome::PendingExists { request_id }) => Json(ConsentResponseBody {
            status: "pending",
            message: "Consent request already pending. Waiting for user approval.".to_string(),
            consent_token: None,
            request_id: Some(request_id),
        })
        .into_response(),
        Ok(ConsentOutcome::DeniedCooldown) => Json(ConsentResponseBody {
            status: "denied_cooldown",
            message: "This scope was recently denied; please wait before requesting it again.".to_string(),
            consent_token: None,
            request_id: None,
        })
        .into_response(),
        Err(e) => {
            warn!(error = %e, "request_consent failed");
            e.into_response()
        }
    }
}

// ── POST /api/consent/issue-token ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct IssueTokenBody {
    pub user_id: String,
    #[serde(default = "default_issue_scope")]
    pub scope: String,
}

fn default_issue_scope() -> String {
    "vault.owner".to_string()
}

#[derive(Debug, Serialize)]
pub struct IssueTokenResponseBody {
    pub session_token: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub scope: String,
}

/// Self-issuance for an authenticated principal. Identity verification
/// (matching a bearer identity token to `user_id`) is an external
/// collaborator left external; this handler trusts `user_id` as already
/// verified by whatever sits in front of it.
async fn issue_token_handler(State(state): State<Arc<AppState>>, Json(body): Json<IssueTokenBody>) -> Response {
    let now = now_ms();
    match state.coordinator.self_issue(&body.user_id, &body.scope, state.issue_token_ttl_ms, now) {
        Ok(wire) => Json(IssueTokenResponseBody {
            session_token: wire,
            issued_at: now,
            expires_at: now + state.issue_token_ttl_ms,
            scope: body.scope,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

// ── GET /api/consent/active ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UserIdQuery {
    #[serde(rename = "userId")]
    pub user_id: String,
}

async fn active_handler(State(state): State<Arc<AppState>>, Query(query): Query<UserIdQuery>) -> Response {
    let active = state.coordinator.active(&query.user_id, now_ms());
    Json(json!({ "active": active })).into_response()
}

// ── GET /api/consent/history ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    20
}

async fn history_handler(State(state): State<Arc<AppState>>, Query(query): Query<HistoryQuery>) -> Response {
    let page = state.coordinator.history(&query.user_id, query.page, query.limit);
    Json(page).into_response()
}

// ── POST /api/consent/logout ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LogoutBody {
    pub user_id: String,
}

async fn logout_handler(State(state): State<Arc<AppState>>, Json(body): Json<LogoutBody>) -> Response {
    let count = state.coordinator.revoke_all_for_user(&body.user_id, now_ms());
    Json(json!({ "revoked": count })).into_response()
}
