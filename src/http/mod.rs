//! HTTP surface — the representative, stable paths through which every
//! external caller reaches the consent core.
//!
//! Routes live in [`routes`]; the two server-push endpoints live in [`sse`]
//! since their handler shape (an [`axum::response::sse::Sse`] stream) is
//! different enough from the request/response handlers to earn their own
//! file.

pub mod routes;
pub mod sse;

pub use routes::{build_router, AppState};
