//! HTTP route handlers for the client-facing API.
//!
//! Each sub-module corresponds to an endpoint group. Handlers are thin
//! adapters: parse the request, look the target up in the registry, call into
//! the manager, serialize the result. Response shapes are explicit structs —
//! runtime state is never serialized directly, which is what keeps the
//! driver's internal `control_url` off the wire.

pub mod groups;
pub mod health;
pub mod targets;

use std::sync::Arc;

use axum::routing::{any, get, post};
use axum::Router;

use crate::target::TargetManager;

/// Shared application state passed to every handler via Axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    /// The process-wide target registry and supervisor.
    pub manager: Arc<TargetManager>,
}

/// Build the `/api` router. Method routing yields `405` with an `Allow`
/// header on mismatches; unknown paths fall through to the caller's fallback.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/config", get(health::config))
        .route("/api/health", get(health::health))
        .route("/api/targets", get(targets::list_targets))
        .route("/api/groups", get(groups::list_groups))
        .route("/api/targets/{id}", get(targets::target_status))
        .route("/api/targets/{id}/reconnect", post(targets::reconnect))
        .route("/api/targets/{id}/exec", post(targets::exec))
        .route("/api/targets/{id}/proxy", any(targets::proxy_root))
        .route("/api/targets/{id}/proxy/{*path}", any(targets::proxy))
        .with_state(state)
}
