//! Liveness probe and UI bootstrap config.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::AppState;

/// `GET /api/health` — liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /api/config` — the grouping dimensions the UI renders columns from.
pub async fn config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "group_by": state.manager.group_by() }))
}
