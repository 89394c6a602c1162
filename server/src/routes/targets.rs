//! Target listing, status, reconnect, exec, and the proxy endpoint.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::AppState;
use crate::config::VariableRule;
use crate::target::state::{TargetSnapshot, TargetStatus};
use crate::variables;

/// Clients that cannot attach bodies to the real method (browsers on GET)
/// send it here instead.
const METHOD_OVERRIDE_HEADER: &str = "x-http-method-override";

/// One entry of `GET /api/targets`: the target's config joined with its
/// connection state and resolved variables. The driver's `control_url` has no
/// field here and therefore cannot leak.
#[derive(Serialize)]
pub struct TargetInfo {
    id: String,
    name: String,
    tags: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    labels: HashMap<String, String>,
    driver_cmd: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    visual: HashMap<String, String>,
    status: TargetStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    local_url: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
    variables: Map<String, Value>,
}

impl TargetInfo {
    fn from_snapshot(snapshot: TargetSnapshot, rules: &[VariableRule]) -> Self {
        let variables = variables::resolve(&snapshot.config, rules);
        let config = snapshot.config;
        TargetInfo {
            id: config.id,
            name: config.name,
            tags: config.tags,
            labels: config.labels,
            driver_cmd: config.driver_cmd,
            visual: config.visual,
            status: snapshot.status,
            local_url: snapshot.connection.target_url,
            headers: snapshot.connection.headers,
            metadata: snapshot.connection.metadata,
            error: snapshot.error,
            variables,
        }
    }
}

/// `GET /api/targets` — every target with status and resolved variables.
pub async fn list_targets(State(state): State<AppState>) -> Json<Vec<TargetInfo>> {
    let rules = state.manager.rules().to_vec();
    let list = state
        .manager
        .snapshots()
        .await
        .into_iter()
        .map(|snapshot| TargetInfo::from_snapshot(snapshot, &rules))
        .collect();
    Json(list)
}

/// `GET /api/targets/{id}` — status probe for a single target.
pub async fn target_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let target = state.manager.get(&id).await.ok_or_else(not_found)?;
    let snapshot = target.snapshot().await;
    Ok(Json(json!({
        "id": snapshot.config.id,
        "status": snapshot.status,
        "error": snapshot.error,
    })))
}

/// `POST /api/targets/{id}/reconnect` — tear the driver down and bring it
/// back up. Returns before the new connect attempt finishes.
pub async fn reconnect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let target = state.manager.get(&id).await.ok_or_else(not_found)?;
    info!("[api] reconnecting target {id}");
    state.manager.disconnect(&target).await;
    state.manager.spawn_connect(target);
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct ExecBody {
    command: String,
}

/// `POST /api/targets/{id}/exec` — forward a shell command to the driver.
/// The driver's response (`stdout`/`stderr`/`exit_code`) passes through
/// verbatim.
pub async fn exec(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let Some(target) = state.manager.get(&id).await else {
        return not_found().into_response();
    };
    let payload: ExecBody = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("[api] exec on {id}: invalid json: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid json body" })),
            )
                .into_response();
        }
    };

    match state.manager.exec(&target, &payload.command).await {
        Ok((body, status)) => passthrough(status, body),
        Err(e) => bad_gateway(e.to_string()),
    }
}

/// `ANY /api/targets/{id}/proxy` — proxy to the tunnel root.
pub async fn proxy_root(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_proxy(state, id, String::new(), query, method, &headers, body).await
}

/// `ANY /api/targets/{id}/proxy/{path...}` — proxy an arbitrary sub-path.
pub async fn proxy(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_proxy(state, id, path, query, method, &headers, body).await
}

async fn dispatch_proxy(
    state: AppState,
    id: String,
    path: String,
    query: Option<String>,
    method: Method,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let Some(target) = state.manager.get(&id).await else {
        return not_found().into_response();
    };

    let mut proxy_path = format!("/{path}");
    if let Some(query) = query {
        proxy_path.push('?');
        proxy_path.push_str(&query);
    }

    // Browsers cannot attach a body to GET; honor the override header.
    let method = headers
        .get(METHOD_OVERRIDE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(|| method.as_str().to_string(), ToString::to_string);

    let body = if body.is_empty() {
        None
    } else {
        Some(body.to_vec())
    };

    match state.manager.proxy(&target, &method, &proxy_path, body).await {
        Ok((body, status)) => passthrough(status, body),
        Err(e) => bad_gateway(e.to_string()),
    }
}

/// Relay a driver/tunnel response to the client unchanged.
fn passthrough(status: u16, body: Vec<u8>) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn bad_gateway(message: String) -> Response {
    (StatusCode::BAD_GATEWAY, Json(json!({ "error": message }))).into_response()
}

fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "target not found" })),
    )
}
