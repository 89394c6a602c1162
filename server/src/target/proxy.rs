//! Per-target HTTP relay and exec side-channel.
//!
//! [`proxy_request`] forwards one client request to the tunnel URL the driver
//! handed over at handshake, injecting the driver's headers. [`exec_request`]
//! forwards a shell command to the driver's own `/execute` endpoint. Both
//! read the fields they need from a snapshot taken under the state lock and
//! perform all network I/O outside it.
//!
//! Responses are fully buffered; the targeted control-plane APIs (search
//! engines, REST gateways) exchange JSON documents, not streams.

use std::fmt;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use tracing::{info, warn};

use super::state::{TargetState, TargetStatus};

/// Timeout for a proxied request (long-running index operations).
pub const PROXY_TIMEOUT: Duration = Duration::from_secs(3600);

/// Timeout for a forwarded exec command.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(3600);

/// Failures surfaced to API clients as 502 responses.
#[derive(Debug)]
pub enum RelayError {
    /// The target is not in the `connected` state.
    NotConnected(TargetStatus),
    /// Connected, but the driver supplied no tunnel URL.
    NoBaseUrl,
    /// No driver control plane is available for exec.
    NoControlUrl,
    /// The requested HTTP method is not a valid token.
    BadMethod(String),
    /// Transport-level failure on the outbound hop.
    Request(reqwest::Error),
    /// Headers were received but reading the body failed.
    ReadBody { status: u16, source: reqwest::Error },
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::NotConnected(status) => {
                write!(f, "target not connected (status: {status})")
            }
            RelayError::NoBaseUrl => write!(f, "target has no base URL"),
            RelayError::NoControlUrl => write!(f, "driver control url not available"),
            RelayError::BadMethod(m) => write!(f, "invalid http method {m:?}"),
            RelayError::Request(e) => write!(f, "{e}"),
            RelayError::ReadBody { source, .. } => write!(f, "read body: {source}"),
        }
    }
}

impl std::error::Error for RelayError {}

/// Forward `method path?query` with `body` to the target's tunnel URL.
///
/// The outbound request always advertises `Accept: application/json`, adds
/// `Content-Type: application/json` when a body is present, and then writes
/// the driver-supplied headers verbatim — on a name collision the driver
/// wins. Returns the buffered response body and status code.
pub async fn proxy_request(
    client: &reqwest::Client,
    state: &TargetState,
    method: &str,
    path: &str,
    body: Option<Vec<u8>>,
) -> Result<(Vec<u8>, u16), RelayError> {
    let id = &state.config.id;
    let (status, base_url, headers) = {
        let runtime = state.runtime.read().await;
        (
            runtime.status,
            runtime.connection.target_url.clone(),
            runtime.connection.headers.clone(),
        )
    };

    if status != TargetStatus::Connected {
        warn!("[{id}] PROXY {method} {path} -> target not connected (status: {status})");
        return Err(RelayError::NotConnected(status));
    }
    if base_url.is_empty() {
        warn!("[{id}] PROXY {method} {path} -> target has no base URL");
        return Err(RelayError::NoBaseUrl);
    }

    let url = format!("{}{path}", base_url.trim_end_matches('/'));
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| RelayError::BadMethod(method.to_string()))?;

    let mut header_map = HeaderMap::new();
    header_map.insert(ACCEPT, HeaderValue::from_static("application/json"));
    if body.is_some() {
        header_map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    for (name, value) in &headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                header_map.insert(name, value);
            }
            _ => warn!("[{id}] skipping invalid driver header {name:?}"),
        }
    }

    let mut request = client
        .request(method.clone(), &url)
        .timeout(PROXY_TIMEOUT)
        .headers(header_map);
    if let Some(body) = body {
        request = request.body(body);
    }

    let start = std::time::Instant::now();
    let resp = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!("[{id}] PROXY {method} {path} -> error: {e}");
            return Err(RelayError::Request(e));
        }
    };
    let status_code = resp.status().as_u16();
    let bytes = resp.bytes().await.map_err(|source| RelayError::ReadBody {
        status: status_code,
        source,
    })?;
    info!(
        "[{id}] PROXY {method} {path} -> {status_code} (took {:?})",
        start.elapsed()
    );
    Ok((bytes.to_vec(), status_code))
}

/// Forward a shell command to the driver's `POST /execute`.
///
/// The response body (`stdout` / `stderr` / `exit_code` by protocol contract)
/// is returned verbatim; the broker does not interpret it.
pub async fn exec_request(
    client: &reqwest::Client,
    state: &TargetState,
    command: &str,
) -> Result<(Vec<u8>, u16), RelayError> {
    let id = &state.config.id;
    let control_url = {
        let runtime = state.runtime.read().await;
        runtime.connection.control_url.clone()
    };
    if control_url.is_empty() {
        warn!("[{id}] EXEC -> error: driver control url not available");
        return Err(RelayError::NoControlUrl);
    }

    let start = std::time::Instant::now();
    let resp = client
        .post(format!("{control_url}/execute"))
        .timeout(EXEC_TIMEOUT)
        .json(&serde_json::json!({ "command": command }))
        .send()
        .await
        .map_err(|e| {
            warn!("[{id}] EXEC {command} -> error: {e}");
            RelayError::Request(e)
        })?;
    let status_code = resp.status().as_u16();
    let bytes = resp.bytes().await.map_err(|source| RelayError::ReadBody {
        status: status_code,
        source,
    })?;
    info!(
        "[{id}] EXEC {command} -> {status_code} (took {:?})",
        start.elapsed()
    );
    Ok((bytes.to_vec(), status_code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;
    use axum::extract::Request;
    use axum::routing::{any, post};
    use axum::Router;
    use std::collections::HashMap;

    fn connected_state(target_url: &str, headers: &[(&str, &str)]) -> TargetState {
        let state = TargetState::new(TargetConfig {
            id: "t1".to_string(),
            driver_cmd: "true".to_string(),
            ..TargetConfig::default()
        });
        {
            let mut runtime = state.runtime.try_write().unwrap();
            runtime.status = TargetStatus::Connected;
            runtime.connection.target_url = target_url.to_string();
            runtime.connection.headers = headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        }
        state
    }

    async fn echo_server() -> String {
        // Echoes method, full path+query, and selected headers as JSON.
        let router = Router::new().route(
            "/{*rest}",
            any(|req: Request| async move {
                let method = req.method().to_string();
                let uri = req.uri().to_string();
                let headers: HashMap<String, String> = req
                    .headers()
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                    .collect();
                axum::Json(serde_json::json!({
                    "method": method,
                    "uri": uri,
                    "headers": headers,
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn injects_driver_headers_and_preserves_path() {
        let base = echo_server().await;
        let state = connected_state(&base, &[("authorization", "Bearer x")]);
        let client = reqwest::Client::new();

        let (body, status) = proxy_request(&client, &state, "GET", "/foo?a=1", None)
            .await
            .unwrap();
        assert_eq!(status, 200);
        let echoed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(echoed["method"], "GET");
        assert_eq!(echoed["uri"], "/foo?a=1");
        assert_eq!(echoed["headers"]["authorization"], "Bearer x");
        assert_eq!(echoed["headers"]["accept"], "application/json");
    }

    #[tokio::test]
    async fn driver_headers_win_collisions() {
        let base = echo_server().await;
        let state = connected_state(&base, &[("accept", "application/x-ndjson")]);
        let client = reqwest::Client::new();

        let (body, _) = proxy_request(&client, &state, "GET", "/x", None)
            .await
            .unwrap();
        let echoed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(echoed["headers"]["accept"], "application/x-ndjson");
    }

    #[tokio::test]
    async fn body_adds_content_type() {
        let base = echo_server().await;
        let state = connected_state(&base, &[]);
        let client = reqwest::Client::new();

        let (body, _) = proxy_request(
            &client,
            &state,
            "POST",
            "/x",
            Some(br#"{"q":1}"#.to_vec()),
        )
        .await
        .unwrap();
        let echoed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["headers"]["content-type"], "application/json");
    }

    #[tokio::test]
    async fn trailing_slash_on_base_url_is_trimmed() {
        let base = echo_server().await;
        let state = connected_state(&format!("{base}/"), &[]);
        let client = reqwest::Client::new();

        let (body, _) = proxy_request(&client, &state, "GET", "/foo", None)
            .await
            .unwrap();
        let echoed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(echoed["uri"], "/foo");
    }

    #[tokio::test]
    async fn rejects_non_connected_target() {
        let state = TargetState::new(TargetConfig {
            id: "t1".to_string(),
            driver_cmd: "true".to_string(),
            ..TargetConfig::default()
        });
        let client = reqwest::Client::new();
        let err = proxy_request(&client, &state, "GET", "/x", None)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "target not connected (status: disconnected)"
        );
    }

    #[tokio::test]
    async fn rejects_connected_target_without_base_url() {
        let state = connected_state("", &[]);
        let client = reqwest::Client::new();
        let err = proxy_request(&client, &state, "GET", "/x", None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "target has no base URL");
    }

    #[tokio::test]
    async fn exec_posts_command_to_control_plane() {
        let router = Router::new().route(
            "/execute",
            post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                axum::Json(serde_json::json!({
                    "stdout": format!("ran: {}", body["command"].as_str().unwrap()),
                    "stderr": "",
                    "exit_code": 0,
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let state = connected_state("http://unused", &[]);
        state.runtime.try_write().unwrap().connection.control_url = format!("http://{addr}");

        let client = reqwest::Client::new();
        let (body, status) = exec_request(&client, &state, "uname -a").await.unwrap();
        assert_eq!(status, 200);
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["stdout"], "ran: uname -a");
        assert_eq!(parsed["exit_code"], 0);
    }

    #[tokio::test]
    async fn exec_without_control_url_fails_fast() {
        let state = connected_state("http://unused", &[]);
        let client = reqwest::Client::new();
        let err = exec_request(&client, &state, "true").await.unwrap_err();
        assert!(matches!(err, RelayError::NoControlUrl));
    }
}
