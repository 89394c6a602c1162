//! Two-phase handshake against a driver's control plane.
//!
//! Phase one polls `GET /status` until the freshly spawned driver has its
//! HTTP server up. Phase two issues `POST /connect`, which the driver answers
//! with the tunnel [`ConnectionInfo`] once its tunnel is established.
//!
//! Both phases honor the connect attempt's cancellation token so an explicit
//! disconnect during `connecting` does not leave a poll loop running against
//! a dead driver.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::state::ConnectionInfo;

/// Per-attempt timeout for one `GET /status` probe.
pub const STATUS_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Delay between `GET /status` probes.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Number of `GET /status` probes before giving up (5 s aggregate).
pub const STATUS_POLL_ATTEMPTS: u32 = 50;

/// Total timeout for the `POST /connect` handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Handshake failures, surfaced into the target's `error` field.
#[derive(Debug)]
pub enum HandshakeError {
    /// Transport-level failure talking to the control plane.
    Request(reqwest::Error),
    /// The driver answered `/connect` with a non-200 status.
    Status { status: u16, body: String },
    /// The `/connect` response body was not valid ConnectionInfo JSON.
    Decode(reqwest::Error),
    /// The connect attempt was cancelled by disconnect or shutdown.
    Cancelled,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Request(e) => write!(f, "{e}"),
            HandshakeError::Status { status, body } => write!(f, "status {status}: {body}"),
            HandshakeError::Decode(e) => write!(f, "decode response: {e}"),
            HandshakeError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Poll `GET <control_url>/status` until the driver is ready.
///
/// Returns `false` when the driver never produced an HTTP 200 within the
/// aggregate window, or when the token was cancelled.
pub async fn wait_for_ready(
    client: &reqwest::Client,
    control_url: &str,
    cancel: &CancellationToken,
) -> bool {
    let url = format!("{control_url}/status");
    for _ in 0..STATUS_POLL_ATTEMPTS {
        if cancel.is_cancelled() {
            return false;
        }
        let probe = client.get(&url).timeout(STATUS_POLL_TIMEOUT).send();
        match probe.await {
            Ok(resp) if resp.status().as_u16() == 200 => {
                debug!("[driver] GET {url} -> 200");
                return true;
            }
            Ok(resp) => debug!("[driver] GET {url} -> {}", resp.status()),
            Err(_) => {}
        }
        tokio::select! {
            () = cancel.cancelled() => return false,
            () = tokio::time::sleep(STATUS_POLL_INTERVAL) => {}
        }
    }
    warn!("[driver] GET {url} -> timeout after 5s");
    false
}

/// Issue `POST <control_url>/connect` and decode the driver's tunnel info.
///
/// `control_url` on the returned [`ConnectionInfo`] is left for the caller to
/// fill in.
pub async fn send_connect(
    client: &reqwest::Client,
    control_url: &str,
    cancel: &CancellationToken,
) -> Result<ConnectionInfo, HandshakeError> {
    let url = format!("{control_url}/connect");
    let request = client.post(&url).timeout(CONNECT_TIMEOUT).send();
    let resp = tokio::select! {
        () = cancel.cancelled() => return Err(HandshakeError::Cancelled),
        resp = request => resp.map_err(HandshakeError::Request)?,
    };

    let status = resp.status().as_u16();
    debug!("[driver] POST {url} -> {status}");
    if status != 200 {
        let body = resp.text().await.unwrap_or_default();
        return Err(HandshakeError::Status { status, body });
    }
    resp.json::<ConnectionInfo>()
        .await
        .map_err(HandshakeError::Decode)
}
