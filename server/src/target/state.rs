//! Per-target runtime state.
//!
//! A [`TargetState`] pairs the immutable [`TargetConfig`] with the mutable
//! connection state behind a per-target `RwLock`. Status transitions and
//! connection updates take the write lock; listing, grouping and proxying
//! read a [`TargetSnapshot`] value copy and release the lock before doing any
//! I/O.
//!
//! The driver `Child` itself is owned by the crash-watcher task; the state
//! keeps only the process group id (needed for teardown) and the cancellation
//! token for the current connect attempt.

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::TargetConfig;

/// Connection lifecycle status of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl TargetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetStatus::Disconnected => "disconnected",
            TargetStatus::Connecting => "connecting",
            TargetStatus::Connected => "connected",
            TargetStatus::Error => "error",
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for TargetStatus {
    fn default() -> Self {
        TargetStatus::Disconnected
    }
}

/// Handshake data returned by the driver's `POST /connect`.
///
/// `control_url` is filled in by the supervisor after the handshake and must
/// never reach external clients; this type deliberately does not implement
/// `Serialize` — every externally-visible shape is an explicit struct in
/// `routes/`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionInfo {
    /// Loopback URL of the driver's own control plane. Internal only.
    #[serde(skip)]
    pub control_url: String,
    /// Loopback tunnel URL proxied requests are forwarded to.
    #[serde(default)]
    pub target_url: String,
    /// Headers injected verbatim into every proxied request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Opaque driver metadata, forwarded to the UI.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Mutable fields of a target, guarded by the per-state lock.
#[derive(Debug, Default)]
pub struct TargetRuntime {
    pub status: TargetStatus,
    /// Valid iff `status == Connected`.
    pub connection: ConnectionInfo,
    /// Last error message; valid iff `status == Error`.
    pub error: String,
    /// Time of the last successful handshake.
    pub last_checked: Option<SystemTime>,
    /// Process group id of the running driver; valid iff a driver is running.
    pub pgid: Option<i32>,
    /// Cancellation token for the current connect attempt; tripping it keeps
    /// the crash watcher from reconnecting.
    pub cancel: Option<CancellationToken>,
}

/// One supervised target: immutable config plus locked runtime state.
#[derive(Debug)]
pub struct TargetState {
    pub config: TargetConfig,
    pub runtime: RwLock<TargetRuntime>,
}

impl TargetState {
    pub fn new(config: TargetConfig) -> Self {
        Self {
            config,
            runtime: RwLock::new(TargetRuntime::default()),
        }
    }

    /// Value copy of the current state, taken under the read lock. The only
    /// shape handed to pure functions and API marshalling.
    pub async fn snapshot(&self) -> TargetSnapshot {
        let runtime = self.runtime.read().await;
        TargetSnapshot {
            config: self.config.clone(),
            status: runtime.status,
            connection: runtime.connection.clone(),
            error: runtime.error.clone(),
            last_checked: runtime.last_checked,
        }
    }
}

/// Point-in-time copy of a target's state. Holding one never blocks the
/// supervisor.
#[derive(Debug, Clone)]
pub struct TargetSnapshot {
    pub config: TargetConfig,
    pub status: TargetStatus,
    pub connection: ConnectionInfo,
    pub error: String,
    pub last_checked: Option<SystemTime>,
}
