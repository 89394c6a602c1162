//! Target supervision: registry, connection state machine, crash recovery.
//!
//! ```text
//! mod.rs        — TargetManager: registry + connect/disconnect/shutdown
//! state.rs      — TargetState, TargetStatus, ConnectionInfo, snapshots
//! driver.rs     — process spawn (own process group) and teardown
//! handshake.rs  — /status polling + POST /connect
//! proxy.rs      — proxy relay and exec side-channel
//! ```
//!
//! One [`TargetManager`] owns every [`TargetState`] for the process lifetime.
//! Each target walks the state machine
//! `disconnected → connecting → connected`, falling to `error` (30 s backoff)
//! on any connect failure and back to `disconnected` (5 s delay, then
//! reconnect) when a connected driver dies. Explicit disconnects trip the
//! attempt's cancellation token first, which keeps the crash watcher from
//! fighting the caller.

pub mod driver;
pub mod handshake;
pub mod proxy;
pub mod state;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, VariableRule};
use proxy::RelayError;
use state::{ConnectionInfo, TargetSnapshot, TargetState, TargetStatus};

/// Delay before reconnecting after a connected driver exits on its own.
pub const CRASH_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Backoff before retrying after a failed connect attempt.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Supervises every configured target.
///
/// The registry map is filled at startup and never shrinks; lookups take the
/// map-level read lock, per-target mutation takes that target's own lock.
pub struct TargetManager {
    targets: RwLock<HashMap<String, Arc<TargetState>>>,
    rules: Vec<VariableRule>,
    group_by: Vec<String>,
    /// Root cancellation token; tripped once, on shutdown.
    root: CancellationToken,
    /// Client for driver control planes (plain loopback HTTP).
    control_client: reqwest::Client,
    /// Client for the proxy hop; tunnels often terminate TLS with self-signed
    /// certificates, so verification is off.
    proxy_client: reqwest::Client,
}

impl TargetManager {
    /// Build the registry from a loaded config; every target starts
    /// `disconnected`.
    pub fn new(config: &Config) -> Arc<Self> {
        let targets = config
            .targets
            .iter()
            .map(|t| (t.id.clone(), Arc::new(TargetState::new(t.clone()))))
            .collect();

        let control_client = reqwest::Client::new();
        let proxy_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .expect("build proxy http client");

        Arc::new(Self {
            targets: RwLock::new(targets),
            rules: config.variables.clone(),
            group_by: config.group_by.clone(),
            root: CancellationToken::new(),
            control_client,
            proxy_client,
        })
    }

    pub fn group_by(&self) -> &[String] {
        &self.group_by
    }

    pub fn rules(&self) -> &[VariableRule] {
        &self.rules
    }

    /// Look up a target by id.
    pub async fn get(&self, id: &str) -> Option<Arc<TargetState>> {
        self.targets.read().await.get(id).cloned()
    }

    /// All registered targets, in unspecified order.
    pub async fn all(&self) -> Vec<Arc<TargetState>> {
        self.targets.read().await.values().cloned().collect()
    }

    /// Value-copied snapshots of every target, sorted by id for stable API
    /// output.
    pub async fn snapshots(&self) -> Vec<TargetSnapshot> {
        let targets = self.all().await;
        let mut snapshots = Vec::with_capacity(targets.len());
        for target in targets {
            snapshots.push(target.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        snapshots
    }

    /// Connect every target in parallel and wait for each to settle in
    /// `connected` or `error`.
    pub async fn connect_all(self: &Arc<Self>) {
        let targets = self.all().await;
        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let manager = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                manager.connect(&target).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Drive one target from `disconnected`/`error` to `connected`.
    ///
    /// Idempotent under concurrent entry: a second caller during
    /// `connecting` or `connected` returns immediately. Failures land in
    /// `error` with a scheduled retry; success forks a crash watcher that
    /// owns the driver process.
    pub async fn connect(self: &Arc<Self>, target: &Arc<TargetState>) {
        {
            let mut runtime = target.runtime.write().await;
            if matches!(
                runtime.status,
                TargetStatus::Connected | TargetStatus::Connecting
            ) {
                return;
            }
            runtime.status = TargetStatus::Connecting;
            runtime.error.clear();
        }

        let id = &target.config.id;
        info!("[{id}] connecting...");

        let cancel = self.root.child_token();

        let port = match driver::reserve_loopback_port() {
            Ok(port) => port,
            Err(e) => {
                self.set_error(target, format!("find port: {e}")).await;
                return;
            }
        };

        let child = match driver::spawn_driver(&target.config.driver_cmd, port) {
            Ok(child) => child,
            Err(e) => {
                self.set_error(target, format!("start driver: {e}")).await;
                return;
            }
        };
        let pgid = child.id().map(|pid| pid as i32);

        {
            let mut runtime = target.runtime.write().await;
            runtime.pgid = pgid;
            runtime.cancel = Some(cancel.clone());
        }

        let control_url = format!("http://127.0.0.1:{port}");

        if !handshake::wait_for_ready(&self.control_client, &control_url, &cancel).await {
            if let Some(pgid) = pgid {
                driver::terminate_process_group(pgid);
            }
            self.set_error(target, "driver failed to start http server".to_string())
                .await;
            return;
        }

        let connection = match handshake::send_connect(&self.control_client, &control_url, &cancel)
            .await
        {
            Ok(mut connection) => {
                connection.control_url = control_url.clone();
                connection
            }
            Err(e) => {
                if let Some(pgid) = pgid {
                    driver::terminate_process_group(pgid);
                }
                self.set_error(target, format!("connect failed: {e}")).await;
                return;
            }
        };

        let target_url = connection.target_url.clone();
        {
            let mut runtime = target.runtime.write().await;
            runtime.connection = connection;
            runtime.status = TargetStatus::Connected;
            runtime.last_checked = Some(SystemTime::now());
        }
        info!("[{id}] connected: {target_url} (control: {control_url})");

        self.fork_crash_watcher(Arc::clone(target), child, cancel);
    }

    /// Watch a connected driver process until it exits.
    ///
    /// The watcher owns the `Child` and reaps it. When the exit was requested
    /// (the attempt's token or the root token is already cancelled) it returns
    /// silently; otherwise it atomically flips `connected → disconnected`,
    /// zeroes the connection, and schedules the auto-reconnect. Observing the
    /// status under the same write lock that clears it prevents a
    /// double-reconnect when an explicit disconnect races the process exit.
    fn fork_crash_watcher(
        self: &Arc<Self>,
        target: Arc<TargetState>,
        mut child: tokio::process::Child,
        cancel: CancellationToken,
    ) {
        let manager = Arc::clone(self);
        let root = self.root.clone();
        tokio::spawn(async move {
            let _ = child.wait().await;
            if cancel.is_cancelled() || root.is_cancelled() {
                return;
            }

            let was_connected = {
                let mut runtime = target.runtime.write().await;
                if runtime.status == TargetStatus::Connected {
                    runtime.status = TargetStatus::Disconnected;
                    runtime.connection = ConnectionInfo::default();
                    runtime.pgid = None;
                    true
                } else {
                    false
                }
            };

            if was_connected {
                warn!("[{}] driver exited unexpectedly", target.config.id);
                manager.schedule_reconnect(target, CRASH_RECONNECT_DELAY);
            }
        });
    }

    /// Record a failed connect attempt and schedule the backoff retry. The
    /// attempt's process (if any) is already being torn down, so the stored
    /// handles are dropped to keep a later disconnect from signalling a
    /// recycled pgid.
    async fn set_error(self: &Arc<Self>, target: &Arc<TargetState>, message: String) {
        {
            let mut runtime = target.runtime.write().await;
            runtime.status = TargetStatus::Error;
            runtime.error = message.clone();
            runtime.pgid = None;
            runtime.cancel = None;
        }
        error!("[{}] {message}", target.config.id);
        self.schedule_reconnect(Arc::clone(target), ERROR_BACKOFF);
    }

    /// Retry `connect` after `delay` unless the manager has shut down.
    fn schedule_reconnect(self: &Arc<Self>, target: Arc<TargetState>, delay: Duration) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if manager.root.is_cancelled() {
                return;
            }
            manager.connect(&target).await;
        });
    }

    /// Spawn a connect attempt without waiting for it (used by the reconnect
    /// API, which must return immediately).
    pub fn spawn_connect(self: &Arc<Self>, target: Arc<TargetState>) {
        self.schedule_reconnect(target, Duration::ZERO);
    }

    /// Tear down a target's driver and mark it `disconnected`.
    ///
    /// Handle snapshotting happens under the write lock; signalling happens
    /// outside it. The SIGTERM lands before the cancellation token trips so
    /// the crash watcher, woken by the process exit, already sees the
    /// disconnect as requested.
    pub async fn disconnect(&self, target: &Arc<TargetState>) {
        let (pgid, cancel) = {
            let mut runtime = target.runtime.write().await;
            let pgid = runtime.pgid.take();
            let cancel = runtime.cancel.take();
            runtime.status = TargetStatus::Disconnected;
            runtime.connection = ConnectionInfo::default();
            (pgid, cancel)
        };

        if let Some(pgid) = pgid {
            driver::terminate_process_group(pgid);
        }
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        info!("[{}] disconnected", target.config.id);
    }

    /// Disconnect every target.
    pub async fn disconnect_all(&self) {
        for target in self.all().await {
            self.disconnect(&target).await;
        }
    }

    /// Full teardown: disconnect every target (process groups get the whole
    /// SIGTERM→SIGKILL grace), then cancel the root token so watchers and
    /// backoff timers wind down.
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        // Let the grace-period SIGKILL tasks fire before the process exits;
        // cancelling the root first would let main return while drivers that
        // ignore SIGTERM are still alive.
        tokio::time::sleep(driver::TERM_GRACE + Duration::from_millis(100)).await;
        self.root.cancel();
    }

    /// Relay a client request through the target's tunnel.
    pub async fn proxy(
        &self,
        target: &TargetState,
        method: &str,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(Vec<u8>, u16), RelayError> {
        proxy::proxy_request(&self.proxy_client, target, method, path, body).await
    }

    /// Forward a shell command to the target's driver.
    pub async fn exec(
        &self,
        target: &TargetState,
        command: &str,
    ) -> Result<(Vec<u8>, u16), RelayError> {
        proxy::exec_request(&self.control_client, target, command).await
    }
}
