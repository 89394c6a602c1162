#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]

//! OpsNotebook backend — multi-target connection broker.
//!
//! A single long-running process that supervises a fleet of external
//! "driver" subprocesses (each establishing a tunnel to a remote service) and
//! proxies client HTTP traffic through those tunnels. Targets are aggregated
//! into groups keyed by configurable tag dimensions for the notebook UI.
//!
//! ## Driver contract
//!
//! A driver is launched via `sh -c <driver_cmd>` with
//! `OPSNOTEBOOK_CONTROL_PORT=<port>` in its environment and must serve an
//! HTTP/1.1 control plane on `127.0.0.1:<port>`:
//!
//! - `GET /status` → 200 once ready to accept `/connect`
//! - `POST /connect` → 200 with `{"target_url": ..., "headers"?, "metadata"?}`
//! - `POST /execute` with `{"command": ...}` → `{"stdout", "stderr", "exit_code"}`
//!
//! Drivers must exit on SIGTERM; survivors are SIGKILLed after 2 s.
//!
//! ## Architecture
//!
//! ```text
//! main.rs       — entry point, clap flags, router setup, graceful shutdown
//! config.rs     — JSON configuration, glob target filter, validation
//! variables.rs  — pure tag→variables rule engine
//! groups.rs     — composite keys + group aggregation
//! target/
//!   mod.rs      — TargetManager: registry, connect/disconnect/shutdown
//!   state.rs    — per-target state behind a per-target RwLock
//!   driver.rs   — process-group spawn and SIGTERM→SIGKILL teardown
//!   handshake.rs— /status polling + POST /connect
//!   proxy.rs    — proxy relay and exec side-channel
//! routes/
//!   health.rs   — GET /api/health, GET /api/config
//!   targets.rs  — /api/targets, status/reconnect/exec/proxy per target
//!   groups.rs   — GET /api/groups
//! ```

pub mod config;
pub mod groups;
pub mod routes;
pub mod target;
pub mod variables;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use routes::{api_router, AppState};
pub use target::TargetManager;
