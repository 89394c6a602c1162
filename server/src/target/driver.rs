//! Driver process spawning and teardown.
//!
//! Drivers are arbitrary user commands run via `sh -c`, so a driver is
//! usually a small process tree (the shell, the driver, whatever the driver
//! spawns to build its tunnel). The driver is made a process group leader via
//! `setpgid(0, 0)` so teardown can signal `-pgid` and reach every descendant
//! instead of orphaning grandchildren.
//!
//! Teardown is two-phase: SIGTERM to the group, then SIGKILL after
//! [`TERM_GRACE`] for anything that ignored it.

use std::net::TcpListener;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::debug;

/// Environment variable telling the driver which loopback port to serve its
/// control plane on.
pub const CONTROL_PORT_ENV: &str = "OPSNOTEBOOK_CONTROL_PORT";

/// Grace period between SIGTERM and SIGKILL on teardown.
pub const TERM_GRACE: Duration = Duration::from_secs(2);

/// Reserve a loopback TCP port by binding `127.0.0.1:0` and immediately
/// closing the listener.
///
/// The port is only reserved in the statistical sense: another process may
/// grab it before the driver binds. That race is accepted; a driver that
/// fails to bind shows up as a readiness timeout and goes through the normal
/// error/backoff path.
pub fn reserve_loopback_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Spawn a driver command in its own process group.
///
/// The command runs under `sh -c` with the inherited environment plus
/// [`CONTROL_PORT_ENV`]. Stderr stays attached to the broker's stderr for
/// operator visibility; stdout and stdin are detached.
pub fn spawn_driver(driver_cmd: &str, control_port: u16) -> std::io::Result<Child> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(driver_cmd)
        .env(CONTROL_PORT_ENV, control_port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());
    set_process_group(&mut cmd);
    cmd.spawn()
}

#[cfg(unix)]
fn set_process_group(cmd: &mut Command) {
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn set_process_group(_cmd: &mut Command) {
    // No process groups here; teardown falls back to killing the direct
    // child only.
}

/// Terminate a driver's process group: SIGTERM now, SIGKILL after
/// [`TERM_GRACE`].
///
/// Returns immediately; the SIGKILL runs on a background task so callers
/// (disconnect, reconnect) never block on the grace period.
#[cfg(unix)]
pub fn terminate_process_group(pgid: i32) {
    if pgid <= 0 {
        return;
    }
    // kill(-pgid, sig) delivers to every process in the group.
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
    debug!("sent SIGTERM to process group {pgid}");
    tokio::spawn(async move {
        tokio::time::sleep(TERM_GRACE).await;
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
        debug!("sent SIGKILL to process group {pgid}");
    });
}

#[cfg(not(unix))]
pub fn terminate_process_group(_pgid: i32) {}

/// True while a process group leader with the given id is still alive.
#[cfg(unix)]
pub fn process_group_alive(pgid: i32) -> bool {
    if pgid <= 0 {
        return false;
    }
    // Signal 0 performs error checking only.
    unsafe { libc::kill(-pgid, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_group_alive(_pgid: i32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_exports_the_control_port() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("port");
        let mut child = spawn_driver(
            &format!("printf %s \"$OPSNOTEBOOK_CONTROL_PORT\" > {}", out.display()),
            43210,
        )
        .unwrap();
        child.wait().await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "43210");
    }

    #[tokio::test]
    async fn reserve_returns_bindable_port() {
        let port = reserve_loopback_port().unwrap();
        assert!(port > 0);
        // Freed on drop, so binding again succeeds.
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    /// Poll until no live process remains in the group. Panics past the
    /// deadline. The direct child must already be reaped via `wait()` or the
    /// zombie keeps `kill(-pgid, 0)` succeeding.
    async fn assert_group_dies(pgid: i32, within: Duration) {
        let deadline = tokio::time::Instant::now() + within;
        while process_group_alive(pgid) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "process group {pgid} survived teardown"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn terminate_kills_the_whole_process_tree() {
        // The shell forks a grandchild that only dies with the group.
        let mut child = spawn_driver("sleep 60 & wait", 0).unwrap();
        let pgid = child.id().map(|p| p as i32).unwrap();
        assert!(process_group_alive(pgid));

        terminate_process_group(pgid);
        let _ = child.wait().await;
        assert_group_dies(pgid, Duration::from_secs(3)).await;
    }

    #[tokio::test]
    async fn sigterm_ignoring_tree_dies_by_sigkill() {
        let mut child = spawn_driver("trap '' TERM; sleep 60", 0).unwrap();
        let pgid = child.id().map(|p| p as i32).unwrap();
        assert!(process_group_alive(pgid));

        terminate_process_group(pgid);
        // Still alive right after SIGTERM: the trap swallows it and sleep
        // inherits the ignored disposition.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(process_group_alive(pgid));

        // The grace-period SIGKILL is not ignorable.
        tokio::time::timeout(TERM_GRACE + Duration::from_secs(2), child.wait())
            .await
            .expect("driver ignored SIGKILL")
            .unwrap();
        assert_group_dies(pgid, Duration::from_secs(3)).await;
    }
}
