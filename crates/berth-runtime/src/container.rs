//! Container records and lifecycle transitions.
//!
//! A container is exactly one entry process running on an assembled root
//! filesystem: `Created` until the process starts, `Running` while it runs,
//! `Exited` once it ends with any status, `Failed` if it never started.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use berth_common::error::Result;
use berth_common::types::{ContainerId, ContainerState, ImageId, Isolation};
use serde::{Deserialize, Serialize};

/// Persisted view of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Unique identifier.
    pub id: ContainerId,
    /// Image the container was created from.
    pub image: ImageId,
    /// Reference the caller used for the image (tag or id prefix).
    pub image_ref: String,
    /// Account the entry process runs as.
    pub user: String,
    /// Isolation applied to the entry process.
    pub isolation: Isolation,
    /// Host path of the container root filesystem.
    pub rootfs: PathBuf,
    /// Current lifecycle state.
    pub state: ContainerState,
    /// PID of the entry process while it runs.
    pub pid: Option<u32>,
    /// Status code once exited.
    pub exit_code: Option<i32>,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
    /// ISO-8601 timestamp of the exit.
    pub finished_at: Option<String>,
}

impl ContainerRecord {
    /// Creates a record in the `Created` state.
    #[must_use]
    pub fn new(
        id: ContainerId,
        image: ImageId,
        image_ref: String,
        user: String,
        isolation: Isolation,
        rootfs: PathBuf,
    ) -> Self {
        Self {
            id,
            image,
            image_ref,
            user,
            isolation,
            rootfs,
            state: ContainerState::Created,
            pid: None,
            exit_code: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
        }
    }

    /// Records that the entry process started.
    pub fn mark_running(&mut self, pid: u32) {
        self.state = ContainerState::Running;
        self.pid = Some(pid);
    }

    /// Records that the entry process exited with `code`.
    pub fn mark_exited(&mut self, code: i32) {
        self.state = ContainerState::Exited;
        self.pid = None;
        self.exit_code = Some(code);
        self.finished_at = Some(chrono::Utc::now().to_rfc3339());
    }

    /// Records that the entry process could not be started.
    pub fn mark_failed(&mut self) {
        self.state = ContainerState::Failed;
        self.pid = None;
        self.finished_at = Some(chrono::Utc::now().to_rfc3339());
    }

    /// Returns whether the entry process is believed to be running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running && self.pid.is_some()
    }
}

/// Outcome of [`terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process exited after SIGTERM.
    Terminated,
    /// The process outlived the grace period and was sent SIGKILL.
    Killed,
    /// The process was already gone.
    NotRunning,
}

/// Sends SIGTERM to `pid`, then SIGKILL once `grace` has elapsed.
///
/// # Errors
///
/// Returns `PermissionDenied` if the process cannot be signaled.
#[cfg(unix)]
pub fn terminate(pid: u32, grace: Duration) -> Result<StopOutcome> {
    use nix::sys::signal::{Signal, kill};

    let target = nix_pid(pid)?;
    if !is_alive(pid) {
        return Ok(StopOutcome::NotRunning);
    }
    kill(target, Signal::SIGTERM).map_err(|e| signal_error(pid, e))?;
    tracing::info!(pid, grace_secs = grace.as_secs(), "sent SIGTERM");

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return Ok(StopOutcome::Terminated);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    if !is_alive(pid) {
        return Ok(StopOutcome::Terminated);
    }
    kill(target, Signal::SIGKILL).map_err(|e| signal_error(pid, e))?;
    tracing::warn!(pid, "grace period elapsed, sent SIGKILL");
    Ok(StopOutcome::Killed)
}

/// Stub for non-Unix platforms.
///
/// # Errors
///
/// Always returns an error: signals require a Unix host.
#[cfg(not(unix))]
pub fn terminate(pid: u32, _grace: Duration) -> Result<StopOutcome> {
    Err(berth_common::error::BerthError::PermissionDenied {
        message: format!("cannot signal pid {pid} on this platform"),
    })
}

/// Forwards `signal` to `pid` without waiting.
///
/// # Errors
///
/// Returns `PermissionDenied` if the process cannot be signaled.
#[cfg(unix)]
pub fn forward_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    nix::sys::signal::kill(nix_pid(pid)?, signal).map_err(|e| signal_error(pid, e))?;
    tracing::debug!(pid, signal = signal.as_str(), "signal forwarded");
    Ok(())
}

/// Returns whether `pid` names a live, non-zombie process.
#[cfg(unix)]
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let Ok(target) = nix_pid(pid) else {
        return false;
    };
    if nix::sys::signal::kill(target, None).is_err() {
        return false;
    }
    !is_zombie(pid)
}

/// Returns whether `pid` names a live process.
#[cfg(not(unix))]
#[must_use]
pub const fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
        stat.rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state == "Z")
    })
}

#[cfg(all(unix, not(target_os = "linux")))]
const fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn nix_pid(pid: u32) -> Result<nix::unistd::Pid> {
    i32::try_from(pid)
        .map(nix::unistd::Pid::from_raw)
        .map_err(|_| berth_common::error::BerthError::Config {
            message: format!("pid {pid} out of range"),
        })
}

#[cfg(unix)]
fn signal_error(pid: u32, e: nix::errno::Errno) -> berth_common::error::BerthError {
    berth_common::error::BerthError::PermissionDenied {
        message: format!("cannot signal pid {pid}: {e}"),
    }
}
