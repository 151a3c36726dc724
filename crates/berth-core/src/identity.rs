//! Execution identities and the one-way privilege drop.
//!
//! The build starts as the privileged builder. Once an unprivileged account
//! becomes active nothing in this crate offers a way back: the
//! [`IdentityLock`] refuses further switches, and [`drop_privileges`] is
//! irreversible at the kernel level.

use std::fmt;
use std::path::{Path, PathBuf};

use berth_common::constants::BUILDER_USER;
use berth_common::error::{BerthError, Result};
use serde::{Deserialize, Serialize};

use crate::account::Account;

/// A numeric identity that filesystem entries and processes run under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Login name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
    /// Numeric primary group id.
    pub gid: u32,
    /// Home directory inside the image.
    pub home: PathBuf,
}

impl Identity {
    /// The privileged identity every build starts with.
    #[must_use]
    pub fn builder() -> Self {
        Self {
            name: BUILDER_USER.to_string(),
            uid: 0,
            gid: 0,
            home: PathBuf::from("/root"),
        }
    }

    /// Returns whether this identity carries root privileges.
    #[must_use]
    pub const fn is_privileged(&self) -> bool {
        self.uid == 0
    }
}

impl From<&Account> for Identity {
    fn from(account: &Account) -> Self {
        Self {
            name: account.name.clone(),
            uid: account.uid,
            gid: account.gid,
            home: account.home.clone(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.uid, self.gid)
    }
}

/// Tracks the active identity of a build and enforces the one-way switch.
#[derive(Debug, Clone)]
pub struct IdentityLock {
    active: Identity,
    switched: bool,
}

impl Default for IdentityLock {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityLock {
    /// Starts as the privileged builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: Identity::builder(),
            switched: false,
        }
    }

    /// Returns the identity currently in effect.
    #[must_use]
    pub const fn active(&self) -> &Identity {
        &self.active
    }

    /// Returns whether the switch to an unprivileged account has happened.
    #[must_use]
    pub const fn is_switched(&self) -> bool {
        self.switched
    }

    /// Makes `target` the active identity for the rest of the session.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::IdentityLocked` if a switch already happened,
    /// and `BerthError::PermissionDenied` if `target` is privileged.
    pub fn switch_to(&mut self, target: Identity) -> Result<()> {
        if self.switched {
            return Err(BerthError::IdentityLocked {
                current: self.active.name.clone(),
                requested: target.name,
            });
        }
        if target.is_privileged() {
            return Err(BerthError::PermissionDenied {
                message: format!("refusing to switch to privileged identity `{}`", target.name),
            });
        }
        tracing::info!(from = %self.active, to = %target, "identity switched");
        self.active = target;
        self.switched = true;
        Ok(())
    }
}

/// Returns whether the calling process runs with an effective uid of 0.
#[cfg(unix)]
#[must_use]
pub fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Returns whether the calling process runs with an effective uid of 0.
#[cfg(not(unix))]
#[must_use]
pub const fn running_as_root() -> bool {
    false
}

/// Confines the calling process to `root` and changes to `cwd` inside it.
///
/// Intended for a forked child right before `exec`.
///
/// # Errors
///
/// Returns the raw OS error if `chroot(2)` or `chdir(2)` fails.
#[cfg(target_os = "linux")]
pub fn enter_root(root: &Path, cwd: &Path) -> std::io::Result<()> {
    nix::unistd::chroot(root)?;
    nix::unistd::chdir(cwd)?;
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: `chroot` confinement requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn enter_root(_root: &Path, _cwd: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "Linux required for chroot confinement",
    ))
}

/// Permanently drops the calling process to `identity`.
///
/// Supplementary groups are cleared first, then the gid, then the uid; after
/// `setuid` succeeds the process cannot regain root.
///
/// # Errors
///
/// Returns the raw OS error of the first failing call.
#[cfg(target_os = "linux")]
pub fn drop_privileges(identity: &Identity) -> std::io::Result<()> {
    use nix::unistd::{Gid, Uid, setgid, setgroups, setuid};

    let gid = Gid::from_raw(identity.gid);
    setgroups(&[gid])?;
    setgid(gid)?;
    setuid(Uid::from_raw(identity.uid))?;
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: identity switching requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn drop_privileges(_identity: &Identity) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "Linux required for identity switching",
    ))
}

/// Checks that the caller can perform a full chroot + identity drop.
///
/// # Errors
///
/// Returns `BerthError::PermissionDenied` when not running as root.
pub fn require_root(operation: &str) -> Result<()> {
    if running_as_root() {
        Ok(())
    } else {
        Err(BerthError::PermissionDenied {
            message: format!("{operation} requires root; use direct isolation instead"),
        })
    }
}
