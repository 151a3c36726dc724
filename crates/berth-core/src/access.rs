//! Access audit for unprivileged accounts.
//!
//! Files written before the identity switch stay owned by the builder, so
//! the account only reaches them through group or other permission bits.
//! The audit walks the merged image and reports every entry the account
//! could not use.

use serde::{Deserialize, Serialize};

use crate::identity::Identity;

const READ: u32 = 0o4;
const EXEC: u32 = 0o1;

/// Kind of a filesystem entry in an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link (permissions are not meaningful).
    Symlink,
}

/// Ownership and permission bits of one image entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryAccess {
    /// Absolute path inside the image.
    pub path: String,
    /// Entry kind.
    pub kind: EntryKind,
    /// Permission bits (`0o7777` mask).
    pub mode: u32,
    /// Owning uid.
    pub uid: u32,
    /// Owning gid.
    pub gid: u32,
}

impl EntryAccess {
    /// Returns the `rwx` triplet that applies to `who`.
    #[must_use]
    pub const fn bits_for(&self, who: &Identity) -> u32 {
        if who.uid == 0 {
            0o7
        } else if who.uid == self.uid {
            (self.mode >> 6) & 0o7
        } else if who.gid == self.gid {
            (self.mode >> 3) & 0o7
        } else {
            self.mode & 0o7
        }
    }

    /// Returns whether `who` can use this entry the way it is meant to be used.
    ///
    /// Directories must be listable and traversable, files readable, and
    /// files carrying any execute bit must also be executable.
    #[must_use]
    pub const fn usable_by(&self, who: &Identity) -> bool {
        let bits = self.bits_for(who);
        match self.kind {
            EntryKind::Symlink => true,
            EntryKind::Directory => bits & (READ | EXEC) == (READ | EXEC),
            EntryKind::File => {
                let wants_exec = self.mode & 0o111 != 0;
                bits & READ == READ && (!wants_exec || bits & EXEC == EXEC)
            }
        }
    }
}

/// Returns the paths `who` cannot use, in input order.
pub fn audit<'a, I>(entries: I, who: &Identity) -> Vec<String>
where
    I: IntoIterator<Item = &'a EntryAccess>,
{
    let denied: Vec<String> = entries
        .into_iter()
        .filter(|entry| !entry.usable_by(who))
        .map(|entry| entry.path.clone())
        .collect();
    tracing::debug!(account = %who, denied = denied.len(), "access audit finished");
    denied
}

/// Normalizes permission bits for content copied into an image.
///
/// Directories become `0755`; files become `0755` if any execute bit was
/// set and `0644` otherwise. Setuid, setgid, and sticky bits are cleared.
#[must_use]
pub const fn normalize_mode(kind: EntryKind, mode: u32) -> u32 {
    match kind {
        EntryKind::Directory | EntryKind::Symlink => 0o755,
        EntryKind::File if mode & 0o111 != 0 => 0o755,
        EntryKind::File => 0o644,
    }
}
