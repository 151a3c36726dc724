//! Filesystem snapshots and the diffs that become layers.
//!
//! A build step runs against the staging root; capturing the tree before
//! and after the step yields exactly the entries the step added, changed,
//! or removed, whoever wrote them (including external installers).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use berth_common::constants::WHITEOUT_PREFIX;
use berth_common::error::{BerthError, Result};
use berth_common::types::Sha256Hash;
use berth_core::access::EntryKind;

use crate::layer::is_whiteout_name;

/// Observable state of one entry in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    /// Entry kind.
    pub kind: EntryKind,
    /// Permission bits (`0o7777` mask).
    pub mode: u32,
    /// Owning uid on the host filesystem.
    pub uid: u32,
    /// Owning gid on the host filesystem.
    pub gid: u32,
    /// Content digest for regular files.
    pub digest: Option<Sha256Hash>,
    /// Target for symbolic links.
    pub link_target: Option<PathBuf>,
}

impl EntryMeta {
    /// Returns whether `other` differs in anything a layer records.
    ///
    /// Host ownership is ignored: layers carry the build identity instead.
    fn content_differs(&self, other: &Self) -> bool {
        self.kind != other.kind
            || self.mode != other.mode
            || self.digest != other.digest
            || self.link_target != other.link_target
    }
}

/// One difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Entry is new or its content or mode changed.
    Upsert {
        /// Root-relative path using `/` separators.
        path: String,
        /// State of the entry after the step.
        meta: EntryMeta,
    },
    /// Entry existed before the step and is gone after it.
    Removed {
        /// Root-relative path using `/` separators.
        path: String,
    },
}

impl Change {
    /// Returns the root-relative path this change concerns.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Upsert { path, .. } | Self::Removed { path } => path,
        }
    }
}

/// Root-relative path → entry state, ordered by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<String, EntryMeta>,
}

impl Snapshot {
    /// Captures every entry below `root` (the root itself is excluded).
    ///
    /// A missing root yields an empty snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be listed or a file cannot be read.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        if root.exists() {
            walk(root, root, &mut entries)?;
        }
        tracing::debug!(root = %root.display(), entries = entries.len(), "snapshot captured");
        Ok(Self { entries })
    }

    /// Returns the number of captured entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the snapshot holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a root-relative path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&EntryMeta> {
        self.entries.get(path)
    }

    /// Computes the changes that turn `self` into `after`, sorted by path.
    ///
    /// Removals below an already removed directory are folded into the
    /// directory's own removal.
    #[must_use]
    pub fn diff(&self, after: &Self) -> Vec<Change> {
        let mut changes = Vec::new();

        for (path, meta) in &after.entries {
            let changed = self
                .entries
                .get(path)
                .is_none_or(|before| before.content_differs(meta));
            if changed {
                changes.push(Change::Upsert {
                    path: path.clone(),
                    meta: meta.clone(),
                });
            }
        }

        let mut removed_dirs: Vec<&str> = Vec::new();
        for path in self.entries.keys() {
            if after.entries.contains_key(path) {
                continue;
            }
            if removed_dirs
                .iter()
                .any(|dir| path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/')))
            {
                continue;
            }
            removed_dirs.push(path);
            changes.push(Change::Removed { path: path.clone() });
        }

        changes.sort_by(|a, b| a.path().cmp(b.path()));
        changes
    }
}

fn walk(root: &Path, dir: &Path, entries: &mut BTreeMap<String, EntryMeta>) -> Result<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| BerthError::io(dir, e))?
        .collect::<std::io::Result<_>>()
        .map_err(|e| BerthError::io(dir, e))?;
    children.sort_by_key(std::fs::DirEntry::file_name);

    for child in children {
        let path = child.path();
        if is_whiteout_name(&child.file_name()) {
            return Err(BerthError::InvalidPath {
                path,
                reason: format!("names starting with `{WHITEOUT_PREFIX}` are reserved for deletion markers"),
            });
        }
        let meta = describe(&path)?;
        let is_dir = meta.kind == EntryKind::Directory;
        let _ = entries.insert(relative_key(root, &path)?, meta);
        if is_dir {
            walk(root, &path, entries)?;
        }
    }
    Ok(())
}

/// Describes a single path without following symlinks.
///
/// # Errors
///
/// Returns an error if the path cannot be inspected or read.
pub fn describe(path: &Path) -> Result<EntryMeta> {
    let md = std::fs::symlink_metadata(path).map_err(|e| BerthError::io(path, e))?;
    let (uid, gid, mode) = ownership(&md);
    let file_type = md.file_type();

    if file_type.is_symlink() {
        let target = std::fs::read_link(path).map_err(|e| BerthError::io(path, e))?;
        Ok(EntryMeta {
            kind: EntryKind::Symlink,
            mode: 0o777,
            uid,
            gid,
            digest: None,
            link_target: Some(target),
        })
    } else if file_type.is_dir() {
        Ok(EntryMeta {
            kind: EntryKind::Directory,
            mode,
            uid,
            gid,
            digest: None,
            link_target: None,
        })
    } else if file_type.is_file() {
        Ok(EntryMeta {
            kind: EntryKind::File,
            mode,
            uid,
            gid,
            digest: Some(crate::hash::hash_file(path)?),
            link_target: None,
        })
    } else {
        Err(BerthError::InvalidPath {
            path: path.to_path_buf(),
            reason: "special files (devices, sockets, fifos) cannot be captured in a layer".into(),
        })
    }
}

/// Converts `path` under `root` into a `/`-separated relative key.
///
/// # Errors
///
/// Returns `BerthError::InvalidPath` if `path` is not below `root` or is not UTF-8.
pub fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| BerthError::InvalidPath {
        path: path.to_path_buf(),
        reason: format!("not inside {}", root.display()),
    })?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    parts.map(|p| p.join("/")).ok_or_else(|| BerthError::InvalidPath {
        path: path.to_path_buf(),
        reason: "path is not valid UTF-8".into(),
    })
}

#[cfg(unix)]
fn ownership(md: &std::fs::Metadata) -> (u32, u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (md.uid(), md.gid(), md.mode() & 0o7777)
}

#[cfg(not(unix))]
fn ownership(md: &std::fs::Metadata) -> (u32, u32, u32) {
    let mode = if md.permissions().readonly() { 0o555 } else { 0o755 };
    (0, 0, mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_lists_nested_entries_in_path_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("app/lib")).expect("mkdir");
        std::fs::write(dir.path().join("app/main.py"), "print()").expect("write");
        std::fs::write(dir.path().join("app/lib/util.py"), "").expect("write");

        let snap = Snapshot::capture(dir.path()).expect("capture");
        let keys: Vec<&str> = snap.entries.keys().map(String::as_str).collect();
        assert_eq!(keys, ["app", "app/lib", "app/lib/util.py", "app/main.py"]);
        assert_eq!(snap.get("app").map(|m| m.kind), Some(EntryKind::Directory));
    }

    #[test]
    fn capture_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(Snapshot::capture(&dir.path().join("nope")).expect("capture").is_empty());
    }

    #[test]
    fn diff_reports_added_modified_and_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("old/deep")).expect("mkdir");
        std::fs::write(dir.path().join("old/deep/file"), "x").expect("write");
        std::fs::write(dir.path().join("keep"), "v1").expect("write");
        std::fs::write(dir.path().join("same"), "s").expect("write");
        let before = Snapshot::capture(dir.path()).expect("before");

        std::fs::remove_dir_all(dir.path().join("old")).expect("rm");
        std::fs::write(dir.path().join("keep"), "v2").expect("write");
        std::fs::write(dir.path().join("new"), "n").expect("write");
        let after = Snapshot::capture(dir.path()).expect("after");

        let changes = before.diff(&after);
        let summary: Vec<(&str, bool)> = changes
            .iter()
            .map(|c| (c.path(), matches!(c, Change::Removed { .. })))
            .collect();
        assert_eq!(summary, [("keep", false), ("new", false), ("old", true)]);
    }

    #[test]
    fn marker_names_cannot_be_captured() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("app")).expect("mkdir");
        std::fs::write(dir.path().join("app/config"), "c").expect("write");
        std::fs::write(dir.path().join("app/.wh.config"), "not a marker").expect("write");

        let err = Snapshot::capture(dir.path()).expect_err("reserved name");
        assert!(matches!(err, BerthError::InvalidPath { .. }));
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), "a").expect("write");
        let snap = Snapshot::capture(dir.path()).expect("capture");
        assert!(snap.diff(&snap.clone()).is_empty());
    }

    #[test]
    fn relative_key_uses_forward_slashes() {
        let root = Path::new("/tmp/root");
        assert_eq!(
            relative_key(root, Path::new("/tmp/root/a/b")).expect("key"),
            "a/b"
        );
        assert!(relative_key(root, Path::new("/elsewhere")).is_err());
    }
}
