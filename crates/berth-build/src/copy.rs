//! Copying host trees into the staging root with normalized modes.
//!
//! Traversal is sorted so the resulting layer does not depend on directory
//! iteration order. Copied directories become `0755` and files `0644` or
//! `0755`, so the unprivileged account can always read what the builder wrote.

use std::path::Path;

use berth_common::error::{BerthError, Result};
use berth_core::access::{EntryKind, normalize_mode};
use berth_image::layer::is_whiteout_name;

/// Copies the contents of `src` into `dest`, merging with what is there.
///
/// `skip` receives each source path and whether it is a directory; skipped
/// directories are not descended into. Returns the number of copied entries.
///
/// # Errors
///
/// Returns an error if an entry cannot be read or written, or is a special file.
pub fn copy_tree(src: &Path, dest: &Path, skip: &dyn Fn(&Path, bool) -> bool) -> Result<usize> {
    ensure_dir(dest)?;
    let mut children: Vec<_> = std::fs::read_dir(src)
        .map_err(|e| BerthError::io(src, e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()
        .map_err(|e| BerthError::io(src, e))?;
    children.sort();

    let mut copied = 0;
    for child in children {
        let md = std::fs::symlink_metadata(&child).map_err(|e| BerthError::io(&child, e))?;
        if skip(&child, md.is_dir()) {
            tracing::trace!(path = %child.display(), "skipped by filter");
            continue;
        }
        let Some(name) = child.file_name() else {
            continue;
        };
        reject_marker_name(&child)?;
        let target = dest.join(name);
        if md.is_dir() {
            copied += 1 + copy_tree(&child, &target, skip)?;
        } else {
            copy_entry(&child, &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Copies one file or symlink from `src` to `dest`, replacing what is there.
///
/// # Errors
///
/// Returns `BerthError::InvalidPath` for special files and names reserved
/// for deletion markers, and I/O errors otherwise.
pub fn copy_entry(src: &Path, dest: &Path) -> Result<()> {
    reject_marker_name(dest)?;
    let md = std::fs::symlink_metadata(src).map_err(|e| BerthError::io(src, e))?;
    if let Some(parent) = dest.parent() {
        ensure_dir(parent)?;
    }
    remove_existing(dest)?;

    if md.file_type().is_symlink() {
        let target = std::fs::read_link(src).map_err(|e| BerthError::io(src, e))?;
        return symlink(&target, dest);
    }
    if !md.is_file() {
        return Err(BerthError::InvalidPath {
            path: src.to_path_buf(),
            reason: "only regular files, directories, and symlinks can be copied".into(),
        });
    }
    let _ = std::fs::copy(src, dest).map_err(|e| BerthError::io(dest, e))?;
    set_mode(dest, normalize_mode(EntryKind::File, mode_of(&md)))
}

/// Creates `dir` (and missing parents) with mode `0755`.
///
/// A file or symlink in the way is replaced by a directory. Parents are
/// never followed through symlinks; check them with
/// [`berth_image::layer::reject_symlinked_parents`] first.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    match std::fs::symlink_metadata(dir) {
        Ok(md) if md.is_dir() => return Ok(()),
        Ok(_) => remove_existing(dir)?,
        Err(_) => {}
    }
    if let Some(parent) = dir.parent() {
        let real_dir = std::fs::symlink_metadata(parent).is_ok_and(|md| md.is_dir());
        if !parent.as_os_str().is_empty() && !real_dir {
            ensure_dir(parent)?;
        }
    }
    std::fs::create_dir(dir).map_err(|e| BerthError::io(dir, e))?;
    set_mode(dir, normalize_mode(EntryKind::Directory, 0))
}

fn reject_marker_name(path: &Path) -> Result<()> {
    if path.file_name().is_some_and(is_whiteout_name) {
        return Err(BerthError::InvalidPath {
            path: path.to_path_buf(),
            reason: "names starting with `.wh.` are reserved for deletion markers".into(),
        });
    }
    Ok(())
}

/// Removes whatever is at `path` without following a symlink there.
pub(crate) fn remove_existing(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => std::fs::remove_dir_all(path).map_err(|e| BerthError::io(path, e)),
        Ok(_) => std::fs::remove_file(path).map_err(|e| BerthError::io(path, e)),
        Err(_) => Ok(()),
    }
}

#[cfg(unix)]
fn mode_of(md: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(_md: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| BerthError::io(path, e))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, dest).map_err(|e| BerthError::io(dest, e))
}

#[cfg(not(unix))]
fn symlink(_target: &Path, dest: &Path) -> Result<()> {
    Err(BerthError::InvalidPath {
        path: dest.to_path_buf(),
        reason: "symlinks are not supported on this platform".into(),
    })
}
