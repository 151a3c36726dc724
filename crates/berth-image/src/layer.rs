//! Filesystem layer management.
//!
//! Each image is composed of ordered layers. A layer is a tar stream of the
//! entries one build step changed, content-addressed by its SHA-256 digest.
//! Streams are deterministic: entries are sorted by path, timestamps are
//! zero, and ownership is the numeric identity of the step that wrote them.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use berth_common::constants::WHITEOUT_PREFIX;
use berth_common::error::{BerthError, Result};
use berth_common::types::Sha256Hash;
use berth_core::access::{EntryAccess, EntryKind};
use serde::{Deserialize, Serialize};

use crate::snapshot::{Change, EntryMeta};

/// A single committed filesystem layer in an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// Content-addressed hash of the layer tar.
    pub digest: Sha256Hash,
    /// Size of the layer tar in bytes.
    pub size_bytes: u64,
    /// Instruction that produced the layer.
    pub created_by: String,
}

/// Numeric owner recorded for a layer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    /// Owning uid.
    pub uid: u32,
    /// Owning gid.
    pub gid: u32,
}

/// Writes the tar stream for `changes` read from `root` into `out`.
///
/// `owner` decides the recorded owner of every upserted entry. Removals
/// become empty `.wh.<name>` marker entries owned by root.
///
/// # Errors
///
/// Returns an error if an entry cannot be read or the stream cannot be written.
pub fn write_layer<W, F>(root: &Path, changes: &[Change], owner: F, out: W) -> Result<W>
where
    W: Write,
    F: Fn(&str, &EntryMeta) -> Owner,
{
    let mut builder = tar::Builder::new(out);
    builder.mode(tar::HeaderMode::Deterministic);
    let tar_err = |path: &str, e: std::io::Error| BerthError::io(root.join(path), e);

    for change in changes {
        match change {
            Change::Upsert { path, meta } => {
                let mut header = base_header(meta.mode, owner(path, meta));
                match meta.kind {
                    EntryKind::Directory => {
                        header.set_entry_type(tar::EntryType::Directory);
                        header.set_size(0);
                        builder
                            .append_data(&mut header, path, std::io::empty())
                            .map_err(|e| tar_err(path, e))?;
                    }
                    EntryKind::Symlink => {
                        header.set_entry_type(tar::EntryType::Symlink);
                        header.set_size(0);
                        let target = meta.link_target.clone().unwrap_or_default();
                        builder
                            .append_link(&mut header, path, target)
                            .map_err(|e| tar_err(path, e))?;
                    }
                    EntryKind::File => {
                        let source = root.join(path);
                        let file = std::fs::File::open(&source)
                            .map_err(|e| BerthError::io(&source, e))?;
                        let len = file
                            .metadata()
                            .map_err(|e| BerthError::io(&source, e))?
                            .len();
                        header.set_entry_type(tar::EntryType::Regular);
                        header.set_size(len);
                        builder
                            .append_data(&mut header, path, file)
                            .map_err(|e| tar_err(path, e))?;
                    }
                }
            }
            Change::Removed { path } => {
                let mut header = base_header(0o644, Owner { uid: 0, gid: 0 });
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(0);
                builder
                    .append_data(&mut header, whiteout_path(path), std::io::empty())
                    .map_err(|e| tar_err(path, e))?;
            }
        }
    }

    builder.into_inner().map_err(|e| BerthError::io(root, e))
}

fn base_header(mode: u32, owner: Owner) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_mode(mode);
    header.set_uid(u64::from(owner.uid));
    header.set_gid(u64::from(owner.gid));
    header.set_mtime(0);
    header
}

/// Returns the marker path recording the deletion of `path`.
#[must_use]
pub fn whiteout_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, name)) => format!("{parent}/{WHITEOUT_PREFIX}{name}"),
        None => format!("{WHITEOUT_PREFIX}{path}"),
    }
}

/// Returns whether `name` is reserved for deletion markers.
#[must_use]
pub fn is_whiteout_name(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with(WHITEOUT_PREFIX))
}

/// Rejects `path` if one of its existing parents below `root` is a symlink.
///
/// Parents are checked from the top down, so every lookup only crosses real
/// directories and a write to the returned location stays inside `root`.
/// The final component is not checked; callers replace it.
///
/// # Errors
///
/// Returns `BerthError::InvalidPath` naming the symlinked parent.
pub fn reject_symlinked_parents(root: &Path, path: &Path) -> Result<()> {
    let mut current = root.to_path_buf();
    let mut components = path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(md) if md.file_type().is_symlink() => {
                return Err(BerthError::InvalidPath {
                    path: path.to_path_buf(),
                    reason: format!(
                        "parent `{}` is a symlink",
                        current.strip_prefix(root).unwrap_or(&current).display()
                    ),
                });
            }
            Ok(md) if md.is_dir() => {}
            _ => break,
        }
    }
    Ok(())
}

/// Returns the path a whiteout marker deletes, or `None` for ordinary entries.
fn whiteout_target(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let target = name.strip_prefix(WHITEOUT_PREFIX)?;
    Some(path.with_file_name(target))
}

/// Applies a layer tar on top of `root`.
///
/// Whiteouts delete their targets; other entries replace whatever is at
/// their path. Ownership is only restored when `preserve_ownership` is set
/// (requires root).
///
/// # Errors
///
/// Returns an error if the stream is malformed, contains paths escaping
/// `root`, or an entry cannot be written.
pub fn apply_layer(reader: impl Read, root: &Path, preserve_ownership: bool) -> Result<usize> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(preserve_ownership);
    archive.set_overwrite(true);

    let mut applied = 0;
    for entry in archive.entries().map_err(|e| BerthError::io(root, e))? {
        let mut entry = entry.map_err(|e| BerthError::io(root, e))?;
        let rel = entry
            .path()
            .map_err(|e| BerthError::io(root, e))?
            .into_owned();
        let rel = confine(&rel)?;

        if let Some(target) = whiteout_target(&rel) {
            reject_symlinked_parents(root, &target)?;
            remove_any(&root.join(target))?;
            applied += 1;
            continue;
        }

        let dest = root.join(&rel);
        let is_dir = entry.header().entry_type().is_dir();
        // Below a symlinked directory `unpack_in` checks containment itself.
        if reject_symlinked_parents(root, &rel).is_ok() {
            clear_conflict(&dest, is_dir)?;
        }
        let _ = entry
            .unpack_in(root)
            .map_err(|e| BerthError::io(&dest, e))?;
        applied += 1;
    }
    tracing::debug!(root = %root.display(), entries = applied, "layer applied");
    Ok(applied)
}

/// Rejects absolute paths and `..` components inside a layer.
fn confine(rel: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(BerthError::InvalidPath {
                    path: rel.to_path_buf(),
                    reason: "layer entry escapes the root".into(),
                });
            }
        }
    }
    Ok(clean)
}

fn remove_any(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => {
            std::fs::remove_dir_all(path).map_err(|e| BerthError::io(path, e))
        }
        Ok(_) => std::fs::remove_file(path).map_err(|e| BerthError::io(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BerthError::io(path, e)),
    }
}

/// Removes an existing entry whose kind conflicts with the incoming one.
fn clear_conflict(dest: &Path, incoming_is_dir: bool) -> Result<()> {
    match std::fs::symlink_metadata(dest) {
        Ok(md) if md.is_dir() && !incoming_is_dir => remove_any(dest),
        Ok(md) if !md.is_dir() && incoming_is_dir => remove_any(dest),
        Ok(md) if md.file_type().is_symlink() => remove_any(dest),
        _ => Ok(()),
    }
}

/// A header-level view of one layer entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerEntry {
    /// A regular entry with its ownership and mode.
    Present(EntryAccess),
    /// A deletion marker for the given absolute image path.
    Whiteout(String),
}

/// Reads entry headers of a layer tar without extracting it.
///
/// # Errors
///
/// Returns an error if the stream is malformed.
pub fn read_entries(reader: impl Read) -> Result<Vec<LayerEntry>> {
    let io_err = |e| BerthError::io("<layer>", e);
    let mut archive = tar::Archive::new(reader);
    let mut out = Vec::new();
    for entry in archive.entries().map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let header = entry.header();
        let rel = confine(&entry.path().map_err(io_err)?)?;
        let image_path = format!("/{}", rel.display());

        if let Some(target) = whiteout_target(&rel) {
            out.push(LayerEntry::Whiteout(format!("/{}", target.display())));
            continue;
        }

        let kind = match header.entry_type() {
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Symlink | tar::EntryType::Link => EntryKind::Symlink,
            _ => EntryKind::File,
        };
        out.push(LayerEntry::Present(EntryAccess {
            path: image_path,
            kind,
            mode: header.mode().map_err(io_err)? & 0o7777,
            uid: u32::try_from(header.uid().map_err(io_err)?).unwrap_or(u32::MAX),
            gid: u32::try_from(header.gid().map_err(io_err)?).unwrap_or(u32::MAX),
        }));
    }
    Ok(out)
}

/// Extracts a tar archive to the target directory.
///
/// Supports both plain `.tar` and gzip-compressed `.tar.gz` / `.tgz` archives.
///
/// # Errors
///
/// Returns an error if the archive cannot be opened or unpacked.
pub fn extract_archive(archive_path: &Path, target: &Path) -> Result<()> {
    tracing::info!(
        archive = %archive_path.display(),
        target = %target.display(),
        "extracting archive"
    );

    std::fs::create_dir_all(target).map_err(|e| BerthError::io(target, e))?;
    let reader = open_archive(archive_path)?;
    let mut archive = tar::Archive::new(reader);
    archive
        .unpack(target)
        .map_err(|e| BerthError::io(target, e))
}

/// Opens an archive for reading, transparently decompressing gzip.
///
/// # Errors
///
/// Returns an error if the file cannot be opened.
pub fn open_archive(archive_path: &Path) -> Result<Box<dyn Read>> {
    let file = std::fs::File::open(archive_path).map_err(|e| BerthError::io(archive_path, e))?;
    if is_gzip_archive(archive_path) {
        Ok(Box::new(flate2::read::GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Determines whether the archive is gzip-compressed based on extension.
fn is_gzip_archive(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz"))
}
