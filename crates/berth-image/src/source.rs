//! Base image sources.
//!
//! Supports `scratch` (empty root), `file://` (local directory) and
//! `tar://` (plain or gzip archive). Local-only: the base is an opaque
//! filesystem root handed to the build, imported as the bottom layer.

use std::path::PathBuf;

use berth_common::constants::SCRATCH_BASE;
use berth_common::error::{BerthError, Result};

use crate::layer::{LayerDescriptor, Owner};
use crate::snapshot::Snapshot;
use crate::storage::StorageBackend;

/// Supported base source protocols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseSource {
    /// Empty root filesystem.
    Scratch,
    /// Local directory (`file:///path/to/rootfs`).
    Directory(PathBuf),
    /// Local tar archive (`tar:///path/to/rootfs.tar[.gz]`).
    Archive(PathBuf),
}

/// Resolves a base reference into a `BaseSource`.
///
/// # Errors
///
/// Returns `InvalidPath` if a referenced path does not exist and `Config`
/// if the scheme is unsupported.
pub fn resolve_base(uri: &str) -> Result<BaseSource> {
    if uri == SCRATCH_BASE {
        return Ok(BaseSource::Scratch);
    }
    let (path_str, is_dir) = if let Some(p) = uri.strip_prefix("file://") {
        (p, true)
    } else if let Some(p) = uri.strip_prefix("tar://") {
        (p, false)
    } else {
        return Err(BerthError::Config {
            message: format!("unsupported base reference: {uri} (expected scratch, file:// or tar://)"),
        });
    };

    let path = PathBuf::from(path_str);
    let ok = if is_dir { path.is_dir() } else { path.is_file() };
    if !ok {
        return Err(BerthError::InvalidPath {
            path,
            reason: if is_dir {
                "base directory does not exist".into()
            } else {
                "base archive does not exist".into()
            },
        });
    }
    tracing::info!(path = %path.display(), "resolved base source");
    Ok(if is_dir {
        BaseSource::Directory(path)
    } else {
        BaseSource::Archive(path)
    })
}

/// Imports a base source into the store as a single layer.
///
/// Directories keep the ownership found on disk; archives are stored as
/// their decompressed tar stream. `scratch` imports nothing.
///
/// # Errors
///
/// Returns an error if the source cannot be read or the layer cannot be committed.
pub fn import_base(storage: &StorageBackend, source: &BaseSource) -> Result<Option<LayerDescriptor>> {
    let layer = match source {
        BaseSource::Scratch => return Ok(None),
        BaseSource::Directory(path) => {
            let created_by = format!("FROM file://{}", path.display());
            let changes = Snapshot::default().diff(&Snapshot::capture(path)?);
            storage.commit_layer(&created_by, |out| {
                let _ = crate::layer::write_layer(
                    path,
                    &changes,
                    |_, meta| Owner {
                        uid: meta.uid,
                        gid: meta.gid,
                    },
                    out,
                )?;
                Ok(())
            })?
        }
        BaseSource::Archive(path) => {
            let created_by = format!("FROM tar://{}", path.display());
            let mut reader = crate::layer::open_archive(path)?;
            storage.commit_layer(&created_by, |out| {
                let _ = std::io::copy(&mut reader, out).map_err(|e| BerthError::io(path, e))?;
                Ok(())
            })?
        }
    };
    tracing::info!(digest = %layer.digest, "base imported");
    Ok(Some(layer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_scratch() {
        assert_eq!(resolve_base("scratch").expect("scratch"), BaseSource::Scratch);
    }

    #[test]
    fn resolve_file_source_existing_dir_returns_directory() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let uri = format!("file://{}", dir.path().display());
        let source = resolve_base(&uri).expect("resolve failed");
        assert!(matches!(source, BaseSource::Directory(_)));
    }

    #[test]
    fn resolve_tar_source_existing_file_returns_archive() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let tar_path = dir.path().join("base.tar");
        std::fs::write(&tar_path, b"fake tar").expect("failed to write");
        let uri = format!("tar://{}", tar_path.display());
        assert!(matches!(
            resolve_base(&uri).expect("resolve failed"),
            BaseSource::Archive(_)
        ));
    }

    #[test]
    fn resolve_unknown_scheme_returns_error() {
        assert!(matches!(
            resolve_base("https://example.com/image.tar"),
            Err(BerthError::Config { .. })
        ));
    }

    #[test]
    fn resolve_missing_paths_return_invalid_path() {
        assert!(matches!(
            resolve_base("file:///nonexistent/path"),
            Err(BerthError::InvalidPath { .. })
        ));
        assert!(matches!(
            resolve_base("tar:///nonexistent/archive.tar"),
            Err(BerthError::InvalidPath { .. })
        ));
    }

    #[test]
    fn import_directory_base_commits_one_layer() {
        let data = tempfile::tempdir().expect("tempdir");
        let base = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(base.path().join("etc")).expect("mkdir");
        std::fs::write(base.path().join("etc/passwd"), "root:x:0:0:root:/root:/bin/sh\n")
            .expect("write");

        let storage = StorageBackend::open(data.path()).expect("open");
        let layer = import_base(&storage, &BaseSource::Directory(base.path().to_path_buf()))
            .expect("import")
            .expect("layer");
        assert!(storage.has_layer(&layer.digest));
        assert!(import_base(&storage, &BaseSource::Scratch).expect("scratch").is_none());
    }
}
