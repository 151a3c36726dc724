//! Local storage backend for layers, step-cache entries, and image configs.
//!
//! On-disk layout under the data directory:
//!
//! ```text
//! layers/<hex>.tar     committed layer streams
//! cache/<key-hex>      step cache entries (JSON)
//! images/<id>.json     image configs
//! tmp/                 in-progress layer writes
//! ```
//!
//! Every write lands in `tmp/` first and is renamed into place, so a
//! crashed or failed step never leaves a partial layer behind.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};
use berth_common::types::{ImageId, Sha256Hash};
use serde::{Deserialize, Serialize};

use crate::hash::HashingWriter;
use crate::image::ImageConfig;
use crate::layer::LayerDescriptor;

/// Step-cache record: which layer a previously executed step produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Layer committed by the cached step.
    pub layer: LayerDescriptor,
}

/// Manages local storage of images and layers.
#[derive(Debug, Clone)]
pub struct StorageBackend {
    /// Root directory for all stored data.
    root: PathBuf,
}

impl StorageBackend {
    /// Opens or initializes the storage backend at the given root.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or accessed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["layers", "cache", "images", "tmp"] {
            let dir = root.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| BerthError::io(&dir, e))?;
        }
        tracing::info!(path = %root.display(), "opened storage backend");
        Ok(Self { root })
    }

    /// Returns the root storage path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path of a layer stream given its digest.
    #[must_use]
    pub fn layer_path(&self, digest: &Sha256Hash) -> PathBuf {
        self.root
            .join("layers")
            .join(format!("{}.tar", digest.as_hex()))
    }

    /// Checks whether a layer exists in the local store.
    #[must_use]
    pub fn has_layer(&self, digest: &Sha256Hash) -> bool {
        self.layer_path(digest).exists()
    }

    /// Returns the digests of every stored layer, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer directory cannot be listed.
    pub fn list_layers(&self) -> Result<Vec<Sha256Hash>> {
        let dir = self.root.join("layers");
        let mut digests = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| BerthError::io(&dir, e))? {
            let entry = entry.map_err(|e| BerthError::io(&dir, e))?;
            let name = entry.file_name();
            let Some(hex) = name.to_str().and_then(|n| n.strip_suffix(".tar")) else {
                continue;
            };
            if let Ok(digest) = Sha256Hash::from_hex(hex) {
                digests.push(digest);
            }
        }
        digests.sort();
        Ok(digests)
    }

    /// Writes a layer through `produce` and commits it under its digest.
    ///
    /// The stream is hashed while it is written; the file is only renamed
    /// into `layers/` after `produce` succeeds. If a layer with the same
    /// digest already exists, the new copy is discarded.
    ///
    /// # Errors
    ///
    /// Returns the error from `produce`, or an I/O error from the store.
    pub fn commit_layer<F>(&self, created_by: &str, produce: F) -> Result<LayerDescriptor>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let tmp_dir = self.root.join("tmp");
        let tmp = tempfile::NamedTempFile::new_in(&tmp_dir).map_err(|e| BerthError::io(&tmp_dir, e))?;
        let tmp_path = tmp.path().to_path_buf();

        let mut writer = HashingWriter::new(BufWriter::new(tmp));
        produce(&mut writer)?;
        let (buffered, digest, size_bytes) = writer.finish();
        let tmp = buffered
            .into_inner()
            .map_err(|e| BerthError::io(&tmp_path, e.into_error()))?;

        let dest = self.layer_path(&digest);
        if dest.exists() {
            tracing::debug!(digest = %digest, "layer already stored");
        } else {
            let _ = tmp
                .persist(&dest)
                .map_err(|e| BerthError::io(&dest, e.error))?;
            tracing::info!(digest = %digest, size = size_bytes, created_by, "layer committed");
        }

        Ok(LayerDescriptor {
            digest,
            size_bytes,
            created_by: created_by.to_string(),
        })
    }

    /// Opens a stored layer for reading after verifying its digest.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the layer is missing and `HashMismatch` if the
    /// stored bytes no longer match the digest.
    pub fn open_layer(&self, digest: &Sha256Hash) -> Result<std::fs::File> {
        let path = self.layer_path(digest);
        if !path.exists() {
            return Err(BerthError::NotFound {
                kind: "layer",
                id: digest.to_string(),
            });
        }
        crate::hash::validate_hash(&path, digest)?;
        std::fs::File::open(&path).map_err(|e| BerthError::io(&path, e))
    }

    /// Looks up a step-cache entry.
    ///
    /// Entries whose layer is no longer stored are treated as misses.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing entry cannot be read or parsed.
    pub fn cache_lookup(&self, key: &Sha256Hash) -> Result<Option<CacheEntry>> {
        let path = self.cache_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|e| BerthError::io(&path, e))?;
        let entry: CacheEntry = serde_json::from_str(&content)?;
        if !self.has_layer(&entry.layer.digest) {
            tracing::warn!(key = %key, layer = %entry.layer.digest, "cache entry points at missing layer");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Records a step-cache entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub fn cache_store(&self, key: &Sha256Hash, entry: &CacheEntry) -> Result<()> {
        let json = serde_json::to_vec_pretty(entry)?;
        self.write_atomic(&self.cache_path(key), &json)
    }

    fn cache_path(&self, key: &Sha256Hash) -> PathBuf {
        self.root.join("cache").join(key.as_hex())
    }

    /// Returns the path of an image config.
    #[must_use]
    pub fn image_path(&self, id: &ImageId) -> PathBuf {
        self.root.join("images").join(format!("{id}.json"))
    }

    /// Persists an image config under its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written.
    pub fn save_image(&self, id: &ImageId, config: &ImageConfig) -> Result<()> {
        let json = serde_json::to_vec_pretty(config)?;
        self.write_atomic(&self.image_path(id), &json)
    }

    /// Loads an image config by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no config exists for `id`.
    pub fn load_image(&self, id: &ImageId) -> Result<ImageConfig> {
        let path = self.image_path(id);
        if !path.exists() {
            return Err(BerthError::NotFound {
                kind: "image",
                id: id.to_string(),
            });
        }
        let content = std::fs::read_to_string(&path).map_err(|e| BerthError::io(&path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Removes an image config. Layers are left in place for other images.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove_image(&self, id: &ImageId) -> Result<()> {
        let path = self.image_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BerthError::io(&path, e)),
        }
    }

    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<()> {
        let tmp_dir = self.root.join("tmp");
        let mut tmp =
            tempfile::NamedTempFile::new_in(&tmp_dir).map_err(|e| BerthError::io(&tmp_dir, e))?;
        tmp.write_all(bytes).map_err(|e| BerthError::io(tmp.path(), e))?;
        let _ = tmp.persist(dest).map_err(|e| BerthError::io(dest, e.error))?;
        Ok(())
    }
}
