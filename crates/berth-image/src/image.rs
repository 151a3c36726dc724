//! Image configs: the ordered layers plus launch metadata.
//!
//! The image id is derived from the serialized config alone. Configs carry
//! no timestamps, so rebuilding identical inputs reproduces the same id.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};
use berth_common::types::{EntryCommand, ImageId, Sha256Hash};
use berth_core::access::EntryAccess;
use serde::{Deserialize, Serialize};

use crate::layer::{LayerDescriptor, LayerEntry};
use crate::storage::StorageBackend;

/// Persisted description of a built image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Base reference the image was built from.
    pub base: String,
    /// Layers, bottom to top.
    pub layers: Vec<LayerDescriptor>,
    /// Working directory of the entry process.
    pub working_dir: PathBuf,
    /// Foreground process of every container started from this image.
    pub entry_command: EntryCommand,
    /// Login name the entry process runs as.
    pub user: String,
    /// Environment passed to the entry process, in declaration order.
    pub env: Vec<(String, String)>,
}

impl ImageConfig {
    /// Computes the content-derived id of this config.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized.
    pub fn id(&self) -> Result<ImageId> {
        let canonical = serde_json::to_vec(self)?;
        Ok(ImageId::new(Sha256Hash::of_bytes(&canonical).as_hex()))
    }

    /// Returns the summed size of all layers.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.layers.iter().map(|l| l.size_bytes).sum()
    }

    /// Returns the value of an environment variable, last declaration wins.
    #[must_use]
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Applies every layer of `layers` to `root`, bottom to top.
///
/// # Errors
///
/// Returns an error if a layer is missing, corrupted, or cannot be applied.
pub fn assemble_rootfs(
    storage: &StorageBackend,
    layers: &[LayerDescriptor],
    root: &Path,
    preserve_ownership: bool,
) -> Result<()> {
    std::fs::create_dir_all(root).map_err(|e| BerthError::io(root, e))?;
    for layer in layers {
        let file = storage.open_layer(&layer.digest)?;
        let _ = crate::layer::apply_layer(file, root, preserve_ownership)?;
    }
    tracing::info!(root = %root.display(), layers = layers.len(), "root filesystem assembled");
    Ok(())
}

/// Computes the effective entries of the merged image from layer headers.
///
/// Later layers replace earlier entries at the same path; whiteouts drop the
/// path and everything below it. The result is ordered by path.
///
/// # Errors
///
/// Returns an error if a layer is missing or malformed.
pub fn merged_entries(
    storage: &StorageBackend,
    layers: &[LayerDescriptor],
) -> Result<Vec<EntryAccess>> {
    let mut merged: BTreeMap<String, EntryAccess> = BTreeMap::new();
    for layer in layers {
        let file = storage.open_layer(&layer.digest)?;
        for entry in crate::layer::read_entries(file)? {
            match entry {
                LayerEntry::Present(access) => {
                    let _ = merged.insert(access.path.clone(), access);
                }
                LayerEntry::Whiteout(path) => {
                    let prefix = format!("{path}/");
                    merged.retain(|p, _| p != &path && !p.starts_with(&prefix));
                }
            }
        }
    }
    Ok(merged.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(layer_bytes: &[u8]) -> ImageConfig {
        ImageConfig {
            base: "scratch".into(),
            layers: vec![LayerDescriptor {
                digest: Sha256Hash::of_bytes(layer_bytes),
                size_bytes: layer_bytes.len() as u64,
                created_by: "WORKDIR /app".into(),
            }],
            working_dir: PathBuf::from("/app"),
            entry_command: EntryCommand::new(["python", "main.py"]).expect("argv"),
            user: "botuser".into(),
            env: vec![("MODE".into(), "a".into()), ("MODE".into(), "b".into())],
        }
    }

    #[test]
    fn identical_configs_share_an_id() {
        assert_eq!(
            config(b"x").id().expect("id"),
            config(b"x").id().expect("id")
        );
        assert_ne!(
            config(b"x").id().expect("id"),
            config(b"y").id().expect("id")
        );
    }

    #[test]
    fn env_var_last_declaration_wins() {
        assert_eq!(config(b"x").env_var("MODE"), Some("b"));
        assert_eq!(config(b"x").env_var("MISSING"), None);
    }

    #[test]
    fn size_sums_layers() {
        assert_eq!(config(b"abcd").size_bytes(), 4);
    }

    #[test]
    fn config_survives_json_roundtrip() {
        let original = config(b"x");
        let json = serde_json::to_string(&original).expect("serialize");
        let back: ImageConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, original);
    }
}
