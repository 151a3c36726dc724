//! Local image catalog management.
//!
//! Maintains an index of built images, their tags, and layer compositions.
//! Timestamps live only here, never in the image config.

use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};
use berth_common::types::{ImageId, Sha256Hash};
use serde::{Deserialize, Serialize};

/// Entry in the local image catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Content-derived identifier of the image.
    pub id: ImageId,
    /// Human-readable tag.
    pub tag: String,
    /// Ordered list of layer digests (bottom to top).
    pub layers: Vec<Sha256Hash>,
    /// Total size in bytes.
    pub size_bytes: u64,
    /// Registration timestamp (RFC 3339).
    pub created_at: String,
}

/// Image catalog backed by a JSON file.
#[derive(Debug)]
pub struct ImageCatalog {
    catalog_path: PathBuf,
}

impl ImageCatalog {
    /// Opens or creates an image catalog at the given data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog directory cannot be created.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let catalog_path = data_dir.join("images").join("catalog.json");
        if let Some(parent) = catalog_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BerthError::io(parent, e))?;
        }
        Ok(Self { catalog_path })
    }

    /// Lists all images in the catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog file cannot be read or parsed.
    pub fn list(&self) -> Result<Vec<ImageEntry>> {
        if !self.catalog_path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.catalog_path)
            .map_err(|e| BerthError::io(&self.catalog_path, e))?;
        let entries: Vec<ImageEntry> = serde_json::from_str(&content)?;
        Ok(entries)
    }

    /// Registers an image, moving its tag away from any previous holder.
    ///
    /// Untagged leftovers are kept so containers referencing them by id
    /// still resolve.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read or written.
    pub fn register(&self, entry: ImageEntry) -> Result<()> {
        let mut entries = self.list()?;
        entries.retain(|e| e.id != entry.id);
        for existing in &mut entries {
            if existing.tag == entry.tag {
                tracing::info!(tag = %entry.tag, previous = %existing.id.short(), "tag moved");
                existing.tag = String::from("<none>");
            }
        }
        tracing::info!(id = %entry.id.short(), tag = %entry.tag, "image registered");
        entries.push(entry);
        self.write_entries(&entries)
    }

    /// Resolves a tag, a full id, or a unique id prefix to a catalog entry.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing matches and `Config` if an id prefix is
    /// ambiguous.
    pub fn resolve(&self, reference: &str) -> Result<ImageEntry> {
        let entries = self.list()?;
        if let Some(entry) = entries.iter().find(|e| e.tag == reference) {
            return Ok(entry.clone());
        }
        let matches: Vec<&ImageEntry> = entries
            .iter()
            .filter(|e| e.id.as_str().starts_with(reference))
            .collect();
        match matches.as_slice() {
            [single] => Ok((*single).clone()),
            [] => Err(BerthError::NotFound {
                kind: "image",
                id: reference.to_string(),
            }),
            _ => Err(BerthError::Config {
                message: format!("image reference `{reference}` is ambiguous"),
            }),
        }
    }

    /// Removes an image by ID.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::NotFound` if no image with the given ID exists.
    pub fn remove(&self, id: &ImageId) -> Result<()> {
        let mut entries = self.list()?;
        let before = entries.len();
        entries.retain(|e| e.id.as_str() != id.as_str());
        if entries.len() == before {
            return Err(BerthError::NotFound {
                kind: "image",
                id: id.to_string(),
            });
        }
        self.write_entries(&entries)
    }

    fn write_entries(&self, entries: &[ImageEntry]) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.catalog_path, json)
            .map_err(|e| BerthError::io(&self.catalog_path, e))?;
        Ok(())
    }
}
