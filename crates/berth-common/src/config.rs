//! Global configuration model for berth.
//!
//! Values come from `<data_dir>/config.json` when present; the CLI then
//! applies flag and environment overrides on top.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BerthError, Result};
use crate::types::Isolation;

/// Root configuration for berth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BerthConfig {
    /// Base directory for layers, images, containers, and logs.
    pub data_dir: PathBuf,
    /// Isolation applied to entry processes.
    pub isolation: Isolation,
    /// Seconds to wait after SIGTERM before sending SIGKILL.
    pub stop_grace_secs: u64,
    /// Default dependency installer spec (`index:DIR` or `command:ARGV`).
    pub installer: Option<String>,
}

impl Default for BerthConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::constants::data_dir().clone(),
            isolation: Isolation::default(),
            stop_grace_secs: crate::constants::DEFAULT_STOP_GRACE_SECS,
            installer: None,
        }
    }
}

impl BerthConfig {
    /// Loads configuration for `data_dir`.
    ///
    /// Reads `<data_dir>/config.json` if it exists; otherwise returns the
    /// defaults. The returned `data_dir` is always the one passed in.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(crate::constants::CONFIG_FILE);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| BerthError::io(&path, e))?;
            tracing::debug!(path = %path.display(), "loaded config file");
            serde_json::from_str::<Self>(&content)?
        } else {
            Self::default()
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_without_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = BerthConfig::load(dir.path()).expect("load");
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.isolation, Isolation::Chroot);
        assert!(config.installer.is_none());
    }

    #[test]
    fn load_reads_partial_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("config.json"),
            r#"{ "isolation": "direct", "stop_grace_secs": 3 }"#,
        )
        .expect("write");
        let config = BerthConfig::load(dir.path()).expect("load");
        assert_eq!(config.isolation, Isolation::Direct);
        assert_eq!(config.stop_grace_secs, 3);
        assert_eq!(config.data_dir, dir.path());
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("config.json"), "{ nope").expect("write");
        assert!(BerthConfig::load(dir.path()).is_err());
    }
}
