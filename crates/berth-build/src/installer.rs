//! The dependency installer seam.
//!
//! The pipeline hands an installer the parsed manifest and the staging
//! root; whatever the installer writes there becomes the dependency layer.
//! Two installers ship with berth:
//!
//! - [`IndexInstaller`] resolves against a local package index laid out as
//!   `<index>/<name>/<version>/`, each version directory holding a
//!   root-relative tree to overlay onto the image.
//! - [`CommandInstaller`] runs an external command (for example a package
//!   manager) with `{manifest}`, `{rootfs}`, and `{cache}` substituted.

use std::path::{Path, PathBuf};
use std::process::Command;

use berth_common::error::{BerthError, Result};
use berth_common::types::Sha256Hash;
use berth_image::snapshot::{Change, Snapshot};
use berth_recipe::manifest::{Manifest, Requirement, Version};

/// Everything an installer may touch for one install.
#[derive(Debug, Clone, Copy)]
pub struct InstallRequest<'a> {
    /// Parsed manifest.
    pub manifest: &'a Manifest,
    /// Host path of the manifest copy inside the staging root.
    pub manifest_path: &'a Path,
    /// Staging root filesystem to install into.
    pub rootfs: &'a Path,
    /// Scratch directory for download caches; discarded after the step.
    pub cache_dir: &'a Path,
}

/// External collaborator that resolves and installs manifest dependencies.
pub trait DependencyInstaller {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Returns a string that changes whenever the installer would produce
    /// different output for the same manifest. Part of the step cache key.
    ///
    /// # Errors
    ///
    /// Returns an error if the installer's inputs cannot be inspected.
    fn fingerprint(&self) -> Result<String>;

    /// Installs every requirement into `request.rootfs`.
    ///
    /// Must either install everything or fail; an unsatisfiable requirement
    /// is reported as `BerthError::DependencyResolution`.
    ///
    /// # Errors
    ///
    /// Returns `DependencyResolution` or a collaborator failure.
    fn install(&self, request: &InstallRequest<'_>) -> Result<()>;

    /// Root-relative paths of caches the installer may leave behind; they
    /// are purged from the staging root before the layer is captured.
    fn cache_paths(&self) -> Vec<PathBuf> {
        vec![PathBuf::from("root/.cache")]
    }
}

/// Builds an installer from a `index:DIR` or `command:ARGV` specification.
///
/// # Errors
///
/// Returns `BerthError::Config` for an unknown or empty specification.
pub fn from_spec(spec: &str) -> Result<Box<dyn DependencyInstaller>> {
    if let Some(dir) = spec.strip_prefix("index:") {
        return Ok(Box::new(IndexInstaller::new(dir)));
    }
    if let Some(argv) = spec.strip_prefix("command:") {
        let argv: Vec<String> = argv.split_whitespace().map(String::from).collect();
        return Ok(Box::new(CommandInstaller::new(argv)?));
    }
    Err(BerthError::Config {
        message: format!("unknown installer `{spec}` (expected index:DIR or command:ARGV)"),
    })
}

/// Installer backed by a local directory index.
#[derive(Debug, Clone)]
pub struct IndexInstaller {
    index: PathBuf,
}

impl IndexInstaller {
    /// Creates an installer reading from `index`.
    pub fn new(index: impl Into<PathBuf>) -> Self {
        Self {
            index: index.into(),
        }
    }

    /// Returns the highest available version satisfying `requirement`.
    ///
    /// # Errors
    ///
    /// Returns an error if the package directory exists but cannot be listed.
    pub fn resolve(&self, requirement: &Requirement) -> Result<Option<(Version, PathBuf)>> {
        let package_dir = self.index.join(requirement.normalized_name());
        let entries = match std::fs::read_dir(&package_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BerthError::io(&package_dir, e)),
        };

        let mut best: Option<(Version, PathBuf)> = None;
        for entry in entries {
            let entry = entry.map_err(|e| BerthError::io(&package_dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(version) = entry.file_name().to_str().and_then(|n| Version::parse(n).ok())
            else {
                continue;
            };
            if requirement.matches(&version) && best.as_ref().is_none_or(|(b, _)| version > *b) {
                best = Some((version, entry.path()));
            }
        }
        Ok(best)
    }
}

impl DependencyInstaller for IndexInstaller {
    fn name(&self) -> &'static str {
        "index"
    }

    fn fingerprint(&self) -> Result<String> {
        let changes = Snapshot::default().diff(&Snapshot::capture(&self.index)?);
        let mut listing = String::new();
        for change in &changes {
            if let Change::Upsert { path, meta } = change {
                listing.push_str(path);
                listing.push(':');
                if let Some(digest) = &meta.digest {
                    listing.push_str(digest.as_hex());
                }
                listing.push('\n');
            }
        }
        Ok(format!(
            "index:{}",
            Sha256Hash::of_bytes(listing.as_bytes()).as_hex()
        ))
    }

    fn install(&self, request: &InstallRequest<'_>) -> Result<()> {
        let mut resolved = Vec::new();
        let mut unsatisfied = Vec::new();
        for requirement in request.manifest.requirements() {
            match self.resolve(requirement)? {
                Some((version, tree)) => {
                    tracing::info!(package = %requirement.name, %version, "resolved");
                    resolved.push(tree);
                }
                None => unsatisfied.push(requirement.to_string()),
            }
        }
        if !unsatisfied.is_empty() {
            return Err(BerthError::DependencyResolution { unsatisfied });
        }
        for tree in &resolved {
            let _ = crate::copy::copy_tree(tree, request.rootfs, &|_, _| false)?;
        }
        Ok(())
    }
}

/// Installer that delegates to an external command.
///
/// Placeholders in the argument vector are replaced per install:
/// `{manifest}` with the staged manifest, `{rootfs}` with the staging root,
/// and `{cache}` with the scratch cache directory. Cache-related
/// environment variables point at the scratch directory as well.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    argv: Vec<String>,
}

impl CommandInstaller {
    /// Creates an installer running `argv`.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::Config` if `argv` is empty.
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(BerthError::Config {
                message: "installer command is empty".into(),
            });
        }
        Ok(Self { argv })
    }

    fn expand(&self, request: &InstallRequest<'_>) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{manifest}", &request.manifest_path.to_string_lossy())
                    .replace("{rootfs}", &request.rootfs.to_string_lossy())
                    .replace("{cache}", &request.cache_dir.to_string_lossy())
            })
            .collect()
    }
}

impl DependencyInstaller for CommandInstaller {
    fn name(&self) -> &'static str {
        "command"
    }

    fn fingerprint(&self) -> Result<String> {
        Ok(format!("command:{}", self.argv.join("\u{1f}")))
    }

    fn install(&self, request: &InstallRequest<'_>) -> Result<()> {
        let argv = self.expand(request);
        tracing::info!(command = ?argv, "running installer command");
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .env("PIP_NO_CACHE_DIR", "1")
            .env("PIP_CACHE_DIR", request.cache_dir)
            .env("XDG_CACHE_HOME", request.cache_dir)
            .output()
            .map_err(|e| BerthError::Collaborator {
                collaborator: "dependency installer",
                message: format!("cannot start `{}`: {e}", argv[0]),
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::error!(status = ?output.status.code(), stderr = %stderr.trim(), "installer failed");
        Err(BerthError::DependencyResolution {
            unsatisfied: request
                .manifest
                .requirements()
                .iter()
                .map(ToString::to_string)
                .collect(),
        })
    }
}
