//! The build context threaded through every pipeline step.
//!
//! Holds the staging root, the active identity, the working directory, the
//! committed layers, and the step-cache chain. Nothing about a build lives
//! outside this object.

use std::path::{Path, PathBuf};

use berth_common::constants::MAX_IMAGE_LAYERS;
use berth_common::error::{BerthError, Result};
use berth_common::types::{EntryCommand, Sha256Hash};
use berth_core::account::Account;
use berth_core::identity::{Identity, IdentityLock, running_as_root};
use berth_image::layer::{LayerDescriptor, Owner};
use berth_image::snapshot::Snapshot;
use berth_image::source;
use berth_image::storage::{CacheEntry, StorageBackend};

use crate::cache::step_key;
use crate::log::{BuildLog, StepOutcome};

/// Progress of a build through the mandatory step order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Base imported, nothing else done.
    Started,
    /// Working directory set.
    WorkingDirectory,
    /// Manifest staged for the dependency layer.
    ManifestStaged,
    /// Dependencies installed.
    DependenciesInstalled,
    /// At least one source tree copied.
    SourceCopied,
    /// Unprivileged account created.
    AccountCreated,
    /// Build identity switched to the account.
    IdentitySwitched,
    /// Entry command recorded.
    EntryCommandSet,
}

/// Mutable state of one image build.
#[derive(Debug)]
pub struct BuildContext {
    pub(crate) storage: StorageBackend,
    pub(crate) context_dir: PathBuf,
    pub(crate) staging: tempfile::TempDir,
    pub(crate) identity: IdentityLock,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) base: String,
    pub(crate) base_layers: usize,
    pub(crate) layers: Vec<LayerDescriptor>,
    pub(crate) chain: Option<Sha256Hash>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) entry_command: Option<EntryCommand>,
    pub(crate) account: Option<Account>,
    pub(crate) stage: Stage,
    pub(crate) poisoned: bool,
    pub(crate) use_cache: bool,
    pub(crate) log: BuildLog,
}

impl BuildContext {
    /// Opens a build over `context_dir` on top of the base `base_ref`.
    ///
    /// The base is imported as the bottom layer and applied to a fresh
    /// staging root under the store's `tmp/` directory.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` if the build context is not a directory, or an
    /// error if the base cannot be resolved or imported.
    pub fn new(storage: StorageBackend, context_dir: &Path, base_ref: &str) -> Result<Self> {
        let context_dir = std::fs::canonicalize(context_dir).map_err(|e| BerthError::InvalidPath {
            path: context_dir.to_path_buf(),
            reason: format!("build context is not accessible: {e}"),
        })?;
        if !context_dir.is_dir() {
            return Err(BerthError::InvalidPath {
                path: context_dir,
                reason: "build context is not a directory".into(),
            });
        }

        let tmp_dir = storage.root().join("tmp");
        let staging = tempfile::Builder::new()
            .prefix("staging-")
            .tempdir_in(&tmp_dir)
            .map_err(|e| BerthError::io(&tmp_dir, e))?;

        let base = source::resolve_base(base_ref)?;
        let mut layers = Vec::new();
        let mut chain = None;
        if let Some(layer) = source::import_base(&storage, &base)? {
            let file = storage.open_layer(&layer.digest)?;
            let _ = berth_image::layer::apply_layer(file, staging.path(), running_as_root())?;
            chain = Some(layer.digest.clone());
            layers.push(layer);
        }

        tracing::info!(
            context = %context_dir.display(),
            base = base_ref,
            staging = %staging.path().display(),
            "build context opened"
        );
        Ok(Self {
            storage,
            context_dir,
            staging,
            identity: IdentityLock::new(),
            working_dir: None,
            base: base_ref.to_string(),
            base_layers: layers.len(),
            layers,
            chain,
            env: Vec::new(),
            entry_command: None,
            account: None,
            stage: Stage::Started,
            poisoned: false,
            use_cache: true,
            log: BuildLog::default(),
        })
    }

    /// Enables or disables step-cache lookups. Layers are stored either way.
    #[must_use]
    pub const fn with_cache(mut self, enabled: bool) -> Self {
        self.use_cache = enabled;
        self
    }

    /// Returns the layer store.
    #[must_use]
    pub const fn storage(&self) -> &StorageBackend {
        &self.storage
    }

    /// Returns the canonical build context directory.
    #[must_use]
    pub fn context_dir(&self) -> &Path {
        &self.context_dir
    }

    /// Returns the staging root filesystem.
    #[must_use]
    pub fn staging_root(&self) -> &Path {
        self.staging.path()
    }

    /// Returns the identity currently in effect.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        self.identity.active()
    }

    /// Returns the working directory, once set.
    #[must_use]
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Returns every committed layer, base included.
    #[must_use]
    pub fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    /// Returns the layers produced by build steps (the base excluded).
    #[must_use]
    pub fn step_layers(&self) -> &[LayerDescriptor] {
        &self.layers[self.base_layers..]
    }

    /// Returns the build log so far.
    #[must_use]
    pub const fn log(&self) -> &BuildLog {
        &self.log
    }

    /// Returns the current stage.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Returns the created account, once present.
    #[must_use]
    pub const fn account(&self) -> Option<&Account> {
        self.account.as_ref()
    }

    /// Rejects `step` unless the build is healthy and `allowed` holds for
    /// the current stage.
    pub(crate) fn enter(
        &self,
        step: &'static str,
        allowed: impl Fn(Stage) -> bool,
        expectation: &str,
    ) -> Result<()> {
        if self.poisoned {
            return Err(BerthError::StepOrder {
                step,
                reason: "after a failed step".into(),
            });
        }
        if allowed(self.stage) {
            return Ok(());
        }
        Err(BerthError::StepOrder {
            step,
            reason: format!("{expectation} (build is at {:?})", self.stage),
        })
    }

    pub(crate) const fn advance(&mut self, stage: Stage) {
        self.stage = stage;
    }

    /// Runs one layer-producing step, or replays it from the step cache.
    ///
    /// `execute` mutates the staging root; the diff it causes is committed
    /// as a layer owned by the active identity unless `owner_of` overrides
    /// a path. Returns `None` when the step was served from the cache.
    pub(crate) fn run_step<T>(
        &mut self,
        instruction: &str,
        inputs: &[Sha256Hash],
        execute: impl FnOnce(&Path) -> Result<T>,
        owner_of: impl Fn(&T, &str) -> Option<Owner>,
    ) -> Result<Option<T>> {
        if self.layers.len() >= MAX_IMAGE_LAYERS {
            return Err(BerthError::Config {
                message: format!("image exceeds {MAX_IMAGE_LAYERS} layers"),
            });
        }
        let key = step_key(self.chain.as_ref(), instruction, inputs);
        let result = self.replay_or_execute(&key, instruction, execute, owner_of);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn replay_or_execute<T>(
        &mut self,
        key: &Sha256Hash,
        instruction: &str,
        execute: impl FnOnce(&Path) -> Result<T>,
        owner_of: impl Fn(&T, &str) -> Option<Owner>,
    ) -> Result<Option<T>> {
        if self.use_cache {
            if let Some(entry) = self.storage.cache_lookup(key)? {
                let file = self.storage.open_layer(&entry.layer.digest)?;
                let _ = berth_image::layer::apply_layer(file, self.staging.path(), running_as_root())?;
                self.record(key, instruction, StepOutcome::Cached(entry.layer));
                return Ok(None);
            }
        }

        let root = self.staging.path();
        let before = Snapshot::capture(root)?;
        let value = execute(root)?;
        let changes = before.diff(&Snapshot::capture(root)?);

        let active = self.identity.active();
        let default_owner = Owner {
            uid: active.uid,
            gid: active.gid,
        };
        let layer = self.storage.commit_layer(instruction, |out| {
            let _ = berth_image::layer::write_layer(
                root,
                &changes,
                |path, _| owner_of(&value, path).unwrap_or(default_owner),
                out,
            )?;
            Ok(())
        })?;
        self.storage.cache_store(
            key,
            &CacheEntry {
                layer: layer.clone(),
            },
        )?;
        tracing::debug!(changes = changes.len(), %key, "step executed");
        self.record(key, instruction, StepOutcome::Executed(layer));
        Ok(Some(value))
    }

    fn record(&mut self, key: &Sha256Hash, instruction: &str, outcome: StepOutcome) {
        if let Some(layer) = outcome.layer() {
            self.layers.push(layer.clone());
        }
        self.chain = Some(key.clone());
        let _ = self.log.push(instruction, outcome);
    }

    /// Records a step that only changes image metadata.
    pub(crate) fn record_metadata(&mut self, instruction: impl Into<String>) {
        let _ = self.log.push(instruction, StepOutcome::Metadata);
    }
}
