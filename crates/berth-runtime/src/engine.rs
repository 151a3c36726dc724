//! Runtime engine that instantiates images as containers.
//!
//! `run` is `start` followed by `wait`: the image's layers are applied to a
//! private root, the runtime identity is read from the image's own
//! `/etc/passwd`, and the entry command is handed to the
//! [`ProcessLauncher`]. The container lives exactly as long as that
//! process. Restarting is left to whatever supervises berth.

use std::path::{Path, PathBuf};
use std::time::Duration;

use berth_common::config::BerthConfig;
use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, Isolation};
use berth_core::account::AccountDatabase;
use berth_core::identity::{Identity, running_as_root};
use berth_image::image::ImageConfig;
use berth_image::registry::ImageCatalog;
use berth_image::storage::StorageBackend;

use crate::container::{self, ContainerRecord, StopOutcome};
use crate::launcher::{HostLauncher, LaunchSpec, ProcessHandle, ProcessLauncher};
use crate::logs;
use crate::state;

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Extra environment, applied after the image environment.
    pub env: Vec<(String, String)>,
    /// Isolation for the entry process.
    pub isolation: Isolation,
    /// Sends stdout and stderr to the container log instead of inheriting.
    pub capture_output: bool,
}

/// A container whose entry process is running.
#[derive(Debug)]
pub struct RunningContainer {
    record: ContainerRecord,
    handle: ProcessHandle,
}

impl RunningContainer {
    /// Returns the container id.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.record.id
    }

    /// Returns the entry process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    /// Returns the identity the entry process runs as.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        self.handle.identity()
    }

    /// Returns the persisted record as of start.
    #[must_use]
    pub const fn record(&self) -> &ContainerRecord {
        &self.record
    }
}

/// The runtime engine that coordinates all container operations.
pub struct Engine {
    data_dir: PathBuf,
    storage: StorageBackend,
    catalog: ImageCatalog,
    launcher: Box<dyn ProcessLauncher>,
    stop_grace: Duration,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.data_dir)
            .field("stop_grace", &self.stop_grace)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Opens the engine over `config.data_dir` with the host launcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or catalog cannot be opened.
    pub fn new(config: &BerthConfig) -> Result<Self> {
        Ok(Self {
            data_dir: config.data_dir.clone(),
            storage: StorageBackend::open(&config.data_dir)?,
            catalog: ImageCatalog::open(&config.data_dir)?,
            launcher: Box::new(HostLauncher::new()),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
        })
    }

    /// Replaces the process launcher.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Box<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Returns the data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    /// Instantiates `image_ref` and starts its entry process.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown image or runtime account, and
    /// launcher errors if the entry process cannot start. A container that
    /// fails to start is recorded as `Failed`.
    pub fn start(&self, image_ref: &str, options: &RunOptions) -> Result<RunningContainer> {
        let entry = self.catalog.resolve(image_ref)?;
        let config = self.storage.load_image(&entry.id)?;

        let id = ContainerId::generate();
        let container_dir = self.data_dir.join("containers").join(id.as_str());
        let rootfs = container_dir.join("rootfs");
        let identity = match prepare_rootfs(&self.storage, &config, &rootfs) {
            Ok(identity) => identity,
            Err(e) => {
                discard_dir(&container_dir);
                return Err(e);
            }
        };

        let mut record = ContainerRecord::new(
            id.clone(),
            entry.id.clone(),
            image_ref.to_string(),
            identity.name.clone(),
            options.isolation,
            rootfs.clone(),
        );
        if let Err(e) = state::update_state(&self.state_path(), |s| {
            s.upsert(record.clone());
            Ok(())
        }) {
            discard_dir(&container_dir);
            return Err(e);
        }

        let mut env = config.env.clone();
        env.extend(options.env.iter().cloned());
        let spec = LaunchSpec {
            argv: config.entry_command.clone(),
            identity,
            rootfs,
            working_dir: config.working_dir.clone(),
            env,
            isolation: options.isolation,
            output: options
                .capture_output
                .then(|| logs::log_path(&self.data_dir, &id)),
        };

        let handle = match self.launcher.start(&spec) {
            Ok(handle) => handle,
            Err(e) => {
                record.mark_failed();
                self.persist(record, &format!("failed to start: {e}"));
                return Err(e);
            }
        };

        record.mark_running(handle.pid());
        let event = format!("started {} as {} (pid {})", spec.argv, record.user, handle.pid());
        self.persist(record.clone(), &event);
        tracing::info!(id = %id.short(), image = %entry.id.short(), pid = handle.pid(), "container running");
        Ok(RunningContainer { record, handle })
    }

    /// Waits for the entry process and records the exit.
    ///
    /// # Errors
    ///
    /// Returns `EntryProcessFailure` carrying the status code if the entry
    /// process exits non-zero or is killed. There is no retry.
    pub fn wait(&self, running: RunningContainer) -> Result<ContainerRecord> {
        let RunningContainer { mut record, mut handle } = running;
        let status = match handle.wait() {
            Ok(status) => status,
            Err(e) => {
                record.mark_failed();
                self.persist(record, &format!("lost the entry process: {e}"));
                return Err(e);
            }
        };
        record.mark_exited(status.code());
        self.persist(record.clone(), &format!("entry process {status}"));

        if status.success() {
            return Ok(record);
        }
        tracing::error!(id = %record.id.short(), %status, "entry process failed");
        Err(BerthError::EntryProcessFailure { code: status.code() })
    }

    /// Appends `event` to the container log and stores `record`.
    ///
    /// Failures are logged, not returned: the caller must still see the
    /// process outcome.
    fn persist(&self, record: ContainerRecord, event: &str) {
        if let Err(e) = logs::append_event(&self.data_dir, &record.id, event) {
            tracing::warn!(id = %record.id.short(), error = %e, "cannot write container log");
        }
        let id = record.id.clone();
        if let Err(e) = state::update_state(&self.state_path(), |s| {
            s.upsert(record);
            Ok(())
        }) {
            tracing::warn!(id = %id.short(), error = %e, "cannot update state index");
        }
    }

    /// Starts `image_ref` and waits for it.
    ///
    /// # Errors
    ///
    /// See [`Engine::start`] and [`Engine::wait`].
    pub fn run(&self, image_ref: &str, options: &RunOptions) -> Result<ContainerRecord> {
        let running = self.start(image_ref, options)?;
        self.wait(running)
    }

    /// Lists every known container.
    ///
    /// # Errors
    ///
    /// Returns an error if the state index cannot be read.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        Ok(state::load_state(&self.state_path())?.containers)
    }

    /// Returns the log of a container.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown container.
    pub fn logs(&self, reference: &str, tail: Option<usize>) -> Result<String> {
        let state = state::load_state(&self.state_path())?;
        let record = state.find(reference)?;
        logs::read_logs(&self.data_dir, &record.id, tail)
    }

    /// Stops a running container: SIGTERM, then SIGKILL after the grace
    /// period. The process that started the container records the exit.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown container and `PermissionDenied`
    /// if the process cannot be signaled.
    pub fn stop(&self, reference: &str) -> Result<StopOutcome> {
        let state = state::load_state(&self.state_path())?;
        let record = state.find(reference)?.clone();
        let Some(pid) = record.pid.filter(|_| record.is_running()) else {
            return Ok(StopOutcome::NotRunning);
        };

        let outcome = container::terminate(pid, self.stop_grace)?;
        logs::append_event(&self.data_dir, &record.id, &format!("stop requested: {outcome:?}"))?;
        if outcome == StopOutcome::NotRunning {
            // Nobody is left to record the exit.
            state::update_state(&self.state_path(), |s| {
                let mut stale = record.clone();
                stale.mark_failed();
                s.upsert(stale);
                Ok(())
            })?;
        }
        Ok(outcome)
    }

    /// Removes a container that is not running, with its root filesystem.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown container and `Config` if it is
    /// still running.
    pub fn remove(&self, reference: &str) -> Result<()> {
        state::update_state(&self.state_path(), |s| {
            let record = s.find(reference)?.clone();
            if record.pid.is_some_and(container::is_alive) {
                return Err(BerthError::Config {
                    message: format!("container {} is still running", record.id.short()),
                });
            }
            let dir = self.data_dir.join("containers").join(record.id.as_str());
            if dir.exists() {
                std::fs::remove_dir_all(&dir).map_err(|e| BerthError::io(&dir, e))?;
            }
            s.containers.retain(|c| c.id != record.id);
            tracing::info!(id = %record.id.short(), "container removed");
            Ok(())
        })
    }
}

/// Applies the image layers to `rootfs` and resolves the runtime identity
/// from the image's own account database.
fn prepare_rootfs(storage: &StorageBackend, config: &ImageConfig, rootfs: &Path) -> Result<Identity> {
    berth_image::image::assemble_rootfs(storage, &config.layers, rootfs, running_as_root())?;
    let db = AccountDatabase::load(rootfs)?;
    let account = db.lookup(&config.user).ok_or_else(|| BerthError::NotFound {
        kind: "account",
        id: config.user.clone(),
    })?;
    Ok(Identity::from(account))
}

fn discard_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot discard container directory");
        }
    }
}
