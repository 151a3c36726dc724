//! Entry process launching.
//!
//! The entry process is reached only through [`ProcessLauncher`] and the
//! [`ProcessHandle`] it returns. The argument vector is executed directly,
//! never through a shell, so signals reach the process itself.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use berth_common::constants::DEFAULT_PATH;
use berth_common::error::{BerthError, Result};
use berth_common::types::{EntryCommand, Isolation};
use berth_core::identity::Identity;

/// Everything needed to start one entry process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Exec-form argument vector.
    pub argv: EntryCommand,
    /// Identity the process runs as.
    pub identity: Identity,
    /// Host path of the container root filesystem.
    pub rootfs: PathBuf,
    /// Working directory inside the image.
    pub working_dir: PathBuf,
    /// Complete process environment, later entries winning.
    pub env: Vec<(String, String)>,
    /// How the process is confined.
    pub isolation: Isolation,
    /// Appends stdout and stderr to this file instead of inheriting them.
    pub output: Option<PathBuf>,
}

impl LaunchSpec {
    /// Returns the last value set for `key`.
    #[must_use]
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the working directory as a host path.
    #[must_use]
    pub fn host_working_dir(&self) -> PathBuf {
        image_to_host(&self.rootfs, &self.working_dir)
    }
}

/// How an entry process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited normally with a status code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
}

impl ExitStatus {
    /// Returns whether the process exited with status zero.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Returns the shell-style status code (`128 + signal` for signals).
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => 128 + signal,
        }
    }

    #[cfg(unix)]
    fn from_std(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::Signaled(signal),
            (None, None) => Self::Exited(1),
        }
    }

    #[cfg(not(unix))]
    fn from_std(status: std::process::ExitStatus) -> Self {
        Self::Exited(status.code().unwrap_or(1))
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// A running entry process.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    identity: Identity,
}

impl ProcessHandle {
    /// Wraps a spawned child.
    #[must_use]
    pub const fn new(child: Child, identity: Identity) -> Self {
        Self { child, identity }
    }

    /// Returns the process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Returns the identity the process runs as.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Blocks until the process exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be waited on.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        let pid = self.pid();
        let status = self.child.wait().map_err(|e| BerthError::Collaborator {
            collaborator: "process launcher",
            message: format!("cannot wait for pid {pid}: {e}"),
        })?;
        let status = ExitStatus::from_std(status);
        tracing::info!(pid, %status, "entry process finished");
        Ok(status)
    }
}

/// Starts entry processes.
pub trait ProcessLauncher: Send + Sync {
    /// Starts `spec.argv` as `spec.identity` inside `spec.rootfs`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEntryCommand` if `argv[0]` cannot be resolved,
    /// `PermissionDenied` if the isolation mode needs privileges the caller
    /// lacks, and `Collaborator` if the process cannot be spawned.
    fn start(&self, spec: &LaunchSpec) -> Result<ProcessHandle>;
}

/// Launches processes on the local host with `chroot` or direct isolation.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostLauncher;

impl HostLauncher {
    /// Creates a host launcher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ProcessLauncher for HostLauncher {
    fn start(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        let mut command = match spec.isolation {
            Isolation::Chroot => chroot_command(spec)?,
            Isolation::Direct => direct_command(spec)?,
        };
        let _ = command.args(spec.argv.args()).env_clear().envs(process_env(spec));
        if let Some(path) = &spec.output {
            let out = open_append(path)?;
            let err = out.try_clone().map_err(|e| BerthError::io(path, e))?;
            let _ = command.stdout(Stdio::from(out)).stderr(Stdio::from(err));
        }

        let child = command.spawn().map_err(|e| BerthError::Collaborator {
            collaborator: "process launcher",
            message: format!("cannot start `{}`: {e}", spec.argv.program()),
        })?;
        tracing::info!(
            pid = child.id(),
            argv = %spec.argv,
            user = %spec.identity.name,
            uid = spec.identity.uid,
            isolation = %spec.isolation,
            "entry process started"
        );
        Ok(ProcessHandle::new(child, spec.identity.clone()))
    }
}

/// Builds the command for `chroot` isolation. The resolved program is an
/// image path; the child enters the root and drops privileges before exec.
#[cfg(unix)]
#[allow(unsafe_code)]
fn chroot_command(spec: &LaunchSpec) -> Result<Command> {
    use std::os::unix::process::CommandExt;

    berth_core::identity::require_root("chroot isolation")?;
    let path = spec.env_var("PATH").unwrap_or(DEFAULT_PATH);
    let program = resolve_in_image(&spec.rootfs, &spec.working_dir, spec.argv.program(), path)?;

    let mut command = Command::new(program);
    let root = spec.rootfs.clone();
    let cwd = spec.working_dir.clone();
    let identity = spec.identity.clone();
    // SAFETY: the closure runs in the forked child before exec and only
    // performs chroot, chdir, setgroups, setgid and setuid.
    unsafe {
        let _ = command.pre_exec(move || {
            berth_core::identity::enter_root(&root, &cwd)?;
            berth_core::identity::drop_privileges(&identity)
        });
    }
    Ok(command)
}

#[cfg(not(unix))]
fn chroot_command(_spec: &LaunchSpec) -> Result<Command> {
    Err(BerthError::PermissionDenied {
        message: "chroot isolation requires a Unix host".into(),
    })
}

/// Builds the command for direct isolation: same argv on the host, with the
/// container's working directory as cwd. A root caller still drops to the
/// image identity before exec.
fn direct_command(spec: &LaunchSpec) -> Result<Command> {
    let cwd = spec.host_working_dir();
    let image_path = spec.env_var("PATH").unwrap_or(DEFAULT_PATH);
    let program = spec.argv.program();

    let resolved = if program.contains('/') {
        let candidate = if Path::new(program).is_absolute() {
            image_to_host(&spec.rootfs, Path::new(program))
        } else {
            cwd.join(program)
        };
        if candidate.exists() {
            candidate
        } else {
            PathBuf::from(program)
        }
    } else {
        let mapped = map_search_path(&spec.rootfs, image_path);
        which::which_in(program, Some(&mapped), &cwd)
            .or_else(|_| which::which(program))
            .map_err(|e| BerthError::InvalidEntryCommand {
                message: format!("`{program}` not found: {e}"),
            })?
    };

    let mut command = Command::new(resolved);
    let _ = command.current_dir(cwd);
    if berth_core::identity::running_as_root() {
        drop_before_exec(&mut command, spec.identity.clone());
    } else {
        tracing::debug!(user = %spec.identity.name, "direct isolation without root keeps the caller identity");
    }
    Ok(command)
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn drop_before_exec(command: &mut Command, identity: Identity) {
    use std::os::unix::process::CommandExt;

    // SAFETY: the closure runs in the forked child before exec and only
    // performs setgroups, setgid and setuid.
    unsafe {
        let _ = command.pre_exec(move || berth_core::identity::drop_privileges(&identity));
    }
}

#[cfg(not(unix))]
const fn drop_before_exec(_command: &mut Command, _identity: Identity) {}

/// Resolves `program` against the image `PATH` inside `rootfs` and returns
/// the image path of the executable.
///
/// # Errors
///
/// Returns `InvalidEntryCommand` if no executable matches.
pub fn resolve_in_image(rootfs: &Path, working_dir: &Path, program: &str, path: &str) -> Result<PathBuf> {
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }
    let mapped = map_search_path(rootfs, path);
    let host_cwd = image_to_host(rootfs, working_dir);
    let found = which::which_in(program, Some(&mapped), &host_cwd).map_err(|e| {
        BerthError::InvalidEntryCommand {
            message: format!("`{program}` not found in image PATH {path}: {e}"),
        }
    })?;
    let inside = found
        .strip_prefix(rootfs)
        .map_err(|_| BerthError::InvalidEntryCommand {
            message: format!("`{program}` resolved outside the image root"),
        })?;
    Ok(Path::new("/").join(inside))
}

fn map_search_path(rootfs: &Path, path: &str) -> std::ffi::OsString {
    let dirs = path
        .split(':')
        .filter(|d| !d.is_empty())
        .map(|d| image_to_host(rootfs, Path::new(d)));
    std::env::join_paths(dirs).unwrap_or_default()
}

/// Maps an absolute image path onto the host root of the container.
#[must_use]
pub fn image_to_host(rootfs: &Path, image_path: &Path) -> PathBuf {
    rootfs.join(image_path.strip_prefix("/").unwrap_or(image_path))
}

/// The environment the entry process sees. The image sets `PATH` or gets
/// the default; `HOME` and `USER` come from the identity unless set.
fn process_env(spec: &LaunchSpec) -> Vec<(String, String)> {
    let mut env = Vec::with_capacity(spec.env.len() + 3);
    if spec.env_var("PATH").is_none() {
        let path = match spec.isolation {
            Isolation::Direct => std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.into()),
            Isolation::Chroot => DEFAULT_PATH.into(),
        };
        env.push(("PATH".to_string(), path));
    }
    if spec.env_var("HOME").is_none() {
        env.push(("HOME".to_string(), spec.identity.home.display().to_string()));
    }
    if spec.env_var("USER").is_none() {
        env.push(("USER".to_string(), spec.identity.name.clone()));
    }
    env.extend(spec.env.iter().cloned());
    env
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BerthError::io(parent, e))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| BerthError::io(path, e))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn bot() -> Identity {
        Identity {
            name: "bot".into(),
            uid: 1000,
            gid: 1000,
            home: PathBuf::from("/home/bot"),
        }
    }

    fn spec(rootfs: &Path, argv: &[&str]) -> LaunchSpec {
        LaunchSpec {
            argv: EntryCommand::new(argv.iter().copied()).expect("argv"),
            identity: bot(),
            rootfs: rootfs.to_path_buf(),
            working_dir: PathBuf::from("/app"),
            env: vec![("MODE".into(), "test".into())],
            isolation: Isolation::Direct,
            output: None,
        }
    }

    #[test]
    fn exit_codes_follow_shell_convention() {
        assert!(ExitStatus::Exited(0).success());
        assert_eq!(ExitStatus::Exited(3).code(), 3);
        assert_eq!(ExitStatus::Signaled(15).code(), 143);
        assert!(!ExitStatus::Signaled(9).success());
    }

    #[test]
    fn resolves_program_against_image_path() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().expect("tempdir");
        let bin = root.path().join("usr/bin");
        std::fs::create_dir_all(&bin).expect("mkdir");
        std::fs::create_dir_all(root.path().join("app")).expect("mkdir");
        std::fs::write(bin.join("bot"), "#!/bin/sh\n").expect("write");
        std::fs::set_permissions(bin.join("bot"), std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let found = resolve_in_image(root.path(), Path::new("/app"), "bot", "/bin:/usr/bin")
            .expect("resolve");
        assert_eq!(found, PathBuf::from("/usr/bin/bot"));
        assert!(matches!(
            resolve_in_image(root.path(), Path::new("/app"), "missing", "/usr/bin"),
            Err(BerthError::InvalidEntryCommand { .. })
        ));
    }

    #[test]
    fn environment_defaults_do_not_override_image() {
        let mut s = spec(Path::new("/r"), &["true"]);
        s.env.push(("HOME".into(), "/srv".into()));
        let env = process_env(&s);
        let last = |k: &str| env.iter().rev().find(|(key, _)| key == k).map(|(_, v)| v.clone());
        assert_eq!(last("HOME").as_deref(), Some("/srv"));
        assert_eq!(last("USER").as_deref(), Some("bot"));
        assert_eq!(last("MODE").as_deref(), Some("test"));
        assert!(last("PATH").is_some());
    }

    #[test]
    fn direct_launch_reports_exit_status_and_identity() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(root.path().join("app")).expect("mkdir");
        let log = root.path().join("out.log");

        let mut s = spec(root.path(), &["sh", "-c", "echo \"$MODE from $(pwd)\"; exit 3"]);
        s.output = Some(log.clone());
        let mut handle = HostLauncher::new().start(&s).expect("start");
        assert!(handle.pid() > 0);
        assert_eq!(handle.identity().name, "bot");
        assert_eq!(handle.wait().expect("wait"), ExitStatus::Exited(3));

        let output = std::fs::read_to_string(log).expect("read");
        assert!(output.starts_with("test from "));
        assert!(output.trim_end().ends_with("/app"));
    }

    #[test]
    fn unknown_program_is_an_invalid_entry_command() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(root.path().join("app")).expect("mkdir");
        let s = spec(root.path(), &["definitely-not-a-berth-program"]);
        assert!(matches!(
            HostLauncher::new().start(&s),
            Err(BerthError::InvalidEntryCommand { .. })
        ));
    }
}
