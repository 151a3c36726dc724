//! End-to-end tests: build an image from a recipe, then run it.
//!
//! These tests use direct isolation so they run without root:
//! 1. Launch as the created account with installed dependencies present
//! 2. Non-zero exits surface as `EntryProcessFailure`
//! 3. Stop sends SIGTERM to the entry process itself
//! 4. State, logs, and removal
//! 5. Failures while starting or waiting keep the state index consistent

#![allow(clippy::expect_used, clippy::unwrap_used)]
#![cfg(unix)]

use std::path::Path;

use berth_build::installer::IndexInstaller;
use berth_build::recipe::{BuildOptions, build_recipe};
use berth_common::config::BerthConfig;
use berth_common::error::BerthError;
use berth_common::types::{ContainerState, Isolation};
use berth_image::registry::ImageCatalog;
use berth_image::storage::StorageBackend;
use berth_core::identity::running_as_root;
use berth_image::image::ImageConfig;
use berth_runtime::container::StopOutcome;
use berth_runtime::engine::{Engine, RunOptions};
use berth_runtime::launcher::{LaunchSpec, ProcessHandle, ProcessLauncher};

const RECIPE: &str = r#"WORKDIR /app
MANIFEST requirements.txt
INSTALL
COPY src .
COPY entry.script .
ACCOUNT botuser
USER botuser
ENV MODE=production
CMD ["sh", "entry.script"]
"#;

struct Harness {
    data: tempfile::TempDir,
    _context: tempfile::TempDir,
    _index: tempfile::TempDir,
}

impl Harness {
    /// Builds an image tagged `bot` whose entry script is `script`.
    fn build(script: &str) -> Self {
        let data = tempfile::tempdir().expect("data");
        let context = tempfile::tempdir().expect("context");
        let index = tempfile::tempdir().expect("index");

        write(context.path(), "Berthfile", RECIPE);
        write(context.path(), "requirements.txt", "libfoo>=1.0\n");
        write(context.path(), "src/main.py", "print('hi')\n");
        write(context.path(), "entry.script", script);
        write(index.path(), "libfoo/1.0/opt/libfoo/VERSION", "1.0\n");

        let catalog = ImageCatalog::open(data.path()).expect("catalog");
        let storage = StorageBackend::open(data.path()).expect("storage");
        let _ = build_recipe(
            storage,
            &catalog,
            &BuildOptions::new(context.path(), "bot"),
            &IndexInstaller::new(index.path()),
        )
        .expect("build");

        Self {
            data,
            _context: context,
            _index: index,
        }
    }

    fn engine(&self) -> Engine {
        let config = BerthConfig {
            data_dir: self.data.path().to_path_buf(),
            isolation: Isolation::Direct,
            stop_grace_secs: 5,
            installer: None,
        };
        Engine::new(&config).expect("engine")
    }
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(path, content).expect("write");
}

fn options() -> RunOptions {
    RunOptions {
        env: vec![("GREETING".into(), "hello".into())],
        isolation: Isolation::Direct,
        capture_output: true,
    }
}

// ── Launch ───────────────────────────────────────────────────────────

#[test]
fn entry_runs_as_account_with_dependencies_installed() {
    let harness = Harness::build(
        "test -f ../opt/libfoo/VERSION || exit 9\necho \"$GREETING $MODE $USER\"\n",
    );
    let engine = harness.engine();

    let running = engine.start("bot", &options()).expect("start");
    assert_eq!(running.identity().name, "botuser");
    assert_eq!(running.identity().uid, 1000);
    let id = running.id().clone();

    let record = engine.wait(running).expect("exit 0");
    assert_eq!(record.state, ContainerState::Exited);
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.user, "botuser");

    let log = engine.logs(id.as_str(), None).expect("logs");
    assert!(log.contains("hello production botuser"));
    assert!(log.contains("started [\"sh\", \"entry.script\"]"));
}

#[test]
fn entry_process_runs_under_the_recorded_uid() {
    let harness = Harness::build("id -u\n");
    let engine = harness.engine();

    let record = engine.run("bot", &options()).expect("run");
    let log = engine.logs(record.id.as_str(), None).expect("logs");
    let printed: Vec<u32> = log
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();

    // Without root, direct isolation cannot change identity.
    let expected = if running_as_root() {
        1000
    } else {
        nix::unistd::geteuid().as_raw()
    };
    assert_eq!(printed, [expected]);
}

#[test]
fn non_zero_exit_is_an_entry_process_failure() {
    let harness = Harness::build("exit 7\n");
    let engine = harness.engine();

    let err = engine.run("bot", &options()).expect_err("should fail");
    assert!(matches!(err, BerthError::EntryProcessFailure { code: 7 }));
    assert_eq!(err.exit_code(), 7);

    let containers = engine.list().expect("list");
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].state, ContainerState::Exited);
    assert_eq!(containers[0].exit_code, Some(7));
}

#[test]
fn unknown_image_is_not_found() {
    let harness = Harness::build("exit 0\n");
    assert!(matches!(
        harness.engine().run("missing", &options()),
        Err(BerthError::NotFound { kind: "image", .. })
    ));
}

// ── Stop ─────────────────────────────────────────────────────────────

#[test]
fn stop_terminates_the_entry_process() {
    let harness = Harness::build("exec sleep 30\n");
    let engine = harness.engine();

    let running = engine.start("bot", &options()).expect("start");
    let id = running.id().clone();
    assert_eq!(engine.list().expect("list")[0].state, ContainerState::Running);

    let outcome = engine.stop(id.as_str()).expect("stop");
    assert_eq!(outcome, StopOutcome::Terminated);
    let err = engine.wait(running).expect_err("killed");
    assert!(matches!(err, BerthError::EntryProcessFailure { code: 143 }));

    assert_eq!(engine.stop(id.as_str()).expect("stop again"), StopOutcome::NotRunning);
}

// ── State ────────────────────────────────────────────────────────────

#[test]
fn exited_container_can_be_removed() {
    let harness = Harness::build("exit 0\n");
    let engine = harness.engine();
    let record = engine.run("bot", &options()).expect("run");
    assert!(record.rootfs.join("app/main.py").is_file());

    engine.remove(record.id.as_str()).expect("remove");
    assert!(engine.list().expect("list").is_empty());
    assert!(!record.rootfs.exists());
    assert!(matches!(
        engine.remove(record.id.as_str()),
        Err(BerthError::NotFound { .. })
    ));
}

// ── Failures ─────────────────────────────────────────────────────────

/// Launcher that never starts anything.
struct RefusingLauncher;

impl ProcessLauncher for RefusingLauncher {
    fn start(&self, spec: &LaunchSpec) -> berth_common::error::Result<ProcessHandle> {
        Err(BerthError::Collaborator {
            collaborator: "process launcher",
            message: format!("refusing to start {}", spec.argv),
        })
    }
}

#[test]
fn launcher_failure_records_a_failed_container() {
    let harness = Harness::build("exit 0\n");
    let engine = harness.engine().with_launcher(Box::new(RefusingLauncher));

    let err = engine.run("bot", &options()).expect_err("refused");
    assert!(matches!(err, BerthError::Collaborator { .. }));

    let containers = engine.list().expect("list");
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].state, ContainerState::Failed);
    assert!(containers[0].pid.is_none());
    let log = engine.logs(containers[0].id.as_str(), None).expect("logs");
    assert!(log.contains("failed to start"));
}

#[test]
fn unknown_runtime_account_leaves_no_container_behind() {
    let harness = Harness::build("exit 0\n");
    let storage = StorageBackend::open(harness.data.path()).expect("storage");
    let entry = ImageCatalog::open(harness.data.path())
        .expect("catalog")
        .resolve("bot")
        .expect("resolve");
    let mut config: ImageConfig = storage.load_image(&entry.id).expect("load");
    config.user = "ghost".into();
    storage.save_image(&entry.id, &config).expect("save");

    let engine = harness.engine();
    assert!(matches!(
        engine.run("bot", &options()),
        Err(BerthError::NotFound { kind: "account", .. })
    ));
    assert!(engine.list().expect("list").is_empty());
    let containers = harness.data.path().join("containers");
    let leftovers = std::fs::read_dir(&containers).map_or(0, Iterator::count);
    assert_eq!(leftovers, 0);
}
