//! Integration tests for the image build pipeline.
//!
//! Every test builds against a throwaway data directory, a build context
//! holding a manifest and a small source tree, and a local package index:
//! 1. Determinism across stores
//! 2. Layer shadowing and context filtering
//! 3. Dependency resolution failures
//! 4. Writes confined to the staging root
//! 5. Account creation, identity switch, and the access audit
//! 6. Step ordering
//! 7. Recipe-driven builds and the step cache

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::{Path, PathBuf};

use berth_build::context::BuildContext;
use berth_build::installer::{DependencyInstaller, IndexInstaller, InstallRequest};
use berth_build::log::StepOutcome;
use berth_build::pipeline::{self, AccountOutcome};
use berth_build::recipe::{BuildOptions, build_recipe};
use berth_common::error::{BerthError, Result};
use berth_common::types::EntryCommand;
use berth_image::registry::ImageCatalog;
use berth_image::storage::StorageBackend;

const RECIPE: &str = r#"# chat bot image
WORKDIR /app
MANIFEST requirements.txt
INSTALL
COPY src .
COPY entry.script .
ACCOUNT bot
USER bot
ENV MODE=production
CMD ["sh", "entry.script"]
"#;

struct Fixture {
    data: tempfile::TempDir,
    context: tempfile::TempDir,
    index: tempfile::TempDir,
}

impl Fixture {
    fn new(manifest: &str) -> Self {
        let data = tempfile::tempdir().expect("data dir");
        let context = tempfile::tempdir().expect("context dir");
        let index = tempfile::tempdir().expect("index dir");

        write(context.path(), "Berthfile", RECIPE);
        write(context.path(), "requirements.txt", manifest);
        write(context.path(), "src/main.py", "print('hello')\n");
        write(context.path(), "src/settings.py", "SOURCE = True\n");
        write(context.path(), "src/.env", "TOKEN=secret\n");
        write(context.path(), "entry.script", "exit 0\n");
        write(context.path(), ".berthignore", "# local secrets\n.env\n__pycache__/\n");

        write(index.path(), "libfoo/1.2/opt/libfoo/VERSION", "1.2\n");
        write(index.path(), "libfoo/1.2/app/settings.py", "INSTALLER = True\n");
        write(index.path(), "libfoo/0.5/opt/libfoo/VERSION", "0.5\n");

        Self {
            data,
            context,
            index,
        }
    }

    fn storage(&self) -> StorageBackend {
        StorageBackend::open(self.data.path()).expect("storage")
    }

    fn installer(&self) -> IndexInstaller {
        IndexInstaller::new(self.index.path())
    }

    fn open(&self, base: &str) -> BuildContext {
        BuildContext::new(self.storage(), self.context.path(), base).expect("context")
    }
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(path, content).expect("write");
}

/// Runs every mandatory step up to and including `COPY`.
fn through_copy(ctx: &mut BuildContext, installer: &dyn DependencyInstaller) {
    pipeline::set_working_directory(ctx, Path::new("/app")).expect("workdir");
    let staged = pipeline::materialize_manifest(ctx, Path::new("requirements.txt")).expect("manifest");
    pipeline::install_dependencies(ctx, &staged, installer).expect("install");
    pipeline::materialize_source_tree(ctx, Path::new("src"), Path::new(".")).expect("copy src");
    pipeline::materialize_source_tree(ctx, Path::new("entry.script"), Path::new("."))
        .expect("copy entry");
}

fn build(fixture: &Fixture, base: &str) -> pipeline::BuiltImage {
    let installer = fixture.installer();
    let mut ctx = fixture.open(base);
    through_copy(&mut ctx, &installer);
    let _ = pipeline::create_account(&mut ctx, "bot").expect("account");
    pipeline::switch_identity(&mut ctx, "bot").expect("switch");
    pipeline::set_entry_command(&mut ctx, EntryCommand::new(["sh", "entry.script"]).expect("argv"))
        .expect("cmd");
    pipeline::finish(ctx).expect("finish")
}

fn assemble(fixture: &Fixture, image: &pipeline::BuiltImage) -> tempfile::TempDir {
    let root = tempfile::tempdir().expect("rootfs");
    berth_image::image::assemble_rootfs(&fixture.storage(), &image.config.layers, root.path(), false)
        .expect("assemble");
    root
}

// ── Determinism ──────────────────────────────────────────────────────

#[test]
fn identical_inputs_in_fresh_stores_yield_identical_images() {
    let first = Fixture::new("libfoo>=1.0\n");
    let second = Fixture::new("libfoo>=1.0\n");

    let a = build(&first, "scratch");
    let b = build(&second, "scratch");

    assert_eq!(a.id, b.id);
    let digests = |img: &pipeline::BuiltImage| -> Vec<String> {
        img.config.layers.iter().map(|l| l.digest.to_string()).collect()
    };
    assert_eq!(digests(&a), digests(&b));
    assert_eq!(a.log.cached_steps(), 0);
    assert_eq!(b.log.cached_steps(), 0);
}

// ── Layers ───────────────────────────────────────────────────────────

#[test]
fn source_file_shadows_installer_output() {
    let fixture = Fixture::new("libfoo>=1.0\n");
    let image = build(&fixture, "scratch");
    let root = assemble(&fixture, &image);

    let settings = std::fs::read_to_string(root.path().join("app/settings.py")).expect("read");
    assert_eq!(settings, "SOURCE = True\n");
    let version = std::fs::read_to_string(root.path().join("opt/libfoo/VERSION")).expect("read");
    assert_eq!(version, "1.2\n");
    assert!(root.path().join("app/requirements.txt").is_file());
    assert!(root.path().join("app/entry.script").is_file());
}

#[test]
fn ignored_context_entries_never_reach_the_image() {
    let fixture = Fixture::new("libfoo\n");
    write(fixture.context.path(), "src/__pycache__/main.pyc", "bytecode");
    let image = build(&fixture, "scratch");
    let root = assemble(&fixture, &image);

    assert!(root.path().join("app/main.py").is_file());
    assert!(!root.path().join("app/.env").exists());
    assert!(!root.path().join("app/__pycache__").exists());
}

#[test]
fn empty_manifest_still_commits_the_manifest_copy() {
    let fixture = Fixture::new("# nothing to install\n");
    let image = build(&fixture, "scratch");
    let root = assemble(&fixture, &image);

    assert!(root.path().join("app/requirements.txt").is_file());
    assert!(!root.path().join("opt").exists());
}

// ── Dependency resolution ────────────────────────────────────────────

#[test]
fn unsatisfiable_requirement_commits_nothing_beyond_workdir() {
    let fixture = Fixture::new("libfoo==999.0\n");
    let storage = fixture.storage();
    let mut ctx = fixture.open("scratch");

    pipeline::set_working_directory(&mut ctx, Path::new("/app")).expect("workdir");
    let staged =
        pipeline::materialize_manifest(&mut ctx, Path::new("requirements.txt")).expect("manifest");
    let err = pipeline::install_dependencies(&mut ctx, &staged, &fixture.installer())
        .expect_err("should fail");

    assert!(matches!(
        err,
        BerthError::DependencyResolution { ref unsatisfied } if unsatisfied == &["libfoo==999.0".to_string()]
    ));
    assert_eq!(ctx.layers().len(), 1);
    assert_eq!(storage.list_layers().expect("layers").len(), 1);
    assert!(matches!(
        pipeline::materialize_source_tree(&mut ctx, Path::new("src"), Path::new(".")),
        Err(BerthError::StepOrder { .. })
    ));
}

#[test]
fn manifest_outside_the_context_is_rejected() {
    let fixture = Fixture::new("libfoo\n");
    let mut ctx = fixture.open("scratch");
    pipeline::set_working_directory(&mut ctx, Path::new("/app")).expect("workdir");

    assert!(matches!(
        pipeline::materialize_manifest(&mut ctx, Path::new("../requirements.txt")),
        Err(BerthError::InvalidPath { .. })
    ));
    assert!(matches!(
        pipeline::materialize_manifest(&mut ctx, Path::new("missing.txt")),
        Err(BerthError::InvalidPath { .. })
    ));
}

#[test]
fn manifest_with_invalid_utf8_is_a_recipe_error() {
    let fixture = Fixture::new("");
    std::fs::write(fixture.context.path().join("requirements.txt"), b"libfoo\n\xff\xfe\n")
        .expect("write");
    let mut ctx = fixture.open("scratch");
    pipeline::set_working_directory(&mut ctx, Path::new("/app")).expect("workdir");

    let err = pipeline::materialize_manifest(&mut ctx, Path::new("requirements.txt"))
        .expect_err("should fail");
    assert!(
        matches!(&err, BerthError::Recipe { file, line: 2, .. } if file == "requirements.txt"),
        "{err}"
    );
}

// ── Staging confinement ──────────────────────────────────────────────

/// Builds a fixture whose `src/lib` is a symlink to a directory outside
/// every tree the build owns.
#[cfg(unix)]
fn fixture_with_outside_link() -> (Fixture, tempfile::TempDir) {
    let fixture = Fixture::new("libfoo\n");
    let outside = tempfile::tempdir().expect("outside");
    std::os::unix::fs::symlink(outside.path(), fixture.context.path().join("src/lib"))
        .expect("symlink");
    write(fixture.context.path(), "payload", "data\n");
    (fixture, outside)
}

#[cfg(unix)]
#[test]
fn copy_below_a_copied_symlink_is_rejected() {
    let (fixture, outside) = fixture_with_outside_link();
    let installer = fixture.installer();
    let mut ctx = fixture.open("scratch");
    through_copy(&mut ctx, &installer);

    let err = pipeline::materialize_source_tree(&mut ctx, Path::new("payload"), Path::new("lib/sub/payload"))
        .expect_err("should fail");
    assert!(matches!(err, BerthError::InvalidPath { .. }), "{err}");
    assert!(!outside.path().join("sub").exists());
}

#[cfg(unix)]
#[test]
fn copy_into_a_symlinked_directory_is_rejected() {
    let (fixture, outside) = fixture_with_outside_link();
    let installer = fixture.installer();
    let mut ctx = fixture.open("scratch");
    through_copy(&mut ctx, &installer);

    let err = pipeline::materialize_source_tree(&mut ctx, Path::new("payload"), Path::new("lib/"))
        .expect_err("should fail");
    assert!(matches!(err, BerthError::InvalidPath { .. }), "{err}");
    assert!(!outside.path().join("payload").exists());
}

#[test]
fn deletion_marker_names_cannot_be_copied() {
    let fixture = Fixture::new("libfoo\n");
    write(fixture.context.path(), "src/.wh.config", "x\n");
    let installer = fixture.installer();
    let mut ctx = fixture.open("scratch");
    pipeline::set_working_directory(&mut ctx, Path::new("/app")).expect("workdir");
    let staged = pipeline::materialize_manifest(&mut ctx, Path::new("requirements.txt")).expect("manifest");
    pipeline::install_dependencies(&mut ctx, &staged, &installer).expect("install");

    let err = pipeline::materialize_source_tree(&mut ctx, Path::new("src"), Path::new("."))
        .expect_err("should fail");
    assert!(matches!(err, BerthError::InvalidPath { .. }), "{err}");
}

// ── Accounts and identity ────────────────────────────────────────────

#[test]
fn account_colliding_with_base_account_fails() {
    let fixture = Fixture::new("libfoo\n");
    let base = tempfile::tempdir().expect("base");
    write(base.path(), "etc/passwd", "root:x:0:0:root:/root:/bin/sh\nbot:x:1000:1000::/home/bot:/bin/sh\n");
    write(base.path(), "etc/group", "root:x:0:\nbot:x:1000:\n");

    let mut ctx = fixture.open(&format!("file://{}", base.path().display()));
    through_copy(&mut ctx, &fixture.installer());
    assert!(matches!(
        pipeline::create_account(&mut ctx, "bot"),
        Err(BerthError::AccountExists { ref name }) if name == "bot"
    ));
}

#[test]
fn repeated_build_serves_account_from_cache() {
    let fixture = Fixture::new("libfoo\n");
    let first = build(&fixture, "scratch");

    let mut ctx = fixture.open("scratch");
    through_copy(&mut ctx, &fixture.installer());
    let outcome = pipeline::create_account(&mut ctx, "bot").expect("account");

    assert!(matches!(outcome, AccountOutcome::AlreadyPresentFromCache(_)));
    assert_eq!(outcome.account().uid, 1000);
    assert_eq!(ctx.layers(), &first.config.layers[..5]);
    assert!(ctx.log().records().iter().all(|r| !matches!(r.outcome, StepOutcome::Executed(_))));
}

#[test]
fn switched_identity_is_the_image_user_and_is_final() {
    let fixture = Fixture::new("libfoo\n");
    let mut ctx = fixture.open("scratch");
    through_copy(&mut ctx, &fixture.installer());
    let outcome = pipeline::create_account(&mut ctx, "bot").expect("account");
    assert!(matches!(outcome, AccountOutcome::Created(_)));

    pipeline::switch_identity(&mut ctx, "bot").expect("switch");
    assert_eq!(ctx.identity().name, "bot");
    assert_eq!(ctx.identity().uid, outcome.account().uid);
    assert!(matches!(
        pipeline::switch_identity(&mut ctx, "root"),
        Err(BerthError::IdentityLocked { .. })
    ));

    pipeline::set_entry_command(&mut ctx, EntryCommand::new(["sh", "entry.script"]).expect("argv"))
        .expect("cmd");
    let image = pipeline::finish(ctx).expect("finish");
    assert_eq!(image.config.user, "bot");
    assert_eq!(image.config.working_dir, PathBuf::from("/app"));
}

/// Writes a file the account cannot read.
struct PrivateFileInstaller;

impl DependencyInstaller for PrivateFileInstaller {
    fn name(&self) -> &'static str {
        "private"
    }

    fn fingerprint(&self) -> Result<String> {
        Ok("private".into())
    }

    fn install(&self, request: &InstallRequest<'_>) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path = request.rootfs.join("opt/secret.key");
        std::fs::create_dir_all(request.rootfs.join("opt")).expect("mkdir");
        std::fs::write(&path, "key").expect("write");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).expect("chmod");
        Ok(())
    }
}

#[test]
fn unreadable_privileged_write_fails_the_access_audit() {
    let fixture = Fixture::new("libfoo\n");
    let mut ctx = fixture.open("scratch");
    through_copy(&mut ctx, &PrivateFileInstaller);
    let _ = pipeline::create_account(&mut ctx, "bot").expect("account");
    pipeline::switch_identity(&mut ctx, "bot").expect("switch");
    pipeline::set_entry_command(&mut ctx, EntryCommand::new(["sh", "entry.script"]).expect("argv"))
        .expect("cmd");

    let err = pipeline::finish(ctx).expect_err("should fail");
    assert!(matches!(
        err,
        BerthError::AccessDenied { ref account, ref paths }
            if account == "bot" && paths == &["/opt/secret.key".to_string()]
    ));
}

// ── Step order ───────────────────────────────────────────────────────

#[test]
fn steps_out_of_order_fail() {
    let fixture = Fixture::new("libfoo\n");
    let mut ctx = fixture.open("scratch");

    assert!(matches!(
        pipeline::materialize_manifest(&mut ctx, Path::new("requirements.txt")),
        Err(BerthError::StepOrder { .. })
    ));
    assert!(matches!(
        pipeline::set_env(&mut ctx, "MODE", "x"),
        Err(BerthError::StepOrder { .. })
    ));
    pipeline::set_working_directory(&mut ctx, Path::new("/app")).expect("workdir");
    assert!(matches!(
        pipeline::create_account(&mut ctx, "bot"),
        Err(BerthError::StepOrder { .. })
    ));
    assert!(matches!(
        pipeline::set_working_directory(&mut ctx, Path::new("/other")),
        Err(BerthError::StepOrder { .. })
    ));
}

#[test]
fn relative_or_escaping_workdir_is_invalid() {
    let fixture = Fixture::new("libfoo\n");
    let mut ctx = fixture.open("scratch");
    assert!(matches!(
        pipeline::set_working_directory(&mut ctx, Path::new("app")),
        Err(BerthError::InvalidPath { .. })
    ));
    let mut ctx = fixture.open("scratch");
    assert!(matches!(
        pipeline::set_working_directory(&mut ctx, Path::new("/../app")),
        Err(BerthError::InvalidPath { .. })
    ));
}

// ── Recipes ──────────────────────────────────────────────────────────

#[test]
fn recipe_build_registers_image_and_reuses_cache() {
    let fixture = Fixture::new("libfoo>=1.0\n");
    let catalog = ImageCatalog::open(fixture.data.path()).expect("catalog");
    let options = BuildOptions::new(fixture.context.path(), "chatbot");

    let first = build_recipe(fixture.storage(), &catalog, &options, &fixture.installer())
        .expect("first build");
    assert_eq!(first.image.config.user, "bot");
    assert_eq!(first.image.config.env_var("MODE"), Some("production"));
    assert_eq!(first.image.config.entry_command.argv(), ["sh", "entry.script"]);
    assert_eq!(catalog.resolve("chatbot").expect("resolve").id, first.image.id);

    let second = build_recipe(fixture.storage(), &catalog, &options, &fixture.installer())
        .expect("second build");
    assert_eq!(second.image.id, first.image.id);
    assert_eq!(second.image.log.cached_steps(), 5);

    let mut uncached = options.clone();
    uncached.no_cache = true;
    let third = build_recipe(fixture.storage(), &catalog, &uncached, &fixture.installer())
        .expect("uncached build");
    assert_eq!(third.image.log.cached_steps(), 0);
    assert_eq!(third.image.id, first.image.id);
}

#[test]
fn recipe_with_unsatisfiable_manifest_registers_nothing() {
    let fixture = Fixture::new("libfoo==999.0\n");
    let catalog = ImageCatalog::open(fixture.data.path()).expect("catalog");
    let options = BuildOptions::new(fixture.context.path(), "chatbot");

    let err = build_recipe(fixture.storage(), &catalog, &options, &fixture.installer())
        .expect_err("should fail");
    assert!(matches!(err, BerthError::DependencyResolution { .. }));
    assert!(catalog.list().expect("list").is_empty());
}
