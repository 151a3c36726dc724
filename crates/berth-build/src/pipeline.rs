//! The image build pipeline.
//!
//! Steps run strictly in this order, each taking the [`BuildContext`]:
//!
//! 1. [`set_working_directory`]
//! 2. [`materialize_manifest`]
//! 3. [`install_dependencies`]
//! 4. [`materialize_source_tree`] (repeatable)
//! 5. [`create_account`]
//! 6. [`switch_identity`]
//! 7. [`set_entry_command`]
//!
//! [`set_env`] may be called any time after the working directory is set,
//! and [`finish`] seals the image. Calling a step out of order fails with
//! `StepOrder`. A failed layer step leaves the context unusable.

use std::path::{Component, Path, PathBuf};

use berth_common::error::{BerthError, Result};
use berth_common::types::{EntryCommand, ImageId, Sha256Hash};
use berth_core::account::{self, Account, AccountDatabase};
use berth_core::identity::Identity;
use berth_image::image::ImageConfig;
use berth_image::layer::{self, Owner};
use berth_recipe::manifest::Manifest;
use sha2::{Digest, Sha256};

use crate::context::{BuildContext, Stage};
use crate::copy;
use crate::filter::ContextFilter;
use crate::installer::{DependencyInstaller, InstallRequest};
use crate::log::BuildLog;

/// A manifest read from the build context, waiting to be committed together
/// with the installer output.
#[derive(Debug, Clone)]
pub struct StagedManifest {
    manifest: Manifest,
    bytes: Vec<u8>,
    digest: Sha256Hash,
    source: PathBuf,
    image_path: PathBuf,
}

impl StagedManifest {
    /// Returns the parsed manifest.
    #[must_use]
    pub const fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Returns the digest of the manifest bytes.
    #[must_use]
    pub const fn digest(&self) -> &Sha256Hash {
        &self.digest
    }

    /// Returns where the manifest lands inside the image.
    #[must_use]
    pub fn image_path(&self) -> &Path {
        &self.image_path
    }
}

/// Result of [`create_account`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountOutcome {
    /// The account was provisioned by this build.
    Created(Account),
    /// The account step was served from the step cache.
    AlreadyPresentFromCache(Account),
}

impl AccountOutcome {
    /// Returns the account either way.
    #[must_use]
    pub const fn account(&self) -> &Account {
        match self {
            Self::Created(account) | Self::AlreadyPresentFromCache(account) => account,
        }
    }

    /// Returns whether the step came from the cache.
    #[must_use]
    pub const fn is_cached(&self) -> bool {
        matches!(self, Self::AlreadyPresentFromCache(_))
    }
}

/// A sealed image, persisted in the store.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    /// Content-derived image id.
    pub id: ImageId,
    /// Persisted config.
    pub config: ImageConfig,
    /// Ordered record of the build steps.
    pub log: BuildLog,
}

/// Sets the working directory and creates it in the image.
///
/// # Errors
///
/// Returns `InvalidPath` if `path` is relative or escapes the root, and
/// `StepOrder` if it is not the first step.
pub fn set_working_directory(ctx: &mut BuildContext, path: &Path) -> Result<()> {
    ctx.enter("WORKDIR", |s| s == Stage::Started, "must be the first step")?;
    let workdir = normalize_image_path(path)?;
    let instruction = format!("WORKDIR {}", workdir.display());

    let _ = ctx.run_step(
        &instruction,
        &[],
        |root| copy::ensure_dir(&staging_path(root, &workdir)?),
        |(), _| None,
    )?;
    tracing::info!(workdir = %workdir.display(), "working directory set");
    ctx.working_dir = Some(workdir);
    ctx.advance(Stage::WorkingDirectory);
    Ok(())
}

/// Reads the manifest from the build context and stages it for the
/// dependency layer. Nothing else from the context is read.
///
/// # Errors
///
/// Returns `InvalidPath` if the manifest is missing or escapes the build
/// context, and `Recipe` if it cannot be parsed.
pub fn materialize_manifest(ctx: &mut BuildContext, manifest_path: &Path) -> Result<StagedManifest> {
    ctx.enter(
        "MANIFEST",
        |s| s == Stage::WorkingDirectory,
        "must follow WORKDIR",
    )?;
    let source = resolve_in_context(ctx.context_dir(), manifest_path)?;
    if !source.is_file() {
        return Err(BerthError::InvalidPath {
            path: manifest_path.to_path_buf(),
            reason: "manifest is not a regular file".into(),
        });
    }
    let bytes = std::fs::read(&source).map_err(|e| BerthError::io(&source, e))?;
    let file = manifest_path.display().to_string();
    let text = std::str::from_utf8(&bytes).map_err(|e| {
        let line = bytes[..e.valid_up_to()].iter().filter(|&&b| b == b'\n').count() + 1;
        BerthError::Recipe {
            file: file.clone(),
            line,
            message: "manifest is not valid UTF-8".into(),
        }
    })?;
    let manifest = Manifest::parse(&file, text)?;

    let file_name = source.file_name().map(PathBuf::from).unwrap_or_default();
    let workdir = ctx.working_dir.clone().unwrap_or_else(|| PathBuf::from("/"));
    let staged = StagedManifest {
        digest: Sha256Hash::of_bytes(&bytes),
        image_path: workdir.join(file_name),
        manifest,
        bytes,
        source: manifest_path.to_path_buf(),
    };
    tracing::info!(
        manifest = %staged.source.display(),
        requirements = staged.manifest.len(),
        "manifest staged"
    );
    ctx.record_metadata(format!("MANIFEST {}", staged.source.display()));
    ctx.advance(Stage::ManifestStaged);
    Ok(staged)
}

/// Writes the staged manifest and runs the installer against the staging
/// root, committing both as one layer.
///
/// Installer caches go to a scratch directory outside the image, and the
/// installer's known cache paths are purged before the layer is captured.
///
/// # Errors
///
/// Returns `DependencyResolution` if any requirement cannot be satisfied;
/// no layer is committed in that case.
pub fn install_dependencies(
    ctx: &mut BuildContext,
    staged: &StagedManifest,
    installer: &dyn DependencyInstaller,
) -> Result<()> {
    ctx.enter(
        "INSTALL",
        |s| s == Stage::ManifestStaged,
        "must follow MANIFEST",
    )?;
    let fingerprint = installer.fingerprint()?;
    let instruction = format!(
        "MANIFEST {} && INSTALL ({})",
        staged.image_path.display(),
        installer.name()
    );
    let inputs = [
        staged.digest.clone(),
        Sha256Hash::of_bytes(fingerprint.as_bytes()),
    ];

    let tmp_dir = ctx.storage().root().join("tmp");
    let _ = ctx.run_step(
        &instruction,
        &inputs,
        |root| {
            let manifest_host = staging_path(root, &staged.image_path)?;
            copy::remove_existing(&manifest_host)?;
            std::fs::write(&manifest_host, &staged.bytes)
                .map_err(|e| BerthError::io(&manifest_host, e))?;
            copy::set_mode(&manifest_host, 0o644)?;

            let cache = tempfile::Builder::new()
                .prefix("installer-cache-")
                .tempdir_in(&tmp_dir)
                .map_err(|e| BerthError::io(&tmp_dir, e))?;
            tracing::info!(installer = installer.name(), requirements = staged.manifest.len(), "installing dependencies");
            installer.install(&InstallRequest {
                manifest: &staged.manifest,
                manifest_path: &manifest_host,
                rootfs: root,
                cache_dir: cache.path(),
            })?;
            purge_caches(root, &installer.cache_paths())
        },
        |(), _| None,
    )?;
    ctx.advance(Stage::DependenciesInstalled);
    Ok(())
}

/// Copies `source` from the build context to `dest` in the image.
///
/// `dest` is relative to the working directory unless absolute. Entries
/// matched by `.berthignore` are skipped. Later copies shadow anything an
/// earlier step wrote at the same path.
///
/// # Errors
///
/// Returns `InvalidPath` if `source` is missing or escapes the build
/// context, or `dest` escapes the image root.
pub fn materialize_source_tree(ctx: &mut BuildContext, source: &Path, dest: &Path) -> Result<()> {
    ctx.enter(
        "COPY",
        |s| matches!(s, Stage::DependenciesInstalled | Stage::SourceCopied),
        "must follow INSTALL and precede ACCOUNT",
    )?;
    let src_host = resolve_in_context(ctx.context_dir(), source)?;
    let workdir = ctx.working_dir.clone().unwrap_or_else(|| PathBuf::from("/"));
    let dest_image = normalize_image_path(&workdir.join(dest))?;
    let into_dir = dest.as_os_str().to_string_lossy().ends_with('/');

    let filter = ContextFilter::load(ctx.context_dir())?;
    let context_dir = ctx.context_dir().to_path_buf();
    let skip = |path: &Path, is_dir: bool| {
        path.strip_prefix(&context_dir)
            .is_ok_and(|rel| filter.is_ignored(rel, is_dir))
    };
    let digest = tree_digest(&src_host, &skip)?;
    let instruction = format!("COPY {} {}", source.display(), dest_image.display());

    let _ = ctx.run_step(
        &instruction,
        std::slice::from_ref(&digest),
        |root| {
            let target = staging_path(root, &dest_image)?;
            if src_host.is_dir() {
                let copied = copy::copy_tree(&src_host, &target, &skip)?;
                tracing::info!(entries = copied, dest = %dest_image.display(), "source tree copied");
                return Ok(());
            }
            let existing_dir = std::fs::symlink_metadata(&target).is_ok_and(|md| md.is_dir());
            let target = if into_dir || existing_dir {
                staging_path(root, &dest_image.join(src_host.file_name().unwrap_or_default()))?
            } else {
                target
            };
            copy::copy_entry(&src_host, &target)
        },
        |(), _| None,
    )?;
    ctx.advance(Stage::SourceCopied);
    Ok(())
}

/// Creates the unprivileged account in the image.
///
/// # Errors
///
/// Returns `AccountExists` if the name is already present in the image
/// (base accounts included), unless the step is served from the cache.
pub fn create_account(ctx: &mut BuildContext, name: &str) -> Result<AccountOutcome> {
    ctx.enter(
        "ACCOUNT",
        |s| s == Stage::SourceCopied,
        "must follow COPY",
    )?;
    account::validate_name(name)?;
    let instruction = format!("ACCOUNT {name}");
    let home_key = format!("home/{name}");

    let created = ctx.run_step(
        &instruction,
        &[],
        |root| {
            copy::ensure_dir(&root.join("etc"))?;
            copy::ensure_dir(&root.join("home"))?;
            account::provision(root, name)
        },
        |account: &Account, path| {
            (path == home_key).then_some(Owner {
                uid: account.uid,
                gid: account.gid,
            })
        },
    )?;

    let outcome = match created {
        Some(account) => AccountOutcome::Created(account),
        None => {
            let db = AccountDatabase::load(ctx.staging_root())?;
            let account = db.lookup(name).cloned().ok_or_else(|| BerthError::NotFound {
                kind: "account",
                id: name.to_string(),
            })?;
            AccountOutcome::AlreadyPresentFromCache(account)
        }
    };
    tracing::info!(name, uid = outcome.account().uid, cached = outcome.is_cached(), "account ready");
    ctx.account = Some(outcome.account().clone());
    ctx.advance(Stage::AccountCreated);
    Ok(outcome)
}

/// Switches the build identity to the named account. One-way.
///
/// # Errors
///
/// Returns `IdentityLocked` if the identity was already switched, and
/// `NotFound` if the account does not exist in the image.
pub fn switch_identity(ctx: &mut BuildContext, name: &str) -> Result<()> {
    if ctx.identity.is_switched() {
        return Err(BerthError::IdentityLocked {
            current: ctx.identity().name.clone(),
            requested: name.to_string(),
        });
    }
    ctx.enter(
        "USER",
        |s| s == Stage::AccountCreated,
        "must follow ACCOUNT",
    )?;
    let db = AccountDatabase::load(ctx.staging_root())?;
    let account = db.lookup(name).ok_or_else(|| BerthError::NotFound {
        kind: "account",
        id: name.to_string(),
    })?;
    ctx.identity.switch_to(Identity::from(account))?;
    ctx.record_metadata(format!("USER {name}"));
    ctx.advance(Stage::IdentitySwitched);
    Ok(())
}

/// Adds an environment variable to the image config.
///
/// # Errors
///
/// Returns `Config` for an invalid name and `StepOrder` before `WORKDIR`.
pub fn set_env(ctx: &mut BuildContext, key: &str, value: &str) -> Result<()> {
    ctx.enter(
        "ENV",
        |s| s >= Stage::WorkingDirectory,
        "must follow WORKDIR",
    )?;
    if !berth_recipe::envfile::is_valid_key(key) {
        return Err(BerthError::Config {
            message: format!("invalid environment variable name `{key}`"),
        });
    }
    ctx.env.push((key.to_string(), value.to_string()));
    ctx.record_metadata(format!("ENV {key}"));
    Ok(())
}

/// Records the exec-form entry command.
///
/// # Errors
///
/// Returns `StepOrder` unless the identity has been switched.
pub fn set_entry_command(ctx: &mut BuildContext, argv: EntryCommand) -> Result<()> {
    ctx.enter(
        "CMD",
        |s| s == Stage::IdentitySwitched,
        "must follow USER",
    )?;
    ctx.record_metadata(format!("CMD {argv}"));
    ctx.entry_command = Some(argv);
    ctx.advance(Stage::EntryCommandSet);
    Ok(())
}

/// Audits access, seals the image config, and persists it.
///
/// # Errors
///
/// Returns `StepOrder` if mandatory steps are missing and `AccessDenied` if
/// the account cannot use content written by earlier steps.
pub fn finish(ctx: BuildContext) -> Result<BuiltImage> {
    ctx.enter(
        "finish",
        |s| s == Stage::EntryCommandSet,
        "requires every mandatory step",
    )?;
    let who = ctx.identity().clone();
    let entries = berth_image::image::merged_entries(ctx.storage(), ctx.step_layers())?;
    let denied = berth_core::access::audit(&entries, &who);
    if !denied.is_empty() {
        return Err(BerthError::AccessDenied {
            account: who.name,
            paths: denied,
        });
    }

    let BuildContext {
        storage,
        base,
        layers,
        working_dir,
        entry_command,
        env,
        log,
        ..
    } = ctx;
    let (Some(working_dir), Some(entry_command)) = (working_dir, entry_command) else {
        return Err(BerthError::StepOrder {
            step: "finish",
            reason: "requires WORKDIR and CMD".into(),
        });
    };
    let config = ImageConfig {
        base,
        layers,
        working_dir,
        entry_command,
        user: who.name,
        env,
    };
    let id = config.id()?;
    storage.save_image(&id, &config)?;
    tracing::info!(id = %id.short(), layers = config.layers.len(), "image sealed");
    Ok(BuiltImage { id, config, log })
}

/// Lexically normalizes an absolute image path.
///
/// # Errors
///
/// Returns `InvalidPath` for relative paths and `..` escaping the root.
pub fn normalize_image_path(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(BerthError::InvalidPath {
            path: path.to_path_buf(),
            reason: "must be absolute".into(),
        });
    }
    let mut clean = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => clean.push(part),
            Component::ParentDir => {
                if !clean.pop() {
                    return Err(BerthError::InvalidPath {
                        path: path.to_path_buf(),
                        reason: "escapes the image root".into(),
                    });
                }
            }
            Component::Prefix(_) => {
                return Err(BerthError::InvalidPath {
                    path: path.to_path_buf(),
                    reason: "unsupported path prefix".into(),
                });
            }
        }
    }
    Ok(clean)
}

/// Maps an absolute image path onto the staging root.
fn host_path(root: &Path, image_path: &Path) -> PathBuf {
    root.join(image_path.strip_prefix("/").unwrap_or(image_path))
}

/// Like [`host_path`], for paths a step is about to write. Existing parents
/// must be real directories so the write cannot leave the staging root.
fn staging_path(root: &Path, image_path: &Path) -> Result<PathBuf> {
    layer::reject_symlinked_parents(root, image_path)?;
    Ok(host_path(root, image_path))
}

/// Resolves a context-relative path, rejecting anything outside the context.
fn resolve_in_context(context_dir: &Path, rel: &Path) -> Result<PathBuf> {
    if rel.is_absolute() {
        return Err(BerthError::InvalidPath {
            path: rel.to_path_buf(),
            reason: "must be relative to the build context".into(),
        });
    }
    let joined = context_dir.join(rel);
    let resolved = std::fs::canonicalize(&joined).map_err(|_| BerthError::InvalidPath {
        path: rel.to_path_buf(),
        reason: "does not exist in the build context".into(),
    })?;
    if !resolved.starts_with(context_dir) {
        return Err(BerthError::InvalidPath {
            path: rel.to_path_buf(),
            reason: "escapes the build context".into(),
        });
    }
    Ok(resolved)
}

fn purge_caches(root: &Path, paths: &[PathBuf]) -> Result<()> {
    for rel in paths {
        let path = staging_path(root, rel)?;
        if std::fs::symlink_metadata(&path).is_ok() {
            tracing::debug!(path = %rel.display(), "purging installer cache");
            copy::remove_existing(&path)?;
        }
    }
    Ok(())
}

/// Digest of a source tree as the copy step will see it.
fn tree_digest(src: &Path, skip: &dyn Fn(&Path, bool) -> bool) -> Result<Sha256Hash> {
    let mut hasher = Sha256::new();
    hash_entry(src, Path::new(""), skip, &mut hasher)?;
    Ok(Sha256Hash::from_hasher(hasher))
}

fn hash_entry(
    path: &Path,
    rel: &Path,
    skip: &dyn Fn(&Path, bool) -> bool,
    hasher: &mut Sha256,
) -> Result<()> {
    let meta = berth_image::snapshot::describe(path)?;
    let mode = berth_core::access::normalize_mode(meta.kind, meta.mode);
    hasher.update(rel.to_string_lossy().as_bytes());
    hasher.update(format!("\0{:?}\0{mode:o}\0", meta.kind).as_bytes());
    if let Some(digest) = &meta.digest {
        hasher.update(digest.as_hex().as_bytes());
    }
    if let Some(target) = &meta.link_target {
        hasher.update(target.to_string_lossy().as_bytes());
    }
    hasher.update([b'\n']);

    if path.is_dir() && !path.is_symlink() {
        let mut children: Vec<PathBuf> = std::fs::read_dir(path)
            .map_err(|e| BerthError::io(path, e))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<_>>()
            .map_err(|e| BerthError::io(path, e))?;
        children.sort();
        for child in children {
            let is_dir = child.is_dir() && !child.is_symlink();
            if skip(&child, is_dir) {
                continue;
            }
            let name = child.file_name().map(PathBuf::from).unwrap_or_default();
            hash_entry(&child, &rel.join(name), skip, hasher)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_paths_normalize_lexically() {
        assert_eq!(
            normalize_image_path(Path::new("/app/./src/../lib")).expect("normalize"),
            PathBuf::from("/app/lib")
        );
        assert_eq!(
            normalize_image_path(Path::new("/")).expect("root"),
            PathBuf::from("/")
        );
        assert!(matches!(
            normalize_image_path(Path::new("app")),
            Err(BerthError::InvalidPath { .. })
        ));
        assert!(matches!(
            normalize_image_path(Path::new("/../etc")),
            Err(BerthError::InvalidPath { .. })
        ));
    }

    #[test]
    fn context_paths_cannot_escape() {
        let outer = tempfile::tempdir().expect("tempdir");
        let context = outer.path().join("ctx");
        std::fs::create_dir_all(&context).expect("mkdir");
        std::fs::write(outer.path().join("secret"), "x").expect("write");
        std::fs::write(context.join("ok"), "x").expect("write");
        let context = std::fs::canonicalize(&context).expect("canonicalize");

        assert!(resolve_in_context(&context, Path::new("ok")).is_ok());
        assert!(resolve_in_context(&context, Path::new("../secret")).is_err());
        assert!(resolve_in_context(&context, Path::new("/etc/passwd")).is_err());
        assert!(resolve_in_context(&context, Path::new("missing")).is_err());
    }

    #[test]
    fn tree_digest_ignores_skipped_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("main.py"), "print()").expect("write");
        let before = tree_digest(dir.path(), &|_, _| false).expect("digest");

        std::fs::write(dir.path().join("debug.log"), "noise").expect("write");
        let skip_logs = |p: &Path, _: bool| p.extension().is_some_and(|e| e == "log");
        assert_eq!(before, tree_digest(dir.path(), &skip_logs).expect("digest"));
        assert_ne!(before, tree_digest(dir.path(), &|_, _| false).expect("digest"));
    }
}
