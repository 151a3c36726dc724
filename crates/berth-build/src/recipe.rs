//! Recipe-driven builds.
//!
//! Reads a `Berthfile`, opens a [`BuildContext`] on the declared base, and
//! dispatches each directive to the matching pipeline step.

use std::path::{Path, PathBuf};

use berth_common::constants::{RECIPE_FILE, SCRATCH_BASE};
use berth_common::error::{BerthError, Result};
use berth_image::registry::{ImageCatalog, ImageEntry};
use berth_image::storage::StorageBackend;
use berth_recipe::parser::ast::InstructionKind;
use berth_recipe::parser::parse_recipe;

use crate::context::BuildContext;
use crate::installer::DependencyInstaller;
use crate::pipeline::{self, BuiltImage, StagedManifest};

/// Options of one recipe build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Build context directory.
    pub context_dir: PathBuf,
    /// Recipe path; defaults to `Berthfile` inside the context.
    pub recipe_path: Option<PathBuf>,
    /// Tag to register the image under.
    pub tag: String,
    /// Base override, taking precedence over `FROM`.
    pub base: Option<String>,
    /// Disables step-cache lookups.
    pub no_cache: bool,
}

impl BuildOptions {
    /// Creates options for `context_dir` tagged `tag`.
    pub fn new(context_dir: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        Self {
            context_dir: context_dir.into(),
            recipe_path: None,
            tag: tag.into(),
            base: None,
            no_cache: false,
        }
    }

    fn recipe_file(&self) -> PathBuf {
        self.recipe_path
            .clone()
            .unwrap_or_else(|| self.context_dir.join(RECIPE_FILE))
    }
}

/// A built and registered image.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// The sealed image with its build log.
    pub image: BuiltImage,
    /// The catalog entry it was registered as.
    pub entry: ImageEntry,
}

/// Builds the recipe described by `options` and registers the result.
///
/// # Errors
///
/// Returns the first error of parsing, any pipeline step, or registration.
/// Nothing is registered when the build fails.
pub fn build_recipe(
    storage: StorageBackend,
    catalog: &ImageCatalog,
    options: &BuildOptions,
    installer: &dyn DependencyInstaller,
) -> Result<BuildOutcome> {
    let recipe_file = options.recipe_file();
    let text = std::fs::read_to_string(&recipe_file).map_err(|e| BerthError::io(&recipe_file, e))?;
    let recipe = parse_recipe(&recipe_file.display().to_string(), &text)?;

    let base = options
        .base
        .as_deref()
        .or_else(|| recipe.base())
        .unwrap_or(SCRATCH_BASE)
        .to_string();
    tracing::info!(
        recipe = %recipe_file.display(),
        tag = %options.tag,
        base = %base,
        steps = recipe.instructions.len(),
        "starting build"
    );

    let mut ctx = BuildContext::new(storage, &options.context_dir, &base)?.with_cache(!options.no_cache);
    let mut staged: Option<StagedManifest> = None;
    for instruction in &recipe.instructions {
        tracing::debug!(line = instruction.line, directive = instruction.kind.keyword(), "dispatching");
        match &instruction.kind {
            InstructionKind::From(_) => {}
            InstructionKind::Workdir(path) => pipeline::set_working_directory(&mut ctx, path)?,
            InstructionKind::Manifest(path) => {
                staged = Some(pipeline::materialize_manifest(&mut ctx, path)?);
            }
            InstructionKind::Install => {
                let manifest = staged.as_ref().ok_or(BerthError::StepOrder {
                    step: "INSTALL",
                    reason: "must follow MANIFEST".into(),
                })?;
                pipeline::install_dependencies(&mut ctx, manifest, installer)?;
            }
            InstructionKind::Copy { src, dest } => {
                pipeline::materialize_source_tree(&mut ctx, src, dest)?;
            }
            InstructionKind::Account(name) => {
                let _ = pipeline::create_account(&mut ctx, name)?;
            }
            InstructionKind::User(name) => pipeline::switch_identity(&mut ctx, name)?,
            InstructionKind::Env(vars) => {
                for (key, value) in vars {
                    pipeline::set_env(&mut ctx, key, value)?;
                }
            }
            InstructionKind::Cmd(argv) => pipeline::set_entry_command(&mut ctx, argv.clone())?,
        }
    }

    let image = pipeline::finish(ctx)?;
    let entry = ImageEntry {
        id: image.id.clone(),
        tag: options.tag.clone(),
        layers: image.config.layers.iter().map(|l| l.digest.clone()).collect(),
        size_bytes: image.config.size_bytes(),
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    catalog.register(entry.clone())?;
    tracing::info!(
        id = %image.id.short(),
        tag = %options.tag,
        cached = image.log.cached_steps(),
        "build finished"
    );
    Ok(BuildOutcome { image, entry })
}

/// Returns the default recipe path of a build context.
#[must_use]
pub fn default_recipe_path(context_dir: &Path) -> PathBuf {
    context_dir.join(RECIPE_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipe_path_defaults_to_context() {
        let options = BuildOptions::new("/ctx", "bot");
        assert_eq!(options.recipe_file(), PathBuf::from("/ctx/Berthfile"));
        assert_eq!(default_recipe_path(Path::new("/ctx")), options.recipe_file());
    }

    #[test]
    fn missing_recipe_is_io_error() {
        let data = tempfile::tempdir().expect("tempdir");
        let ctx = tempfile::tempdir().expect("tempdir");
        let storage = StorageBackend::open(data.path()).expect("storage");
        let catalog = ImageCatalog::open(data.path()).expect("catalog");
        let installer = crate::installer::IndexInstaller::new(ctx.path());
        let err = build_recipe(storage, &catalog, &BuildOptions::new(ctx.path(), "bot"), &installer)
            .expect_err("no recipe");
        assert!(matches!(err, BerthError::Io { .. }));
        assert!(catalog.list().expect("list").is_empty());
    }
}
