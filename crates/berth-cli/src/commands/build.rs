//! `berth build` — Build an image from a Berthfile.

use std::path::PathBuf;

use berth_build::installer;
use berth_build::recipe::{BuildOptions, build_recipe};
use berth_common::config::BerthConfig;
use berth_image::registry::ImageCatalog;
use berth_image::storage::StorageBackend;
use clap::Args;

/// Arguments for the `build` command.
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Build context directory.
    #[arg(default_value = ".")]
    pub context: PathBuf,

    /// Tag to register the image under.
    #[arg(short, long)]
    pub tag: String,

    /// Recipe file (defaults to `Berthfile` in the context).
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Base filesystem, overriding `FROM` (`scratch`, `file://DIR`, `tar://ARCHIVE`).
    #[arg(long)]
    pub base: Option<String>,

    /// Execute every step even when a cached layer exists.
    #[arg(long)]
    pub no_cache: bool,

    /// Dependency installer (`index:DIR` or `command:ARGV`).
    #[arg(long, env = "BERTH_INSTALLER")]
    pub installer: Option<String>,
}

/// Executes the `build` command.
///
/// Prints the step log to stderr and the image id to stdout.
///
/// # Errors
///
/// Returns an error if any build step fails.
pub fn execute(args: BuildArgs, config: &BerthConfig) -> anyhow::Result<()> {
    let installer_spec = args
        .installer
        .clone()
        .or_else(|| config.installer.clone())
        .unwrap_or_else(|| format!("index:{}", config.data_dir.join("index").display()));
    let installer = installer::from_spec(&installer_spec)?;

    let storage = StorageBackend::open(&config.data_dir)?;
    let catalog = ImageCatalog::open(&config.data_dir)?;
    let options = BuildOptions {
        context_dir: args.context,
        recipe_path: args.file,
        tag: args.tag,
        base: args.base,
        no_cache: args.no_cache,
    };
    tracing::info!(installer = %installer_spec, "building");

    let outcome = build_recipe(storage, &catalog, &options, installer.as_ref())?;
    for record in outcome.image.log.records() {
        eprintln!("{record}");
    }
    eprintln!(
        "Built {} ({} layers, {}) tagged {}",
        outcome.image.id.short(),
        outcome.image.config.layers.len(),
        crate::output::format_bytes(outcome.entry.size_bytes),
        outcome.entry.tag
    );
    println!("{}", outcome.image.id);
    Ok(())
}
