//! `berth images` — Manage the local image catalog.

use berth_common::config::BerthConfig;
use berth_image::registry::ImageCatalog;
use berth_image::storage::StorageBackend;
use clap::Args;

use crate::output;

/// Arguments for the `images` command.
#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Remove an image by tag or id prefix.
    #[arg(long)]
    pub remove: Option<String>,
}

/// Executes the `images` command.
///
/// # Errors
///
/// Returns an error if catalog operations fail.
pub fn execute(args: &ImagesArgs, config: &BerthConfig) -> anyhow::Result<()> {
    let catalog = ImageCatalog::open(&config.data_dir)?;

    if let Some(reference) = &args.remove {
        let entry = catalog.resolve(reference)?;
        catalog.remove(&entry.id)?;
        StorageBackend::open(&config.data_dir)?.remove_image(&entry.id)?;
        println!("Removed {}", entry.id);
        return Ok(());
    }

    let images = catalog.list()?;
    if images.is_empty() {
        println!("No images found.");
        return Ok(());
    }
    println!(
        "{:<14} {:<20} {:<8} {:<12} {:<25}",
        "IMAGE ID", "TAG", "LAYERS", "SIZE", "CREATED"
    );
    for image in &images {
        println!(
            "{:<14} {:<20} {:<8} {:<12} {:<25}",
            image.id.short(),
            image.tag,
            image.layers.len(),
            output::format_bytes(image.size_bytes),
            image.created_at
        );
    }
    Ok(())
}
