//! `recast images`: list or remove images.

use clap::Args;
use recast_common::config::RecastConfig;

use super::human_size;

/// Arguments for the `images` command.
#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Remove an image by name. Its content is reclaimed by `recast gc`.
    #[arg(long, value_name = "NAME")]
    pub remove: Option<String>,
}

/// Executes the `images` command.
///
/// # Errors
///
/// Returns an error if the image records cannot be read or removal fails.
pub fn execute(args: ImagesArgs, config: &RecastConfig) -> anyhow::Result<()> {
    let store = super::open_store(config)?;
    if let Some(name) = args.remove {
        store.remove_image(&name)?;
        println!("Removed {name}");
        return Ok(());
    }

    let records = store.images().list()?;
    if records.is_empty() {
        println!("No images found.");
        return Ok(());
    }
    println!("{:<40} {:<14} {:<7} {:<10} {:<20}", "NAME", "DIGEST", "LAYERS", "SIZE", "UPDATED");
    for record in &records {
        let (layers, size) = match store.read_manifest(&record.target) {
            Ok(manifest) => (
                manifest.layers.len().to_string(),
                human_size(manifest.layers.iter().map(|l| l.size).sum()),
            ),
            Err(e) => {
                tracing::warn!(image = %record.name, error = %e, "unreadable manifest");
                ("-".to_owned(), "-".to_owned())
            }
        };
        let hex = record.target.digest.as_hex();
        println!(
            "{:<40} {:<14} {:<7} {:<10} {:<20}",
            record.name,
            &hex[..hex.len().min(12)],
            layers,
            size,
            record.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
