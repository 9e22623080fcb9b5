//! `recast gc`: delete unreferenced content.

use clap::Args;
use recast_common::config::RecastConfig;

use super::human_size;

/// Arguments for the `gc` command.
#[derive(Args, Debug)]
pub struct GcArgs {}

/// Executes the `gc` command.
///
/// # Errors
///
/// Returns an error if collection fails.
pub fn execute(_args: GcArgs, config: &RecastConfig) -> anyhow::Result<()> {
    let store = super::open_store(config)?;
    let summary = store.garbage_collect()?;
    println!(
        "Removed {} blobs, reclaimed {}",
        summary.removed,
        human_size(summary.reclaimed_bytes)
    );
    Ok(())
}
