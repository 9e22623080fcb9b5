//! CLI command definitions and dispatch.

pub mod build;
pub mod gc;
pub mod images;
pub mod import;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use recast_common::config::{RecastConfig, SnapshotDriver};
use recast_image::Store;
use recast_runtime::cancel::CancelToken;

/// Build layered container images from recipes.
#[derive(Parser, Debug)]
#[command(name = "recast", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Data directory holding content, snapshots, and image records.
    #[arg(long, global = true, env = "RECAST_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Snapshot driver, overriding the configuration file.
    #[arg(long, global = true)]
    pub snapshotter: Option<SnapshotDriver>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build recipes into images.
    Build(build::BuildArgs),
    /// Import a base image from a local directory or archive.
    Import(import::ImportArgs),
    /// List or remove images.
    Images(images::ImagesArgs),
    /// Delete content no image or lease references.
    Gc(gc::GcArgs),
}

impl Cli {
    /// Loads the configuration, applying command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed.
    pub fn config(&self) -> anyhow::Result<RecastConfig> {
        let data_dir = self
            .data_dir
            .clone()
            .unwrap_or_else(|| recast_common::constants::data_dir().clone());
        let mut config = RecastConfig::load(&data_dir)
            .with_context(|| format!("loading configuration from {}", data_dir.display()))?;
        if let Some(driver) = self.snapshotter {
            config.snapshot_driver = driver;
        }
        Ok(config)
    }
}

/// Opens the store described by `config`.
///
/// # Errors
///
/// Returns an error if the store cannot be opened.
pub fn open_store(config: &RecastConfig) -> anyhow::Result<Store> {
    Store::open(config).with_context(|| format!("opening store at {}", config.data_dir.display()))
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli, cancel: &CancelToken) -> anyhow::Result<()> {
    let config = cli.config()?;
    match cli.command {
        Command::Build(args) => build::execute(args, &config, cancel),
        Command::Import(args) => import::execute(args, &config),
        Command::Images(args) => images::execute(args, &config),
        Command::Gc(args) => gc::execute(args, &config),
    }
}

/// Renders a byte count with the largest binary unit that keeps it at or
/// above one, e.g. `3.5 MiB`.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
