//! # recast
//!
//! Builds layered container images from declarative recipes.
//! Single binary for importing base images, building recipes, and
//! managing the local image store.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

mod commands;

use clap::Parser;
use recast_runtime::cancel::CancelToken;

use crate::commands::{Cli, LogFormat};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, cancelling");
        handler_token.cancel();
    })?;

    commands::execute(cli, &cancel)
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
