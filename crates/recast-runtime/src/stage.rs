//! The contract between a build and whatever executes its stages.

use std::collections::BTreeMap;
use std::path::PathBuf;

use recast_common::error::Result;
use recast_common::types::{ContainerId, Stage};
use recast_image::mount::Mount;

use crate::cancel::CancelToken;

/// An extra mount made visible inside a stage container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Host directory.
    pub source: PathBuf,
    /// Absolute in-container path.
    pub destination: String,
    /// Whether the container may write through the mount.
    pub readonly: bool,
}

impl MountSpec {
    /// Describes a writable bind.
    #[must_use]
    pub fn writable(source: impl Into<PathBuf>, destination: &str) -> Self {
        Self {
            source: source.into(),
            destination: destination.to_owned(),
            readonly: false,
        }
    }

    /// Describes a read-only bind.
    #[must_use]
    pub fn readonly(source: impl Into<PathBuf>, destination: &str) -> Self {
        Self {
            source: source.into(),
            destination: destination.to_owned(),
            readonly: true,
        }
    }
}

/// Everything needed to run one stage container.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// Identifier of this ephemeral container.
    pub id: ContainerId,
    /// Which stage is being run.
    pub stage: Stage,
    /// Mounts exposing the writable build snapshot.
    pub rootfs: Vec<Mount>,
    /// Additional mounts layered over the root filesystem.
    pub mounts: Vec<MountSpec>,
    /// In-container program to invoke.
    pub entry_point: String,
    /// Arguments passed to the entry point.
    pub args: Vec<String>,
    /// `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    /// Share the host network namespace.
    pub host_network: bool,
}

impl StageSpec {
    /// Renders the entry point and its arguments as a shell command line.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.entry_point.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Executes stage containers.
///
/// Implementations block until the container exits and return its exit
/// status. A container that cannot be launched is an error, not a
/// non-zero status.
pub trait StageRunner: Send + Sync {
    /// Runs `spec` to completion.
    ///
    /// # Errors
    ///
    /// Returns `StageExecution` if the container cannot be launched or is
    /// killed by a signal, and `Cancelled` if `cancel` fires while it runs.
    fn run(&self, spec: &StageSpec, cancel: &CancelToken) -> Result<i32>;
}

/// Merges `KEY=VALUE` lists; a later entry replaces an earlier one with
/// the same key while keeping the key's first position.
#[must_use]
pub fn merge_env<'a>(layers: impl IntoIterator<Item = &'a [String]>) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    let mut values: BTreeMap<String, String> = BTreeMap::new();
    for entry in layers.into_iter().flatten() {
        let key = entry.split_once('=').map_or(entry.as_str(), |(key, _)| key);
        if values.insert(key.to_owned(), entry.clone()).is_none() {
            order.push(key.to_owned());
        }
    }
    order
        .into_iter()
        .filter_map(|key| values.remove(&key))
        .collect()
}

fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '=' | ':' | ','));
    if plain {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
