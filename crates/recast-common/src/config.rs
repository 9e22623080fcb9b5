//! Global configuration model for recast.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RecastError, Result};

/// Backing implementation of the snapshotter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotDriver {
    /// Every snapshot is a full directory copy of its parent. Works unprivileged.
    #[default]
    Native,
    /// Snapshots are `OverlayFS` upper directories over their parent chain. Requires root.
    Overlay,
}

impl fmt::Display for SnapshotDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::Overlay => f.write_str("overlay"),
        }
    }
}

impl FromStr for SnapshotDriver {
    type Err = RecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "native" => Ok(Self::Native),
            "overlay" => Ok(Self::Overlay),
            other => Err(RecastError::Config {
                message: format!("unknown snapshot driver: {other}"),
            }),
        }
    }
}

/// Root configuration for recast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecastConfig {
    /// Base directory for the content store, snapshots, and image records.
    pub data_dir: PathBuf,
    /// Directory under which per-build scratch workspaces are created.
    pub workspace_base: PathBuf,
    /// Prefix applied to locally-scoped image names (e.g. `myorg/`).
    pub image_prefix: String,
    /// Tag used when a build does not specify one.
    pub default_tag: String,
    /// Snapshotter implementation.
    pub snapshot_driver: SnapshotDriver,
    /// Seconds to wait for a per-image-name lock before failing.
    pub lock_timeout_secs: u64,
}

impl Default for RecastConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::constants::data_dir().clone(),
            workspace_base: PathBuf::from(crate::constants::DEFAULT_WORKSPACE_BASE),
            image_prefix: String::new(),
            default_tag: crate::constants::DEFAULT_TAG.to_owned(),
            snapshot_driver: SnapshotDriver::default(),
            lock_timeout_secs: crate::constants::DEFAULT_LOCK_TIMEOUT_SECS,
        }
    }
}

impl RecastConfig {
    /// Loads `config.json` from the given data directory.
    ///
    /// A missing file yields the defaults with `data_dir` set to the given
    /// directory. Fields absent from the file keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(crate::constants::CONFIG_FILE_NAME);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self {
                data_dir: data_dir.to_path_buf(),
                ..Self::default()
            });
        }
        let content = std::fs::read_to_string(&path).map_err(|e| RecastError::io(&path, e))?;
        let mut config: Self = serde_json::from_str(&content)?;
        if config.data_dir.as_os_str().is_empty() {
            config.data_dir = data_dir.to_path_buf();
        }
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Returns the tag to build with, falling back to the configured default.
    #[must_use]
    pub fn tag_or_default<'a>(&'a self, tag: &'a str) -> &'a str {
        if tag.is_empty() { &self.default_tag } else { tag }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_without_file_uses_defaults_for_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RecastConfig::load(dir.path()).expect("load");
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.default_tag, "latest");
        assert_eq!(config.snapshot_driver, SnapshotDriver::Native);
    }

    #[test]
    fn load_merges_partial_file_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"image_prefix": "myorg/", "snapshot_driver": "overlay"}"#,
        )
        .expect("write");
        let config = RecastConfig::load(dir.path()).expect("load");
        assert_eq!(config.image_prefix, "myorg/");
        assert_eq!(config.snapshot_driver, SnapshotDriver::Overlay);
        assert_eq!(config.lock_timeout_secs, 30);
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("config.json"), "{not json").expect("write");
        assert!(RecastConfig::load(dir.path()).is_err());
    }

    #[test]
    fn tag_or_default_prefers_explicit_tag() {
        let config = RecastConfig::default();
        assert_eq!(config.tag_or_default(""), "latest");
        assert_eq!(config.tag_or_default("v2"), "v2");
    }

    #[test]
    fn snapshot_driver_parses_known_names() {
        assert_eq!("native".parse::<SnapshotDriver>().expect("parse"), SnapshotDriver::Native);
        assert!("zfs".parse::<SnapshotDriver>().is_err());
    }
}
