//! Mount descriptions returned by the snapshotter.
//!
//! A snapshot is never accessed directly: callers receive the list of
//! mounts that, when activated, expose its filesystem.

use std::path::{Path, PathBuf};

use recast_common::error::{RecastError, Result};
use recast_core::filesystem::{mount, overlayfs};
use serde::{Deserialize, Serialize};

/// Kind of a [`Mount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    /// A bind of an existing directory.
    Bind,
    /// An `OverlayFS` stack.
    Overlay,
}

/// A single mount needed to expose a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount type.
    pub kind: MountKind,
    /// Source directory for binds; `overlay` for overlays.
    pub source: PathBuf,
    /// Mount options (`ro`, `lowerdir=...`, ...).
    pub options: Vec<String>,
}

impl Mount {
    /// Describes a bind of `source`.
    #[must_use]
    pub fn bind(source: impl Into<PathBuf>, readonly: bool) -> Self {
        let options = if readonly {
            vec!["ro".to_owned(), "rbind".to_owned()]
        } else {
            vec!["rw".to_owned(), "rbind".to_owned()]
        };
        Self {
            kind: MountKind::Bind,
            source: source.into(),
            options,
        }
    }

    /// Describes an overlay with pre-rendered options.
    #[must_use]
    pub fn overlay(options: Vec<String>) -> Self {
        Self {
            kind: MountKind::Overlay,
            source: PathBuf::from("overlay"),
            options,
        }
    }

    /// Returns `true` if the mount exposes its filesystem read-only.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        match self.kind {
            MountKind::Bind => self.options.iter().any(|o| o == "ro"),
            MountKind::Overlay => !self.options.iter().any(|o| o.starts_with("upperdir=")),
        }
    }

    /// Mounts onto `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying mount call fails.
    pub fn mount_at(&self, target: &Path) -> Result<()> {
        match self.kind {
            MountKind::Bind => mount::bind_mount(&self.source, target, self.is_readonly()),
            MountKind::Overlay => overlayfs::mount_overlay(&self.options, target),
        }
    }
}

/// A mount set made accessible as a plain directory.
///
/// Bind mounts resolve to their source directory without any kernel
/// mount; overlays are mounted on a private temporary directory and
/// detached on drop.
#[derive(Debug)]
pub struct ActiveMount {
    root: PathBuf,
    mounted: Option<tempfile::TempDir>,
}

impl ActiveMount {
    /// Activates a single-mount set.
    ///
    /// # Errors
    ///
    /// Returns an error if the set does not hold exactly one mount or the
    /// overlay cannot be mounted.
    pub fn activate(mounts: &[Mount]) -> Result<Self> {
        let [mount] = mounts else {
            return Err(RecastError::Config {
                message: format!("expected exactly one mount, got {}", mounts.len()),
            });
        };
        match mount.kind {
            MountKind::Bind => Ok(Self {
                root: mount.source.clone(),
                mounted: None,
            }),
            MountKind::Overlay => {
                let dir = tempfile::Builder::new()
                    .prefix("recast-mount-")
                    .tempdir()
                    .map_err(|e| RecastError::io(std::env::temp_dir(), e))?;
                mount.mount_at(dir.path())?;
                Ok(Self {
                    root: dir.path().to_path_buf(),
                    mounted: Some(dir),
                })
            }
        }
    }

    /// Directory exposing the mounted filesystem.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }
}

impl Drop for ActiveMount {
    fn drop(&mut self) {
        if let Some(dir) = self.mounted.take() {
            if let Err(e) = overlayfs::unmount_overlay(dir.path()) {
                tracing::warn!(target = %dir.path().display(), error = %e, "failed to unmount temporary mount");
                // Leave the directory behind rather than deleting through a live mount.
                let _ = dir.keep();
            }
        }
    }
}

/// Runs `f` with the mount set available as a directory.
///
/// # Errors
///
/// Returns an error if activation fails, or whatever `f` returns.
pub fn with_temp_mount<T>(mounts: &[Mount], f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
    let active = ActiveMount::activate(mounts)?;
    f(active.path())
}
