//! `OverlayFS` management for layered snapshots.
//!
//! Stacks a snapshot's committed parent chain as read-only lower layers,
//! optionally with a writable upper layer for active snapshots.

use std::path::{Path, PathBuf};

use recast_common::error::{RecastError, Result};

/// Configuration for an `OverlayFS` mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Read-only lower layers, topmost first.
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer and its work directory. `None` yields a read-only mount.
    pub upper: Option<(PathBuf, PathBuf)>,
}

impl OverlayConfig {
    /// Renders the mount options understood by the kernel.
    ///
    /// A read-only overlay needs at least two lower directories; callers
    /// with a single read-only layer should bind-mount it instead.
    #[must_use]
    pub fn options(&self) -> Vec<String> {
        let lowers = self
            .lower_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let mut opts = vec![format!("lowerdir={lowers}")];
        if let Some((upper, work)) = &self.upper {
            opts.push(format!("upperdir={}", upper.display()));
            opts.push(format!("workdir={}", work.display()));
        }
        opts
    }
}

/// Mounts an overlay at `target` with pre-rendered options.
///
/// Creates the target directory if it does not exist.
///
/// # Errors
///
/// Returns an error if directory creation or the mount syscall fails.
#[cfg(target_os = "linux")]
pub fn mount_overlay(options: &[String], target: &Path) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    std::fs::create_dir_all(target).map_err(|e| RecastError::io(target, e))?;

    let data = options.join(",");
    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(data.as_str()),
    )
    .map_err(|e| RecastError::Config {
        message: format!("overlay mount at {} failed: {e}", target.display()),
    })?;

    tracing::debug!(target = %target.display(), "overlayfs mounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: `OverlayFS` mounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_overlay(_options: &[String], _target: &Path) -> Result<()> {
    Err(RecastError::Config {
        message: "Linux required for overlay snapshots".into(),
    })
}

/// Unmounts an `OverlayFS` at the given path.
///
/// # Errors
///
/// Returns an error if the unmount syscall fails.
pub fn unmount_overlay(target: &Path) -> Result<()> {
    crate::filesystem::mount::unmount(target)
}
