//! Bind mounts for stage container setup.
//!
//! Used to expose the recipes directory and the workspace-backed scratch
//! directories inside a stage container's root filesystem.

use std::path::Path;

use recast_common::error::{RecastError, Result};

/// Creates a recursive bind mount from `source` onto `target`.
///
/// The target directory is created if missing. When `readonly` is set the
/// bind is remounted read-only, since the kernel ignores `MS_RDONLY` on the
/// initial bind.
///
/// # Errors
///
/// Returns an error if the target cannot be created or a `mount(2)` call fails.
#[cfg(target_os = "linux")]
pub fn bind_mount(source: &Path, target: &Path, readonly: bool) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    std::fs::create_dir_all(target).map_err(|e| RecastError::io(target, e))?;

    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| RecastError::Config {
        message: format!(
            "bind mount {} -> {} failed: {e}",
            source.display(),
            target.display()
        ),
    })?;

    if readonly {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| RecastError::Config {
            message: format!("read-only remount of {} failed: {e}", target.display()),
        })?;
    }

    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        readonly,
        "bind mount created"
    );
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: bind mounts require Linux.
#[cfg(not(target_os = "linux"))]
pub fn bind_mount(_source: &Path, _target: &Path, _readonly: bool) -> Result<()> {
    Err(RecastError::Config {
        message: "Linux required for bind mounts".into(),
    })
}

/// Detaches whatever is mounted at `target`.
///
/// # Errors
///
/// Returns an error if the `umount2(2)` call fails.
#[cfg(target_os = "linux")]
pub fn unmount(target: &Path) -> Result<()> {
    nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH).map_err(|e| {
        RecastError::Config {
            message: format!("unmount of {} failed: {e}", target.display()),
        }
    })?;
    tracing::debug!(target = %target.display(), "unmounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: unmounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn unmount(_target: &Path) -> Result<()> {
    Err(RecastError::Config {
        message: "Linux required for unmount".into(),
    })
}
