//! Per-build scratch workspaces.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use recast_common::constants::SCRATCH_MOUNTS;
use recast_common::error::{RecastError, Result};

use crate::stage::MountSpec;

/// Scratch directory owned by one build.
///
/// Holds the host side of every scratch mount. [`Workspace::destroy`]
/// reports removal failures; dropping the workspace removes it silently.
#[derive(Debug)]
pub struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    /// Allocates a fresh workspace under `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or its scratch sub-directories
    /// cannot be created.
    pub fn create(base: &Path) -> Result<Self> {
        std::fs::create_dir_all(base).map_err(|e| RecastError::io(base, e))?;
        let dir = tempfile::Builder::new()
            .prefix("recast-")
            .tempdir_in(base)
            .map_err(|e| RecastError::io(base, e))?;
        for (name, _) in SCRATCH_MOUNTS {
            let path = dir.path().join(name);
            std::fs::create_dir(&path).map_err(|e| RecastError::io(&path, e))?;
            // Sticky and world-writable like a real /tmp.
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o1777))
                .map_err(|e| RecastError::io(&path, e))?;
        }
        tracing::debug!(path = %dir.path().display(), "workspace allocated");
        Ok(Self { dir })
    }

    /// Host path of the workspace.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writable mounts backing the in-container scratch directories.
    #[must_use]
    pub fn scratch_mounts(&self) -> Vec<MountSpec> {
        SCRATCH_MOUNTS
            .iter()
            .map(|(name, destination)| MountSpec::writable(self.path().join(name), destination))
            .collect()
    }

    /// Removes the workspace and everything in it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory tree cannot be removed.
    pub fn destroy(self) -> Result<()> {
        let path = self.path().to_path_buf();
        self.dir.close().map_err(|e| RecastError::io(&path, e))?;
        tracing::debug!(path = %path.display(), "workspace destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_mounts_point_into_workspace() {
        let base = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::create(base.path()).expect("create");
        let mounts = workspace.scratch_mounts();
        assert_eq!(mounts.len(), SCRATCH_MOUNTS.len());
        for mount in &mounts {
            assert!(mount.source.starts_with(workspace.path()));
            assert!(mount.source.is_dir());
            assert!(!mount.readonly);
        }
        assert!(mounts.iter().any(|m| m.destination == "/tmp"));
    }

    #[test]
    fn destroy_removes_directory() {
        let base = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::create(base.path()).expect("create");
        let path = workspace.path().to_path_buf();
        std::fs::write(path.join("tmp/file"), b"x").expect("write");
        workspace.destroy().expect("destroy");
        assert!(!path.exists());
    }

    #[test]
    fn drop_removes_directory() {
        let base = tempfile::tempdir().expect("tempdir");
        let path = Workspace::create(base.path()).expect("create").path().to_path_buf();
        assert!(!path.exists());
    }
}
