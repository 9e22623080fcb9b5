//! Advisory file locks.
//!
//! Locks are `flock`s on files that stay on disk. The kernel drops a lock
//! when its holder closes the file or dies, so a crashed process never
//! leaves a name or the store locked.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use recast_common::error::{RecastError, Result};

/// A held lock; released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Blocks until the exclusive lock on `path` is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or locked.
    pub fn exclusive(path: &Path) -> Result<Self> {
        let file = open(path)?;
        file.lock_exclusive().map_err(|e| RecastError::io(path, e))?;
        Ok(Self::held(file, path))
    }

    /// Blocks until a shared lock on `path` is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or locked.
    pub fn shared(path: &Path) -> Result<Self> {
        let file = open(path)?;
        FileExt::lock_shared(&file).map_err(|e| RecastError::io(path, e))?;
        Ok(Self::held(file, path))
    }

    /// Takes the exclusive lock on `path` if nobody else holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or locking fails
    /// for a reason other than contention.
    pub fn try_exclusive(path: &Path) -> Result<Option<Self>> {
        let file = open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self::held(file, path))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(RecastError::io(path, e)),
        }
    }

    fn held(file: File, path: &Path) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
        }
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), error = %e, "unlock failed; closing releases it");
        }
    }
}

fn open(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| RecastError::io(path, e))
}
