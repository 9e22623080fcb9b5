//! Snapshotter: named copy-on-write filesystem instances.
//!
//! Snapshots are identified by opaque string keys. Active snapshots are
//! writable, views are read-only, and committed snapshots are immutable
//! parents for further snapshots. Committed snapshots created by unpacking
//! are named after the chain identity of the layers they contain.
//!
//! Two drivers share one metadata layout:
//! - `native` copies the parent's tree into each new active snapshot and
//!   works without privileges;
//! - `overlay` stacks the committed parent chain under an empty upper
//!   directory and requires `OverlayFS` mount rights.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use recast_common::config::SnapshotDriver;
use recast_common::error::{RecastError, Result, SnapshotOp};
use recast_common::types::Digest;
use recast_core::filesystem::overlayfs::OverlayConfig;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::mount::Mount;

/// Lifecycle state of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Writable, not yet committed.
    Active,
    /// Read-only view of a committed snapshot.
    View,
    /// Immutable; may be the parent of other snapshots.
    Committed,
}

/// Metadata of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Key the snapshot is addressed by.
    pub key: String,
    /// Storage identifier of the snapshot's data directory.
    pub id: String,
    /// Lifecycle state.
    pub kind: SnapshotKind,
    /// Key of the committed parent, if any.
    pub parent: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Snapshot store rooted at `<data_dir>/snapshots`.
#[derive(Debug, Clone)]
pub struct Snapshotter {
    root: PathBuf,
    driver: SnapshotDriver,
}

fn snapshot_error(op: SnapshotOp, key: &str, message: impl Into<String>) -> RecastError {
    RecastError::Snapshot {
        op,
        key: key.to_owned(),
        message: message.into(),
    }
}

impl Snapshotter {
    /// Opens the snapshot store.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn open(data_dir: &Path, driver: SnapshotDriver) -> Result<Self> {
        let snapshotter = Self {
            root: data_dir.join("snapshots"),
            driver,
        };
        for dir in [
            snapshotter.metadata_dir(),
            snapshotter.data_dir(),
            snapshotter.ingest_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| RecastError::io(&dir, e))?;
        }
        tracing::debug!(root = %snapshotter.root.display(), %driver, "snapshotter opened");
        Ok(snapshotter)
    }

    /// Driver backing this store.
    #[must_use]
    pub const fn driver(&self) -> SnapshotDriver {
        self.driver
    }

    fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    fn ingest_dir(&self) -> PathBuf {
        self.root.join("ingest")
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        let name = Digest::from_bytes(key.as_bytes());
        self.metadata_dir().join(format!("{}.json", name.as_hex()))
    }

    fn fs_dir(&self, id: &str) -> PathBuf {
        self.data_dir().join(id).join("fs")
    }

    fn work_dir(&self, id: &str) -> PathBuf {
        self.data_dir().join(id).join("work")
    }

    /// Returns `true` if a snapshot with this key exists.
    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.metadata_path(key).is_file()
    }

    /// Reads a snapshot's metadata.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no snapshot has this key.
    pub fn stat(&self, key: &str) -> Result<SnapshotInfo> {
        let path = self.metadata_path(key);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| snapshot_error(SnapshotOp::Stat, key, e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RecastError::NotFound {
                kind: "snapshot",
                id: key.to_owned(),
            }),
            Err(e) => Err(RecastError::io(path, e)),
        }
    }

    /// Creates a writable snapshot on top of an optional committed parent.
    ///
    /// # Errors
    ///
    /// Fails if the key is taken, the parent is not committed, or the
    /// snapshot directory cannot be populated.
    pub fn prepare(&self, key: &str, parent: Option<&str>) -> Result<Vec<Mount>> {
        self.create(SnapshotOp::Prepare, SnapshotKind::Active, key, parent)
    }

    /// Creates a read-only view of an optional committed parent.
    ///
    /// # Errors
    ///
    /// Fails if the key is taken or the parent is not committed.
    pub fn view(&self, key: &str, parent: Option<&str>) -> Result<Vec<Mount>> {
        self.create(SnapshotOp::View, SnapshotKind::View, key, parent)
    }

    fn create(
        &self,
        op: SnapshotOp,
        kind: SnapshotKind,
        key: &str,
        parent: Option<&str>,
    ) -> Result<Vec<Mount>> {
        if key.is_empty() {
            return Err(snapshot_error(op, key, "empty snapshot key"));
        }
        let parent_info = match parent {
            Some(parent) => {
                let info = self.stat(parent).map_err(|e| {
                    snapshot_error(op, key, format!("parent '{parent}' unavailable: {e}"))
                })?;
                if info.kind != SnapshotKind::Committed {
                    return Err(snapshot_error(
                        op,
                        key,
                        format!("parent '{parent}' is not committed"),
                    ));
                }
                Some(info)
            }
            None => None,
        };

        let info = SnapshotInfo {
            key: key.to_owned(),
            id: uuid::Uuid::new_v4().simple().to_string(),
            kind,
            parent: parent.map(str::to_owned),
            created_at: Utc::now(),
        };
        let fs = self.fs_dir(&info.id);
        let work = self.work_dir(&info.id);
        for dir in [&fs, &work] {
            std::fs::create_dir_all(dir).map_err(|e| RecastError::io(dir, e))?;
        }

        let populated = match (&parent_info, self.driver, kind) {
            (Some(parent), SnapshotDriver::Native, SnapshotKind::Active) => {
                copy_tree(&self.fs_dir(&parent.id), &fs)
            }
            _ => Ok(()),
        };
        let published = populated.and_then(|()| self.publish(op, &info));
        if let Err(e) = published {
            let _ = std::fs::remove_dir_all(self.data_dir().join(&info.id));
            return Err(e);
        }

        tracing::debug!(key, parent = ?parent, ?kind, "snapshot created");
        self.mounts_for(&info)
    }

    /// Writes a metadata record, failing if the key already exists.
    fn publish(&self, op: SnapshotOp, info: &SnapshotInfo) -> Result<()> {
        let ingest = self.ingest_dir();
        let mut tmp = NamedTempFile::new_in(&ingest).map_err(|e| RecastError::io(&ingest, e))?;
        tmp.write_all(&serde_json::to_vec(info)?)
            .map_err(|e| RecastError::io(tmp.path(), e))?;
        let path = self.metadata_path(&info.key);
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(snapshot_error(op, &info.key, "snapshot already exists"))
            }
            Err(e) => Err(RecastError::io(path, e.error)),
        }
    }

    /// Returns the mounts exposing an existing snapshot.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown key.
    pub fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let info = self.stat(key)?;
        self.mounts_for(&info)
    }

    fn mounts_for(&self, info: &SnapshotInfo) -> Result<Vec<Mount>> {
        let own = self.fs_dir(&info.id);
        let mount = match (self.driver, info.kind) {
            (SnapshotDriver::Native, SnapshotKind::Active) => Mount::bind(own, false),
            (SnapshotDriver::Native, SnapshotKind::Committed) => Mount::bind(own, true),
            (SnapshotDriver::Native, SnapshotKind::View) => match &info.parent {
                Some(parent) => Mount::bind(self.fs_dir(&self.stat(parent)?.id), true),
                None => Mount::bind(own, true),
            },
            (SnapshotDriver::Overlay, SnapshotKind::Active) => {
                let lower_dirs = self.lower_dirs(info.parent.as_deref())?;
                if lower_dirs.is_empty() {
                    Mount::bind(own, false)
                } else {
                    Mount::overlay(
                        OverlayConfig {
                            lower_dirs,
                            upper: Some((own, self.work_dir(&info.id))),
                        }
                        .options(),
                    )
                }
            }
            (SnapshotDriver::Overlay, kind) => {
                let top = if kind == SnapshotKind::Committed {
                    Some(info.key.as_str())
                } else {
                    info.parent.as_deref()
                };
                let lower_dirs = self.lower_dirs(top)?;
                match lower_dirs.as_slice() {
                    [] => Mount::bind(own, true),
                    [single] => Mount::bind(single.clone(), true),
                    _ => Mount::overlay(
                        OverlayConfig {
                            lower_dirs,
                            upper: None,
                        }
                        .options(),
                    ),
                }
            }
        };
        Ok(vec![mount])
    }

    /// Data directories of a committed chain, topmost first.
    fn lower_dirs(&self, top: Option<&str>) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut next = top.map(str::to_owned);
        while let Some(key) = next {
            let info = self.stat(&key)?;
            dirs.push(self.fs_dir(&info.id));
            next = info.parent;
        }
        Ok(dirs)
    }

    /// Turns an active snapshot into a committed one named `name`.
    ///
    /// The active key stops existing once the commit succeeds.
    ///
    /// # Errors
    ///
    /// Fails if `key` is not active or `name` is already taken.
    pub fn commit(&self, name: &str, key: &str) -> Result<()> {
        let info = self
            .stat(key)
            .map_err(|e| snapshot_error(SnapshotOp::Commit, key, e.to_string()))?;
        if info.kind != SnapshotKind::Active {
            return Err(snapshot_error(
                SnapshotOp::Commit,
                key,
                "only active snapshots can be committed",
            ));
        }
        let committed = SnapshotInfo {
            key: name.to_owned(),
            kind: SnapshotKind::Committed,
            created_at: Utc::now(),
            ..info
        };
        self.publish(SnapshotOp::Commit, &committed)?;
        let path = self.metadata_path(key);
        std::fs::remove_file(&path).map_err(|e| RecastError::io(path, e))?;
        tracing::debug!(key, name, "snapshot committed");
        Ok(())
    }

    /// Deletes a snapshot and its data.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown key, or a snapshot error if a
    /// committed snapshot still has children.
    pub fn remove(&self, key: &str) -> Result<()> {
        let info = self.stat(key)?;
        if info.kind == SnapshotKind::Committed {
            let children = self
                .list()?
                .into_iter()
                .filter(|s| s.parent.as_deref() == Some(key))
                .count();
            if children > 0 {
                return Err(snapshot_error(
                    SnapshotOp::Remove,
                    key,
                    format!("snapshot has {children} dependent snapshot(s)"),
                ));
            }
        }
        let path = self.metadata_path(key);
        std::fs::remove_file(&path).map_err(|e| RecastError::io(path, e))?;
        let data = self.data_dir().join(&info.id);
        if let Err(e) = std::fs::remove_dir_all(&data) {
            tracing::warn!(key, path = %data.display(), error = %e, "failed to remove snapshot data");
        }
        tracing::debug!(key, "snapshot removed");
        Ok(())
    }

    /// Lists all snapshots, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata directory cannot be read.
    pub fn list(&self) -> Result<Vec<SnapshotInfo>> {
        let dir = self.metadata_dir();
        let mut infos = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| RecastError::io(&dir, e))? {
            let path = entry.map_err(|e| RecastError::io(&dir, e))?.path();
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                // Removed between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(RecastError::io(path, e)),
            };
            infos.push(serde_json::from_slice::<SnapshotInfo>(&bytes)?);
        }
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }
}

/// Recursively copies `src` into the existing directory `dst`, keeping
/// symlinks, permissions, and ownership.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    for entry in std::fs::read_dir(src).map_err(|e| RecastError::io(src, e))? {
        let entry = entry.map_err(|e| RecastError::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&from).map_err(|e| RecastError::io(&from, e))?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            std::fs::create_dir(&to).map_err(|e| RecastError::io(&to, e))?;
            copy_tree(&from, &to)?;
            std::fs::set_permissions(&to, meta.permissions()).map_err(|e| RecastError::io(&to, e))?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(&from).map_err(|e| RecastError::io(&from, e))?;
            std::os::unix::fs::symlink(&target, &to).map_err(|e| RecastError::io(&to, e))?;
        } else if file_type.is_file() {
            let _ = std::fs::copy(&from, &to).map_err(|e| RecastError::io(&to, e))?;
        } else {
            tracing::warn!(path = %from.display(), "skipping special file in snapshot copy");
            continue;
        }

        let copied = std::fs::symlink_metadata(&to).map_err(|e| RecastError::io(&to, e))?;
        if copied.uid() != meta.uid() || copied.gid() != meta.gid() {
            std::os::unix::fs::lchown(&to, Some(meta.uid()), Some(meta.gid()))
                .map_err(|e| RecastError::io(&to, e))?;
        }
    }
    Ok(())
}
