//! Local image records.
//!
//! Maps image names to the descriptor of their manifest. Each record is a
//! separate JSON file named after the digest of the image name, so
//! records for different names never contend. Changes to one name are
//! serialized through a per-name `flock`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use recast_common::error::{RecastError, Result};
use recast_common::types::Digest;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::lock::FileLock;
use crate::manifest::Descriptor;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// A name → manifest binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Fully qualified image name (`repository:tag`).
    pub name: String,
    /// Descriptor of the image's manifest.
    pub target: Descriptor,
    /// When the name was first registered.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(name: impl Into<String>, target: Descriptor) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            target,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Image record store rooted at `<data_dir>/images`.
#[derive(Debug, Clone)]
pub struct ImageRecords {
    root: PathBuf,
    lock_timeout: Duration,
}

impl ImageRecords {
    /// Opens the record store.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn open(data_dir: &Path, lock_timeout: Duration) -> Result<Self> {
        let records = Self {
            root: data_dir.join("images"),
            lock_timeout,
        };
        for dir in [records.records_dir(), records.locks_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| RecastError::io(&dir, e))?;
        }
        Ok(records)
    }

    fn records_dir(&self) -> PathBuf {
        self.root.join("records")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn record_path(&self, name: &str) -> PathBuf {
        let id = Digest::from_bytes(name.as_bytes());
        self.records_dir().join(format!("{}.json", id.as_hex()))
    }

    /// Looks up an image by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no image has this name.
    pub fn get(&self, name: &str) -> Result<ImageRecord> {
        self.find(name)?.ok_or_else(|| RecastError::NotFound {
            kind: "image",
            id: name.to_owned(),
        })
    }

    /// Looks up an image by name, returning `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read.
    pub fn find(&self, name: &str) -> Result<Option<ImageRecord>> {
        let path = self.record_path(name);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RecastError::io(path, e)),
        }
    }

    /// Lists all images, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the record directory cannot be read.
    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        let dir = self.records_dir();
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| RecastError::io(&dir, e))? {
            let path = entry.map_err(|e| RecastError::io(&dir, e))?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match std::fs::read(&path) {
                Ok(bytes) => records.push(serde_json::from_slice::<ImageRecord>(&bytes)?),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(RecastError::io(path, e)),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Registers a new name.
    ///
    /// # Errors
    ///
    /// Fails if the name is already registered.
    pub fn create(&self, record: &ImageRecord) -> Result<()> {
        let dir = self.records_dir();
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| RecastError::io(&dir, e))?;
        tmp.write_all(&serde_json::to_vec_pretty(record)?)
            .map_err(|e| RecastError::io(tmp.path(), e))?;
        let path = self.record_path(&record.name);
        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                tracing::debug!(name = %record.name, digest = %record.target.digest, "image record created");
                Ok(())
            }
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RecastError::Config {
                    message: format!("image {} already exists", record.name),
                })
            }
            Err(e) => Err(RecastError::io(path, e.error)),
        }
    }

    /// Removes a name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no image has this name.
    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.record_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(name, "image record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RecastError::NotFound {
                kind: "image",
                id: name.to_owned(),
            }),
            Err(e) => Err(RecastError::io(path, e)),
        }
    }

    /// Points `record.name` at a new manifest, creating the name if needed.
    ///
    /// Runs under the name's lock: the previous record, if any, is deleted
    /// and the new one created. The original creation time is kept.
    /// Returns the replaced record.
    ///
    /// # Errors
    ///
    /// Returns `Lock` if the name stays locked past the timeout, or an
    /// error from deleting or creating the record.
    pub fn replace(&self, mut record: ImageRecord) -> Result<Option<ImageRecord>> {
        let _lock = self.lock(&record.name)?;
        let previous = self.find(&record.name)?;
        if let Some(old) = &previous {
            record.created_at = old.created_at;
            self.delete(&old.name)?;
        }
        record.updated_at = Utc::now();
        self.create(&record)?;
        tracing::info!(
            name = %record.name,
            digest = %record.target.digest,
            replaced = previous.is_some(),
            "image registered"
        );
        Ok(previous)
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        let id = Digest::from_bytes(name.as_bytes());
        self.locks_dir().join(format!("{}.lock", id.as_hex()))
    }

    /// Acquires the exclusive lock for `name`.
    ///
    /// The lock is a `flock` on a per-name file, so it is released when
    /// the holder exits even if it never gets to drop the guard.
    ///
    /// # Errors
    ///
    /// Returns `Lock` if the lock is still held after the configured timeout.
    pub fn lock(&self, name: &str) -> Result<NameLock> {
        let path = self.lock_path(name);
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            if let Some(lock) = FileLock::try_exclusive(&path)? {
                tracing::debug!(name, "name lock acquired");
                return Ok(NameLock {
                    _lock: lock,
                    name: name.to_owned(),
                });
            }
            if Instant::now() >= deadline {
                return Err(RecastError::Lock {
                    name: name.to_owned(),
                    message: format!(
                        "still held after {}ms ({})",
                        self.lock_timeout.as_millis(),
                        path.display()
                    ),
                });
            }
            std::thread::sleep(LOCK_RETRY_INTERVAL);
        }
    }
}

/// Exclusive hold on an image name; released on drop.
#[derive(Debug)]
pub struct NameLock {
    _lock: FileLock,
    name: String,
}

impl NameLock {
    /// Name this lock guards.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
