//! Leases: temporary holds that keep fresh content out of garbage collection.
//!
//! Each lease is a directory under `leases/` containing a `lease.json`
//! record and one empty marker file per protected blob. Marker files are
//! created before the blob becomes visible, so a collector running in
//! between never sees an unprotected new blob.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use recast_common::error::{RecastError, Result};
use recast_common::types::Digest;
use serde::{Deserialize, Serialize};

const LEASE_RECORD: &str = "lease.json";

/// Age after which an abandoned lease no longer protects anything.
pub const LEASE_EXPIRY_HOURS: i64 = 24;

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    id: String,
    created_at: DateTime<Utc>,
}

/// Creates and enumerates leases.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    root: PathBuf,
}

impl LeaseManager {
    /// Opens the lease directory under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: &Path) -> Result<Self> {
        let root = root.join("leases");
        std::fs::create_dir_all(&root).map_err(|e| RecastError::io(&root, e))?;
        Ok(Self { root })
    }

    /// Creates a new lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease directory or record cannot be written.
    pub fn create(&self) -> Result<Lease> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.root.join(&id);
        std::fs::create_dir(&dir).map_err(|e| RecastError::io(&dir, e))?;
        let record = LeaseRecord {
            id: id.clone(),
            created_at: Utc::now(),
        };
        let path = dir.join(LEASE_RECORD);
        std::fs::write(&path, serde_json::to_vec(&record)?).map_err(|e| RecastError::io(&path, e))?;
        tracing::debug!(lease = %id, "lease created");
        Ok(Lease {
            id,
            dir,
            released: false,
        })
    }

    /// Returns every blob protected by a live lease.
    ///
    /// Leases older than [`LEASE_EXPIRY_HOURS`] are deleted instead of
    /// being counted.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease directory cannot be read.
    pub fn protected_resources(&self) -> Result<BTreeSet<Digest>> {
        let mut resources = BTreeSet::new();
        let cutoff = Utc::now() - Duration::hours(LEASE_EXPIRY_HOURS);
        for entry in std::fs::read_dir(&self.root).map_err(|e| RecastError::io(&self.root, e))? {
            let dir = entry.map_err(|e| RecastError::io(&self.root, e))?.path();
            if is_expired(&dir, cutoff) {
                tracing::warn!(lease = %dir.display(), "removing expired lease");
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    tracing::warn!(lease = %dir.display(), error = %e, "failed to remove expired lease");
                }
                continue;
            }
            let Ok(markers) = std::fs::read_dir(&dir) else {
                continue;
            };
            for marker in markers.flatten() {
                let name = marker.file_name();
                if let Ok(digest) = Digest::from_hex(name.to_string_lossy().into_owned()) {
                    let _ = resources.insert(digest);
                }
            }
        }
        Ok(resources)
    }

    /// Lists the ids of all existing leases.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease directory cannot be read.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(|e| RecastError::io(&self.root, e))? {
            let entry = entry.map_err(|e| RecastError::io(&self.root, e))?;
            ids.push(entry.file_name().to_string_lossy().into_owned());
        }
        ids.sort();
        Ok(ids)
    }
}

fn is_expired(dir: &Path, cutoff: DateTime<Utc>) -> bool {
    std::fs::read(dir.join(LEASE_RECORD))
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LeaseRecord>(&bytes).ok())
        .is_some_and(|record| record.created_at < cutoff)
}

/// A held lease. Released explicitly with [`Lease::release`] or on drop.
#[derive(Debug)]
pub struct Lease {
    id: String,
    dir: PathBuf,
    released: bool,
}

impl Lease {
    /// Lease identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Protects a blob for the lifetime of this lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker file cannot be created.
    pub fn add_resource(&self, digest: &Digest) -> Result<()> {
        let marker = self.dir.join(digest.as_hex());
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&marker)
            .map_err(|e| RecastError::io(&marker, e))?;
        Ok(())
    }

    /// Releases the lease; its blobs become collectable unless referenced.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease directory cannot be removed.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        std::fs::remove_dir_all(&self.dir).map_err(|e| RecastError::io(&self.dir, e))?;
        tracing::debug!(lease = %self.id, "lease released");
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            tracing::warn!(lease = %self.id, error = %e, "failed to release lease");
        }
    }
}
