//! Digest-addressed content store.
//!
//! Blobs live under `content/blobs/sha256/<hex>` with a sidecar
//! `content/info/<hex>.json` carrying size, labels, and creation time.
//! Writes stream into `content/ingest/` and are renamed into place only
//! after the digest has been verified and the blob has been added to a
//! lease.
//!
//! Publishing a blob holds `content/gc.lock` shared; garbage collection
//! holds it exclusively for its whole mark and sweep.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use recast_common::error::{RecastError, Result};
use recast_common::types::Digest;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::hash::HashingWriter;
use crate::lease::Lease;
use crate::lock::FileLock;

const GC_LOCK: &str = "gc.lock";

/// Metadata recorded for each blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    /// Digest of the blob bytes.
    pub digest: Digest,
    /// Blob size in bytes.
    pub size: u64,
    /// Free-form labels (uncompressed digest, gc references).
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// When the blob was first committed.
    pub created_at: DateTime<Utc>,
}

/// Content store rooted at `<data_dir>/content`.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Opens the content store, creating its directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let store = Self {
            root: data_dir.join("content"),
        };
        for dir in [store.blobs_dir(), store.info_dir(), store.ingest_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| RecastError::io(&dir, e))?;
        }
        Ok(store)
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join(Digest::ALGORITHM)
    }

    fn info_dir(&self) -> PathBuf {
        self.root.join("info")
    }

    fn ingest_dir(&self) -> PathBuf {
        self.root.join("ingest")
    }

    /// Blocks until no blob is being published and keeps new ones out
    /// until the returned lock is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be locked.
    pub fn lock_for_collection(&self) -> Result<FileLock> {
        FileLock::exclusive(&self.root.join(GC_LOCK))
    }

    fn lock_for_publish(&self) -> Result<FileLock> {
        FileLock::shared(&self.root.join(GC_LOCK))
    }

    /// Path of a blob on disk.
    #[must_use]
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.as_hex())
    }

    fn info_path(&self, digest: &Digest) -> PathBuf {
        self.info_dir().join(format!("{}.json", digest.as_hex()))
    }

    /// Returns `true` if the blob is present.
    #[must_use]
    pub fn exists(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Starts streaming a new blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the ingest file cannot be created.
    pub fn writer(&self) -> Result<BlobWriter> {
        let ingest = self.ingest_dir();
        let file = NamedTempFile::new_in(&ingest).map_err(|e| RecastError::io(&ingest, e))?;
        Ok(BlobWriter {
            store: self.clone(),
            inner: HashingWriter::new(file),
        })
    }

    /// Writes a complete in-memory blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be written or committed.
    pub fn write_blob(
        &self,
        bytes: &[u8],
        labels: BTreeMap<String, String>,
        lease: &Lease,
    ) -> Result<ContentInfo> {
        let mut writer = self.writer()?;
        writer
            .write_all(bytes)
            .map_err(|e| RecastError::io(self.ingest_dir(), e))?;
        writer.commit(None, labels, lease)
    }

    /// Reads a blob's metadata.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the blob is unknown.
    pub fn info(&self, digest: &Digest) -> Result<ContentInfo> {
        let path = self.info_path(digest);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RecastError::NotFound {
                kind: "blob",
                id: digest.to_string(),
            }),
            Err(e) => Err(RecastError::io(path, e)),
        }
    }

    /// Reads a whole blob and verifies its digest.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the blob is missing or `HashMismatch` if its
    /// bytes no longer match the digest.
    pub fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RecastError::NotFound {
                    kind: "blob",
                    id: digest.to_string(),
                });
            }
            Err(e) => return Err(RecastError::io(path, e)),
        };
        let actual = Digest::from_bytes(&bytes);
        if &actual != digest {
            return Err(RecastError::HashMismatch {
                resource: path.display().to_string(),
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(bytes)
    }

    /// Opens a blob for streaming reads.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the blob is missing.
    pub fn open_blob(&self, digest: &Digest) -> Result<std::fs::File> {
        let path = self.blob_path(digest);
        std::fs::File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RecastError::NotFound {
                    kind: "blob",
                    id: digest.to_string(),
                }
            } else {
                RecastError::io(path, e)
            }
        })
    }

    /// Merges labels into a blob's metadata.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the blob is unknown.
    pub fn add_labels(&self, digest: &Digest, labels: BTreeMap<String, String>) -> Result<ContentInfo> {
        let mut info = self.info(digest)?;
        info.labels.extend(labels);
        self.write_info(&info)?;
        Ok(info)
    }

    /// Lists every blob's metadata, ordered by digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the info directory cannot be read.
    pub fn list(&self) -> Result<Vec<ContentInfo>> {
        let dir = self.info_dir();
        let mut infos = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| RecastError::io(&dir, e))? {
            let path = entry.map_err(|e| RecastError::io(&dir, e))?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = std::fs::read(&path).map_err(|e| RecastError::io(&path, e))?;
            match serde_json::from_slice::<ContentInfo>(&bytes) {
                Ok(info) => infos.push(info),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable content info"),
            }
        }
        infos.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(infos)
    }

    /// Deletes a blob and its metadata, returning the bytes reclaimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the files exist but cannot be removed.
    pub fn delete(&self, digest: &Digest) -> Result<u64> {
        let blob = self.blob_path(digest);
        let size = std::fs::metadata(&blob).map(|m| m.len()).unwrap_or(0);
        for path in [blob, self.info_path(digest)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(RecastError::io(path, e)),
            }
        }
        tracing::debug!(digest = %digest, size, "blob deleted");
        Ok(size)
    }

    fn write_info(&self, info: &ContentInfo) -> Result<()> {
        let ingest = self.ingest_dir();
        let mut tmp = NamedTempFile::new_in(&ingest).map_err(|e| RecastError::io(&ingest, e))?;
        tmp.write_all(&serde_json::to_vec(info)?)
            .map_err(|e| RecastError::io(tmp.path(), e))?;
        let path = self.info_path(&info.digest);
        let _ = tmp.persist(&path).map_err(|e| RecastError::io(&path, e.error))?;
        Ok(())
    }
}

/// Streaming writer for a new blob.
#[derive(Debug)]
pub struct BlobWriter {
    store: ContentStore,
    inner: HashingWriter<NamedTempFile>,
}

impl BlobWriter {
    /// Bytes written so far.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.inner.written()
    }

    /// Verifies and publishes the blob.
    ///
    /// The blob is added to `lease` before it becomes visible. Committing
    /// content that already exists succeeds and merges `labels` into the
    /// existing metadata.
    ///
    /// # Errors
    ///
    /// Returns `HashMismatch` if `expected` is given and differs from the
    /// written bytes, or an I/O error if publishing fails.
    pub fn commit(
        self,
        expected: Option<&Digest>,
        labels: BTreeMap<String, String>,
        lease: &Lease,
    ) -> Result<ContentInfo> {
        let (file, digest, size) = self.inner.finish();
        file.as_file()
            .sync_all()
            .map_err(|e| RecastError::io(file.path(), e))?;
        if let Some(expected) = expected.filter(|expected| *expected != &digest) {
            return Err(RecastError::HashMismatch {
                resource: "ingested blob".to_owned(),
                expected: expected.to_string(),
                actual: digest.to_string(),
            });
        }

        let store = self.store;
        let _publishing = store.lock_for_publish()?;
        lease.add_resource(&digest)?;

        if store.exists(&digest) {
            tracing::debug!(digest = %digest, "blob already present");
            return match store.info(&digest) {
                Ok(_) => store.add_labels(&digest, labels),
                Err(e) if e.is_not_found() => {
                    let info = new_info(digest, size, labels);
                    store.write_info(&info)?;
                    Ok(info)
                }
                Err(e) => Err(e),
            };
        }

        let info = new_info(digest, size, labels);
        store.write_info(&info)?;
        let target = store.blob_path(&info.digest);
        if let Err(e) = file.persist_noclobber(&target) {
            if e.error.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(RecastError::io(target, e.error));
            }
        }
        tracing::debug!(digest = %info.digest, size, "blob committed");
        Ok(info)
    }
}

fn new_info(digest: Digest, size: u64, labels: BTreeMap<String, String>) -> ContentInfo {
    ContentInfo {
        digest,
        size,
        labels,
        created_at: Utc::now(),
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseManager;

    fn setup() -> (tempfile::TempDir, ContentStore, LeaseManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = ContentStore::open(dir.path()).expect("content");
        let leases = LeaseManager::open(dir.path()).expect("leases");
        (dir, content, leases)
    }

    #[test]
    fn write_then_read_blob() {
        let (_dir, content, leases) = setup();
        let lease = leases.create().expect("lease");
        let info = content
            .write_blob(b"payload", BTreeMap::new(), &lease)
            .expect("write");
        assert_eq!(info.digest, Digest::from_bytes(b"payload"));
        assert_eq!(info.size, 7);
        assert_eq!(content.read_blob(&info.digest).expect("read"), b"payload");
        assert!(leases.protected_resources().expect("resources").contains(&info.digest));
    }

    #[test]
    fn commit_rejects_unexpected_digest() {
        let (_dir, content, leases) = setup();
        let lease = leases.create().expect("lease");
        let mut writer = content.writer().expect("writer");
        writer.write_all(b"actual").expect("write");
        let err = writer
            .commit(Some(&Digest::from_bytes(b"other")), BTreeMap::new(), &lease)
            .unwrap_err();
        assert!(matches!(err, RecastError::HashMismatch { .. }));
        assert!(!content.exists(&Digest::from_bytes(b"actual")));
    }

    #[test]
    fn rewriting_existing_blob_merges_labels() {
        let (_dir, content, leases) = setup();
        let lease = leases.create().expect("lease");
        let first = BTreeMap::from([("a".to_owned(), "1".to_owned())]);
        let second = BTreeMap::from([("b".to_owned(), "2".to_owned())]);
        let _ = content.write_blob(b"same", first, &lease).expect("first");
        let info = content.write_blob(b"same", second, &lease).expect("second");
        assert_eq!(info.labels.len(), 2);
        assert_eq!(content.list().expect("list").len(), 1);
    }

    #[test]
    fn missing_blob_is_not_found() {
        let (_dir, content, _leases) = setup();
        let digest = Digest::from_bytes(b"nothing");
        assert!(content.read_blob(&digest).unwrap_err().is_not_found());
        assert!(content.info(&digest).unwrap_err().is_not_found());
    }

    #[test]
    fn corrupted_blob_fails_verification() {
        let (_dir, content, leases) = setup();
        let lease = leases.create().expect("lease");
        let info = content.write_blob(b"good", BTreeMap::new(), &lease).expect("write");
        std::fs::write(content.blob_path(&info.digest), b"evil").expect("corrupt");
        let err = content.read_blob(&info.digest).unwrap_err();
        assert!(matches!(err, RecastError::HashMismatch { .. }));
    }

    #[test]
    fn delete_reports_reclaimed_bytes() {
        let (_dir, content, leases) = setup();
        let lease = leases.create().expect("lease");
        let info = content.write_blob(b"12345", BTreeMap::new(), &lease).expect("write");
        assert_eq!(content.delete(&info.digest).expect("delete"), 5);
        assert!(!content.exists(&info.digest));
        assert!(content.list().expect("list").is_empty());
    }
}
