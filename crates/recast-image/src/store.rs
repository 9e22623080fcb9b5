//! The local image store: content, leases, snapshots, and image records
//! under one data directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use recast_common::config::{RecastConfig, SnapshotDriver};
use recast_common::error::{RecastError, Result};
use recast_common::types::Digest;

use crate::config::ImageConfigDocument;
use crate::content::ContentStore;
use crate::gc::{self, GcSummary};
use crate::identity::chain_id;
use crate::lease::LeaseManager;
use crate::manifest::{Descriptor, Manifest};
use crate::media::SchemaFamily;
use crate::reference::ImageRef;
use crate::registry::{ImageRecord, ImageRecords};
use crate::snapshot::Snapshotter;
use crate::source::{self, ImageSource};

/// Handle to every store rooted at one data directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    content: ContentStore,
    leases: LeaseManager,
    snapshots: Snapshotter,
    images: ImageRecords,
}

impl Store {
    /// Opens the store described by the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created or the snapshot
    /// driver is unusable.
    pub fn open(config: &RecastConfig) -> Result<Self> {
        Self::open_at(
            &config.data_dir,
            config.snapshot_driver,
            Duration::from_secs(config.lock_timeout_secs),
        )
    }

    /// Opens a store at an explicit location.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created, or if the overlay
    /// driver is requested without root privileges.
    pub fn open_at(root: &Path, driver: SnapshotDriver, lock_timeout: Duration) -> Result<Self> {
        if driver == SnapshotDriver::Overlay {
            recast_core::capability::require_root("the overlay snapshot driver")?;
        }
        std::fs::create_dir_all(root).map_err(|e| RecastError::io(root, e))?;
        let store = Self {
            root: root.to_path_buf(),
            content: ContentStore::open(root)?,
            leases: LeaseManager::open(root)?,
            snapshots: Snapshotter::open(root, driver)?,
            images: ImageRecords::open(root, lock_timeout)?,
        };
        tracing::debug!(root = %root.display(), %driver, "store opened");
        Ok(store)
    }

    /// Data directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Content store.
    #[must_use]
    pub const fn content(&self) -> &ContentStore {
        &self.content
    }

    /// Lease manager.
    #[must_use]
    pub const fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Snapshotter.
    #[must_use]
    pub const fn snapshots(&self) -> &Snapshotter {
        &self.snapshots
    }

    /// Image records.
    #[must_use]
    pub const fn images(&self) -> &ImageRecords {
        &self.images
    }

    /// Looks up an image record by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the image is unknown.
    pub fn get_image(&self, name: &str) -> Result<ImageRecord> {
        self.images.get(name)
    }

    /// Reads and parses the manifest a descriptor points at.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is missing or not a manifest.
    pub fn read_manifest(&self, descriptor: &Descriptor) -> Result<Manifest> {
        Manifest::from_slice(&self.content.read_blob(&descriptor.digest)?)
    }

    /// Reads and parses a manifest's configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is missing or not a JSON object.
    pub fn read_config(&self, manifest: &Manifest) -> Result<ImageConfigDocument> {
        ImageConfigDocument::from_slice(&self.content.read_blob(&manifest.config.digest)?)
    }

    /// Chain identity of the top layer of an image.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read or lists no
    /// layers.
    pub fn image_chain_id(&self, manifest: &Manifest) -> Result<Digest> {
        let diff_ids = self.read_config(manifest)?.diff_ids()?;
        chain_id(&diff_ids).ok_or_else(|| RecastError::Config {
            message: "image configuration lists no layers".to_owned(),
        })
    }

    /// Unpacks a registered image into committed snapshots and returns
    /// its top chain identity.
    ///
    /// # Errors
    ///
    /// Returns `RecastError::Unpack` wrapping the underlying failure.
    pub fn unpack(&self, name: &str) -> Result<Digest> {
        let wrap = |e: RecastError| RecastError::Unpack {
            image: name.to_owned(),
            source: Box::new(e),
        };
        let record = self.images.get(name).map_err(wrap)?;
        let manifest = self.read_manifest(&record.target).map_err(wrap)?;
        let diff_ids = self
            .read_config(&manifest)
            .and_then(|config| config.diff_ids())
            .map_err(wrap)?;
        crate::unpack::unpack(&self.content, &self.snapshots, &manifest, &diff_ids).map_err(wrap)
    }

    /// Imports a base image from a local source.
    ///
    /// # Errors
    ///
    /// See [`source::import`].
    pub fn import(
        &self,
        source: &ImageSource,
        reference: &ImageRef,
        family: SchemaFamily,
    ) -> Result<ImageRecord> {
        source::import(self, source, reference, family)
    }

    /// Removes an image name. Its content stays until the next collection.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the image is unknown.
    pub fn remove_image(&self, name: &str) -> Result<()> {
        let _lock = self.images.lock(name)?;
        self.images.delete(name)
    }

    /// Deletes unreferenced content.
    ///
    /// # Errors
    ///
    /// See [`gc::collect`].
    pub fn garbage_collect(&self) -> Result<GcSummary> {
        gc::collect(&self.content, &self.leases, &self.images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media;

    fn store(dir: &Path) -> Store {
        Store::open_at(dir, SnapshotDriver::Native, Duration::from_secs(1)).expect("open")
    }

    fn rootfs(dir: &Path) -> PathBuf {
        let root = dir.join("rootfs");
        std::fs::create_dir_all(root.join("bin")).expect("mkdir");
        std::fs::write(root.join("bin/tool"), b"#!/bin/sh\n").expect("write");
        root
    }

    #[test]
    fn import_directory_registers_and_unpacks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir.path().join("data"));
        let source = ImageSource::File(rootfs(dir.path()));
        let reference = ImageRef::parse("myorg/base").expect("ref");

        let record = store.import(&source, &reference, SchemaFamily::Oci).expect("import");
        assert_eq!(record.name, "myorg/base:latest");
        assert_eq!(record.target.media_type, media::OCI_MANIFEST);

        let manifest = store.read_manifest(&record.target).expect("manifest");
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(manifest.config.media_type, media::OCI_CONFIG);
        let chain = store.image_chain_id(&manifest).expect("chain");
        assert!(store.snapshots().exists(&chain.to_string()));
        assert!(store.leases().list().expect("leases").is_empty());
    }

    #[test]
    fn import_docker_family_uses_docker_media_types() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir.path().join("data"));
        let source = ImageSource::File(rootfs(dir.path()));
        let reference = ImageRef::parse("legacy:1").expect("ref");

        let record = store.import(&source, &reference, SchemaFamily::Docker).expect("import");
        let manifest = store.read_manifest(&record.target).expect("manifest");
        assert_eq!(manifest.media_type.as_deref(), Some(media::DOCKER_MANIFEST));
        assert_eq!(manifest.layers[0].media_type, media::DOCKER_LAYER_GZIP);
    }

    #[test]
    fn gc_keeps_imported_image_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir.path().join("data"));
        let source = ImageSource::File(rootfs(dir.path()));
        let _ = store
            .import(&source, &ImageRef::parse("keep").expect("ref"), SchemaFamily::Oci)
            .expect("import");
        let before = store.content().list().expect("list").len();
        assert_eq!(store.garbage_collect().expect("gc").removed, 0);
        assert_eq!(store.content().list().expect("list").len(), before);

        store.remove_image("keep:latest").expect("remove");
        assert_eq!(store.garbage_collect().expect("gc").removed, before);
    }

    #[test]
    fn unpack_of_unknown_image_is_wrapped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = store(dir.path()).unpack("ghost:latest").unwrap_err();
        assert!(matches!(err, RecastError::Unpack { .. }));
    }
}
