//! Turning a mutated build snapshot into a registered image.
//!
//! The snapshot is diffed against a read-only view of its parent. The
//! resulting layer is appended to a copy of the parent's manifest, its
//! uncompressed digest to a copy of the parent's configuration, and the
//! new manifest is registered under the target name and unpacked. Every
//! blob written along the way is held by a lease until the image record
//! references it.

use std::collections::BTreeMap;

use recast_common::constants::MAX_IMAGE_LAYERS;
use recast_common::error::{RecastError, Result};
use recast_common::types::Digest;
use recast_image::config::ImageConfigDocument;
use recast_image::diff::diff_mounts;
use recast_image::layer::LayerDiff;
use recast_image::lease::Lease;
use recast_image::manifest::{Descriptor, Manifest};
use recast_image::media::SchemaFamily;
use recast_image::reference::ImageRef;
use recast_image::registry::ImageRecord;
use recast_image::Store;

/// The parent image a build started from.
#[derive(Debug, Clone)]
pub struct ParentImage {
    /// Record of the parent in the image store.
    pub record: ImageRecord,
    /// Parsed parent manifest.
    pub manifest: Manifest,
    /// Parsed parent configuration.
    pub config: ImageConfigDocument,
}

/// What a successful commit produced.
#[derive(Debug, Clone)]
pub struct CommitResult {
    /// Descriptor of the new manifest, as registered.
    pub manifest: Descriptor,
    /// The new layer and its uncompressed digest.
    pub layer: LayerDiff,
    /// Top chain identity of the unpacked image.
    pub chain_id: Digest,
}

/// Commits the active snapshot `snapshot_key` as image `target`.
///
/// # Errors
///
/// - `UnsupportedManifestType` if the parent is neither Docker schema 2
///   nor OCI, or `ManifestWrite` if it already has the maximum number of
///   layers; nothing is written in either case.
/// - `Snapshot` if the parent view cannot be created.
/// - `ConfigPatch`, `ManifestWrite`, `ImageRegistration`, or `Unpack` for
///   failures in the corresponding step.
pub fn commit_snapshot(
    store: &Store,
    parent: &ParentImage,
    snapshot_key: &str,
    target: &ImageRef,
) -> Result<CommitResult> {
    let family = SchemaFamily::from_manifest_media_type(&parent.record.target.media_type)?;
    // A manifest one layer past the limit is never written.
    if parent.manifest.layers.len() >= MAX_IMAGE_LAYERS {
        return Err(RecastError::ManifestWrite {
            source: Box::new(RecastError::Config {
                message: format!(
                    "parent image {} already has the maximum of {MAX_IMAGE_LAYERS} layers",
                    parent.record.name
                ),
            }),
        });
    }
    let name = target.full_name();
    let lease = store.leases().create()?;

    let layer = diff_against_parent(store, &lease, snapshot_key, family)?;

    let mut config = parent.config.clone();
    config
        .append_diff_id(layer.diff_id.clone())
        .map_err(|e| RecastError::ConfigPatch {
            message: e.to_string(),
        })?;
    let config_bytes = config.to_vec().map_err(|e| RecastError::ConfigPatch {
        message: e.to_string(),
    })?;
    let config_info = store
        .content()
        .write_blob(&config_bytes, BTreeMap::new(), &lease)
        .map_err(|e| RecastError::ConfigPatch {
            message: format!("failed to store configuration: {e}"),
        })?;

    let mut manifest = parent.manifest.clone();
    manifest.config.digest = config_info.digest;
    manifest.config.size = config_info.size;
    manifest.layers.push(layer.descriptor.clone());
    let manifest_info = manifest
        .to_vec()
        .and_then(|bytes| {
            store
                .content()
                .write_blob(&bytes, manifest.gc_labels(), &lease)
        })
        .map_err(|e| RecastError::ManifestWrite {
            source: Box::new(e),
        })?;

    // Same media type as the parent so consumers see the same schema.
    let target_descriptor = Descriptor::new(
        parent.record.target.media_type.clone(),
        manifest_info.digest,
        manifest_info.size,
    );
    let previous = store
        .images()
        .replace(ImageRecord::new(&name, target_descriptor.clone()))
        .map_err(|e| RecastError::ImageRegistration {
            name: name.clone(),
            source: Box::new(e),
        })?;
    if let Some(previous) = previous {
        tracing::info!(image = %name, previous = %previous.target.digest, "replaced existing image");
    }

    let chain_id = store.unpack(&name)?;
    lease.release()?;

    tracing::info!(
        image = %name,
        manifest = %target_descriptor.digest,
        layer = %layer.descriptor.digest,
        layers = manifest.layers.len(),
        "image committed"
    );
    Ok(CommitResult {
        manifest: target_descriptor,
        layer,
        chain_id,
    })
}

/// Diffs the snapshot against a temporary read-only view of its parent.
fn diff_against_parent(
    store: &Store,
    lease: &Lease,
    snapshot_key: &str,
    family: SchemaFamily,
) -> Result<LayerDiff> {
    let snapshots = store.snapshots();
    let info = snapshots.stat(snapshot_key)?;
    let upper = snapshots.mounts(snapshot_key)?;
    let view_key = format!("view-{}", uuid::Uuid::new_v4().simple());
    let lower = snapshots.view(&view_key, info.parent.as_deref())?;

    let result = diff_mounts(store.content(), lease, &lower, &upper, family);
    if let Err(e) = snapshots.remove(&view_key) {
        tracing::warn!(key = %view_key, error = %e, "failed to remove parent view");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use recast_common::config::SnapshotDriver;
    use recast_image::media;

    use super::*;

    fn parent_with_layers(count: usize) -> ParentImage {
        let layers = (0..count)
            .map(|i| Descriptor::new(media::OCI_LAYER_GZIP, Digest::from_bytes(&i.to_le_bytes()), 1))
            .collect();
        let manifest = Manifest::new(
            SchemaFamily::Oci,
            Descriptor::new(media::OCI_CONFIG, Digest::from_bytes(b"config"), 2),
            layers,
        );
        ParentImage {
            record: ImageRecord::new(
                "tall:latest",
                Descriptor::new(media::OCI_MANIFEST, Digest::from_bytes(b"manifest"), 3),
            ),
            manifest,
            config: ImageConfigDocument::from_slice(br#"{"rootfs":{"type":"layers","diff_ids":[]}}"#)
                .expect("config"),
        }
    }

    #[test]
    fn parent_at_layer_limit_is_rejected_before_any_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open_at(dir.path(), SnapshotDriver::Native, Duration::from_secs(1)).expect("store");
        let target = ImageRef::parse("taller").expect("ref");

        let err = commit_snapshot(&store, &parent_with_layers(MAX_IMAGE_LAYERS), "no-such-key", &target)
            .unwrap_err();
        assert!(matches!(err, RecastError::ManifestWrite { .. }), "{err}");
        assert!(store.content().list().expect("list").is_empty());
        assert!(store.leases().list().expect("leases").is_empty());
        assert!(store.images().find("taller:latest").expect("find").is_none());
    }

    #[test]
    fn parent_below_layer_limit_gets_past_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open_at(dir.path(), SnapshotDriver::Native, Duration::from_secs(1)).expect("store");
        let target = ImageRef::parse("taller").expect("ref");

        let err = commit_snapshot(&store, &parent_with_layers(MAX_IMAGE_LAYERS - 1), "no-such-key", &target)
            .unwrap_err();
        assert!(!matches!(err, RecastError::ManifestWrite { .. }), "{err}");
    }
}
