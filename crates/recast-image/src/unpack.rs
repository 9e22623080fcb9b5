//! Materializing images as committed snapshot chains.
//!
//! Layer `n` of an image is unpacked into a snapshot committed under the
//! chain identity of layers `0..=n`, with layer `n-1`'s chain as parent.
//! Chains that already exist are reused, so images sharing a base only
//! unpack the layers they add.

use recast_common::error::{RecastError, Result};
use recast_common::types::Digest;

use crate::content::ContentStore;
use crate::identity::chain_ids;
use crate::layer::apply_layer;
use crate::manifest::{Descriptor, Manifest};
use crate::media::is_gzip_layer;
use crate::mount::with_temp_mount;
use crate::snapshot::Snapshotter;

/// Unpacks every layer of `manifest` and returns the top chain identity.
///
/// `diff_ids` are the uncompressed digests from the image configuration,
/// one per manifest layer.
///
/// # Errors
///
/// Fails if the layer and diff id counts differ, a layer blob is missing,
/// a layer does not match its diff id, or a snapshot operation fails.
pub fn unpack(
    content: &ContentStore,
    snapshots: &Snapshotter,
    manifest: &Manifest,
    diff_ids: &[Digest],
) -> Result<Digest> {
    if manifest.layers.len() != diff_ids.len() {
        return Err(RecastError::Config {
            message: format!(
                "manifest lists {} layers but configuration lists {} diff ids",
                manifest.layers.len(),
                diff_ids.len()
            ),
        });
    }
    let chains = chain_ids(diff_ids);
    let mut parent: Option<&Digest> = None;
    let mut extracted = 0usize;

    for ((layer, diff_id), chain) in manifest.layers.iter().zip(diff_ids).zip(&chains) {
        let name = chain.to_string();
        if snapshots.exists(&name) {
            tracing::debug!(chain = %name, "layer already unpacked");
        } else {
            let parent_name = parent.map(ToString::to_string);
            unpack_layer(content, snapshots, layer, diff_id, &name, parent_name.as_deref())?;
            extracted += 1;
        }
        parent = Some(chain);
    }

    let top = chains.last().cloned().ok_or_else(|| RecastError::Config {
        message: "image has no layers".to_owned(),
    })?;
    tracing::info!(chain = %top, layers = chains.len(), extracted, "image unpacked");
    Ok(top)
}

fn unpack_layer(
    content: &ContentStore,
    snapshots: &Snapshotter,
    layer: &Descriptor,
    diff_id: &Digest,
    chain: &str,
    parent: Option<&str>,
) -> Result<()> {
    let key = format!("extract-{} {chain}", uuid::Uuid::new_v4().simple());
    let mounts = snapshots.prepare(&key, parent)?;

    let result = with_temp_mount(&mounts, |root| {
        let blob = content.open_blob(&layer.digest)?;
        apply_layer(blob, is_gzip_layer(&layer.media_type), root)
    })
    .and_then(|actual| {
        if &actual == diff_id {
            Ok(())
        } else {
            Err(RecastError::HashMismatch {
                resource: format!("layer {}", layer.digest),
                expected: diff_id.to_string(),
                actual: actual.to_string(),
            })
        }
    })
    .and_then(|()| snapshots.commit(chain, &key));

    match result {
        Ok(()) => {
            tracing::debug!(chain, layer = %layer.digest, "layer unpacked");
            Ok(())
        }
        Err(e) => {
            if let Err(cleanup) = snapshots.remove(&key) {
                tracing::warn!(key, error = %cleanup, "failed to remove extraction snapshot");
            }
            // Another unpack committed the same chain first.
            if snapshots.exists(chain) {
                tracing::debug!(chain, "chain committed concurrently");
                return Ok(());
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use recast_common::config::SnapshotDriver;

    use super::*;
    use crate::layer::LayerSink;
    use crate::lease::LeaseManager;
    use crate::media::{self, SchemaFamily};

    struct Fixture {
        _dir: tempfile::TempDir,
        content: ContentStore,
        snapshots: Snapshotter,
        leases: LeaseManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        Fixture {
            content: ContentStore::open(dir.path()).expect("content"),
            snapshots: Snapshotter::open(dir.path(), SnapshotDriver::Native).expect("snapshots"),
            leases: LeaseManager::open(dir.path()).expect("leases"),
            _dir: dir,
        }
    }

    fn layer(f: &Fixture, name: &str, data: &[u8]) -> crate::layer::LayerDiff {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).expect("append");
        let bytes = builder.into_inner().expect("finish");
        let lease = f.leases.create().expect("lease");
        let mut sink = LayerSink::new(&f.content).expect("sink");
        sink.write_all(&bytes).expect("write");
        sink.finish(SchemaFamily::Oci, &lease).expect("layer")
    }

    fn manifest(layers: &[&crate::layer::LayerDiff]) -> Manifest {
        Manifest::new(
            SchemaFamily::Oci,
            Descriptor::new(media::OCI_CONFIG, Digest::from_bytes(b"cfg"), 3),
            layers.iter().map(|l| l.descriptor.clone()).collect(),
        )
    }

    #[test]
    fn unpacks_each_layer_under_its_chain() {
        let f = fixture();
        let l0 = layer(&f, "a", b"a");
        let l1 = layer(&f, "b", b"b");
        let diff_ids = [l0.diff_id.clone(), l1.diff_id.clone()];

        let top = unpack(&f.content, &f.snapshots, &manifest(&[&l0, &l1]), &diff_ids).expect("unpack");
        assert_eq!(Some(top.clone()), crate::identity::chain_id(&diff_ids));

        let info = f.snapshots.stat(&top.to_string()).expect("stat");
        assert_eq!(info.parent, Some(l0.diff_id.to_string()));
        let mounts = f.snapshots.mounts(&top.to_string()).expect("mounts");
        let both = with_temp_mount(&mounts, |root| Ok(root.join("a").exists() && root.join("b").exists()))
            .expect("mount");
        assert!(both);
        assert!(f.snapshots.list().expect("list").iter().all(|s| !s.key.starts_with("extract-")));
    }

    #[test]
    fn existing_chains_are_reused() {
        let f = fixture();
        let l0 = layer(&f, "a", b"a");
        let diff_ids = [l0.diff_id.clone()];
        let _ = unpack(&f.content, &f.snapshots, &manifest(&[&l0]), &diff_ids).expect("first");
        let before = f.snapshots.list().expect("list");
        let _ = unpack(&f.content, &f.snapshots, &manifest(&[&l0]), &diff_ids).expect("second");
        assert_eq!(f.snapshots.list().expect("list"), before);
    }

    #[test]
    fn wrong_diff_id_fails_and_cleans_up() {
        let f = fixture();
        let l0 = layer(&f, "a", b"a");
        let err = unpack(
            &f.content,
            &f.snapshots,
            &manifest(&[&l0]),
            &[Digest::from_bytes(b"not the layer")],
        )
        .unwrap_err();
        assert!(matches!(err, RecastError::HashMismatch { .. }));
        assert!(f.snapshots.list().expect("list").is_empty());
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let f = fixture();
        let l0 = layer(&f, "a", b"a");
        assert!(unpack(&f.content, &f.snapshots, &manifest(&[&l0]), &[]).is_err());
    }
}
