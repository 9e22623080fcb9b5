//! Filesystem layers.
//!
//! A layer is a tar stream of changes relative to its parent: regular
//! entries add or replace paths, `.wh.<name>` entries delete `<name>`, and
//! a `.wh..wh..opq` entry hides everything the parent had in its
//! directory. Layers are stored gzip-compressed; their identity within a
//! configuration is the digest of the uncompressed stream.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use recast_common::constants::LABEL_UNCOMPRESSED;
use recast_common::error::{RecastError, Result};
use recast_common::types::Digest;

use crate::content::{BlobWriter, ContentStore};
use crate::hash::{HashingReader, HashingWriter};
use crate::lease::Lease;
use crate::manifest::Descriptor;
use crate::media::SchemaFamily;

/// Prefix marking a deleted path.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Entry marking a directory whose parent contents are hidden.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// A layer blob written to the content store.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDiff {
    /// Descriptor of the compressed blob.
    pub descriptor: Descriptor,
    /// Digest of the uncompressed tar stream.
    pub diff_id: Digest,
}

/// Streams a tar archive into a compressed layer blob.
///
/// The uncompressed digest is computed in the same pass as compression.
#[derive(Debug)]
pub struct LayerSink {
    inner: HashingWriter<GzEncoder<BlobWriter>>,
}

impl LayerSink {
    /// Starts a new layer blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the ingest file cannot be created.
    pub fn new(content: &ContentStore) -> Result<Self> {
        let blob = content.writer()?;
        Ok(Self {
            inner: HashingWriter::new(GzEncoder::new(blob, Compression::default())),
        })
    }

    /// Finishes compression and commits the blob under `lease`.
    ///
    /// The blob is labelled with its uncompressed digest.
    ///
    /// # Errors
    ///
    /// Returns an error if compression or the content commit fails.
    pub fn finish(self, family: SchemaFamily, lease: &Lease) -> Result<LayerDiff> {
        let (encoder, diff_id, uncompressed) = self.inner.finish();
        let blob = encoder
            .finish()
            .map_err(|e| RecastError::io("layer stream", e))?;
        let labels = [(LABEL_UNCOMPRESSED.to_owned(), diff_id.to_string())].into();
        let info = blob.commit(None, labels, lease)?;
        tracing::debug!(
            digest = %info.digest,
            diff_id = %diff_id,
            size = info.size,
            uncompressed,
            "layer blob written"
        );
        Ok(LayerDiff {
            descriptor: Descriptor::new(family.layer_media_type(), info.digest, info.size),
            diff_id,
        })
    }
}

impl Write for LayerSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Applies a layer stream on top of the directory `target`.
///
/// Returns the digest of the uncompressed stream so callers can check it
/// against the configuration's `diff_ids`.
///
/// # Errors
///
/// Returns an error if the stream is malformed, an entry escapes
/// `target`, or the filesystem cannot be updated.
pub fn apply_layer<R: Read>(reader: R, gzip: bool, target: &Path) -> Result<Digest> {
    if gzip {
        apply_tar(GzDecoder::new(reader), target)
    } else {
        apply_tar(reader, target)
    }
}

fn apply_tar<R: Read>(stream: R, target: &Path) -> Result<Digest> {
    let mut hashing = HashingReader::new(stream);
    let mut applied = 0usize;
    {
        let mut archive = tar::Archive::new(&mut hashing);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_preserve_ownerships(recast_core::capability::is_root());
        archive.set_overwrite(true);
        archive.set_unpack_xattrs(false);

        for entry in archive.entries().map_err(|e| RecastError::io(target, e))? {
            let mut entry = entry.map_err(|e| RecastError::io(target, e))?;
            let raw = entry
                .path()
                .map_err(|e| RecastError::io(target, e))?
                .into_owned();
            let Some(rel) = sanitize(&raw)? else {
                continue;
            };
            let name = rel
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let parent = target.join(rel.parent().unwrap_or_else(|| Path::new("")));

            if name == OPAQUE_WHITEOUT {
                clear_directory(&parent)?;
                continue;
            }
            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                remove_path(&parent.join(hidden))?;
                continue;
            }

            let dest = target.join(&rel);
            let is_dir = entry.header().entry_type().is_dir();
            if let Ok(existing) = std::fs::symlink_metadata(&dest) {
                if !(existing.is_dir() && is_dir) {
                    remove_path(&dest)?;
                }
            }
            let unpacked = entry
                .unpack_in(target)
                .map_err(|e| RecastError::io(&dest, e))?;
            if !unpacked {
                tracing::warn!(path = %raw.display(), "skipped layer entry outside target");
            }
            applied += 1;
        }
    }
    // Trailing archive padding is part of the uncompressed digest.
    let _ = std::io::copy(&mut hashing, &mut std::io::sink())
        .map_err(|e| RecastError::io(target, e))?;
    let diff_id = hashing.digest();
    tracing::debug!(target = %target.display(), entries = applied, diff_id = %diff_id, "layer applied");
    Ok(diff_id)
}

/// Strips leading `/` and `./` and rejects `..`. Returns `None` for the
/// archive root itself.
fn sanitize(path: &Path) -> Result<Option<PathBuf>> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(RecastError::Config {
                    message: format!("layer entry escapes root: {}", path.display()),
                });
            }
        }
    }
    Ok((!out.as_os_str().is_empty()).then_some(out))
}

fn remove_path(path: &Path) -> Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RecastError::io(path, e)),
    }
}

fn clear_directory(dir: &Path) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(RecastError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| RecastError::io(dir, e))?;
        remove_path(&entry.path())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseManager;

    fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).expect("append");
    }

    fn append_dir(builder: &mut tar::Builder<Vec<u8>>, path: &str) {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, path, std::io::empty()).expect("append");
    }

    fn archive(build: impl FnOnce(&mut tar::Builder<Vec<u8>>)) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        build(&mut builder);
        builder.into_inner().expect("finish")
    }

    #[test]
    fn apply_returns_uncompressed_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bytes = archive(|b| append_file(b, "hello.txt", b"hello from layer"));
        let diff_id = apply_layer(&bytes[..], false, dir.path()).expect("apply");
        assert_eq!(diff_id, Digest::from_bytes(&bytes));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hello.txt")).expect("read"),
            "hello from layer"
        );
    }

    #[test]
    fn gzip_layer_digest_covers_decompressed_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bytes = archive(|b| append_file(b, "gz.txt", b"zipped"));
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&bytes).expect("compress");
        let compressed = encoder.finish().expect("finish");

        let diff_id = apply_layer(&compressed[..], true, dir.path()).expect("apply");
        assert_eq!(diff_id, Digest::from_bytes(&bytes));
        assert!(dir.path().join("gz.txt").exists());
    }

    #[test]
    fn whiteouts_remove_lower_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lower = archive(|b| {
            append_dir(b, "etc");
            append_file(b, "etc/keep", b"k");
            append_file(b, "etc/drop", b"d");
            append_dir(b, "var");
            append_file(b, "var/old", b"o");
        });
        let _ = apply_layer(&lower[..], false, dir.path()).expect("lower");

        let upper = archive(|b| {
            append_file(b, "etc/.wh.drop", b"");
            append_dir(b, "var");
            append_file(b, "var/.wh..wh..opq", b"");
            append_file(b, "var/new", b"n");
        });
        let _ = apply_layer(&upper[..], false, dir.path()).expect("upper");

        assert!(dir.path().join("etc/keep").exists());
        assert!(!dir.path().join("etc/drop").exists());
        assert!(!dir.path().join("etc/.wh.drop").exists());
        assert!(!dir.path().join("var/old").exists());
        assert!(dir.path().join("var/new").exists());
    }

    #[test]
    fn file_replaces_directory_of_same_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lower = archive(|b| {
            append_dir(b, "thing");
            append_file(b, "thing/inner", b"i");
        });
        let _ = apply_layer(&lower[..], false, dir.path()).expect("lower");
        let upper = archive(|b| append_file(b, "thing", b"now a file"));
        let _ = apply_layer(&upper[..], false, dir.path()).expect("upper");
        assert!(dir.path().join("thing").is_file());
    }

    #[test]
    fn parent_components_are_rejected() {
        assert!(sanitize(Path::new("../escape")).is_err());
        assert_eq!(sanitize(Path::new("./")).expect("root"), None);
        assert_eq!(
            sanitize(Path::new("/usr/bin")).expect("abs"),
            Some(PathBuf::from("usr/bin"))
        );
    }

    #[test]
    fn sink_labels_blob_with_uncompressed_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = ContentStore::open(dir.path()).expect("content");
        let leases = LeaseManager::open(dir.path()).expect("leases");
        let lease = leases.create().expect("lease");
        let bytes = archive(|b| append_file(b, "f", b"data"));

        let mut sink = LayerSink::new(&content).expect("sink");
        sink.write_all(&bytes).expect("write");
        let layer = sink.finish(SchemaFamily::Oci, &lease).expect("finish");

        assert_eq!(layer.diff_id, Digest::from_bytes(&bytes));
        assert_eq!(layer.descriptor.media_type, crate::media::OCI_LAYER_GZIP);
        let info = content.info(&layer.descriptor.digest).expect("info");
        assert_eq!(info.labels[LABEL_UNCOMPRESSED], layer.diff_id.to_string());

        let target = dir.path().join("out");
        std::fs::create_dir(&target).expect("mkdir");
        let blob = content.open_blob(&layer.descriptor.digest).expect("open");
        assert_eq!(apply_layer(blob, true, &target).expect("apply"), layer.diff_id);
    }
}
