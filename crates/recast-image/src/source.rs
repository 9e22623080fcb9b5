//! Importing base images from local sources.
//!
//! Supports `file://` (a root filesystem directory) and `tar://` (a root
//! filesystem archive, optionally gzip-compressed). Each import produces a
//! single-layer image of the requested schema family, registers it under
//! its name, and unpacks it so it can serve as a build parent right away.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use recast_common::error::{RecastError, Result};

use crate::config::ImageConfigDocument;
use crate::diff::diff_to_blob;
use crate::layer::{LayerDiff, LayerSink};
use crate::lease::Lease;
use crate::manifest::{Descriptor, Manifest};
use crate::media::SchemaFamily;
use crate::reference::ImageRef;
use crate::registry::ImageRecord;
use crate::store::Store;

/// Supported import sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Local directory (`file:///path/to/rootfs`).
    File(PathBuf),
    /// Local tar archive (`tar:///path/to/rootfs.tar[.gz]`).
    Tar(PathBuf),
}

impl ImageSource {
    /// URI form of the source.
    #[must_use]
    pub fn uri(&self) -> String {
        match self {
            Self::File(path) => format!("file://{}", path.display()),
            Self::Tar(path) => format!("tar://{}", path.display()),
        }
    }
}

/// Resolves a source URI.
///
/// # Errors
///
/// Returns an error if the scheme is unsupported or the path does not exist.
pub fn resolve_source(uri: &str) -> Result<ImageSource> {
    if let Some(path_str) = uri.strip_prefix("file://") {
        let path = PathBuf::from(path_str);
        if !path.is_dir() {
            return Err(RecastError::NotFound {
                kind: "image directory",
                id: path_str.to_owned(),
            });
        }
        tracing::info!(path = %path.display(), "resolved file:// source");
        Ok(ImageSource::File(path))
    } else if let Some(path_str) = uri.strip_prefix("tar://") {
        let path = PathBuf::from(path_str);
        if !path.is_file() {
            return Err(RecastError::NotFound {
                kind: "tar archive",
                id: path_str.to_owned(),
            });
        }
        tracing::info!(path = %path.display(), "resolved tar:// source");
        Ok(ImageSource::Tar(path))
    } else if uri.starts_with("https://") || uri.starts_with("http://") {
        Err(RecastError::Config {
            message: format!("remote image sources are not supported: {uri}"),
        })
    } else {
        Err(RecastError::Config {
            message: format!("unsupported image source URI scheme: {uri}"),
        })
    }
}

/// Imports `source` as a single-layer image named `reference`.
///
/// An existing image of the same name is replaced.
///
/// # Errors
///
/// Returns an error if the layer, configuration, or manifest cannot be
/// written, the name cannot be registered, or the image cannot be unpacked.
pub fn import(
    store: &Store,
    source: &ImageSource,
    reference: &ImageRef,
    family: SchemaFamily,
) -> Result<ImageRecord> {
    let name = reference.full_name();
    tracing::info!(source = %source.uri(), image = %name, %family, "importing image");
    let lease = store.leases().create()?;

    let layer = match source {
        ImageSource::File(path) => layer_from_directory(store, &lease, path, family)?,
        ImageSource::Tar(path) => layer_from_archive(store, &lease, path, family)?,
    };

    let config = ImageConfigDocument::new_base(
        vec![layer.diff_id.clone()],
        &format!("recast import {}", source.uri()),
    )?;
    let config_info = store
        .content()
        .write_blob(&config.to_vec()?, BTreeMap::new(), &lease)?;
    let manifest = Manifest::new(
        family,
        Descriptor::new(family.config_media_type(), config_info.digest, config_info.size),
        vec![layer.descriptor],
    );
    let manifest_info = store
        .content()
        .write_blob(&manifest.to_vec()?, manifest.gc_labels(), &lease)?;

    let record = ImageRecord::new(
        &name,
        Descriptor::new(
            family.manifest_media_type(),
            manifest_info.digest,
            manifest_info.size,
        ),
    );
    let _ = store
        .images()
        .replace(record.clone())
        .map_err(|e| RecastError::ImageRegistration {
            name: name.clone(),
            source: Box::new(e),
        })?;
    let _ = store.unpack(&name)?;
    lease.release()?;

    tracing::info!(image = %name, digest = %record.target.digest, "image imported");
    Ok(record)
}

fn layer_from_directory(
    store: &Store,
    lease: &Lease,
    rootfs: &Path,
    family: SchemaFamily,
) -> Result<LayerDiff> {
    let empty = tempfile::Builder::new()
        .prefix("recast-empty-")
        .tempdir()
        .map_err(|e| RecastError::io(std::env::temp_dir(), e))?;
    diff_to_blob(store.content(), lease, empty.path(), rootfs, family)
}

fn layer_from_archive(
    store: &Store,
    lease: &Lease,
    archive: &Path,
    family: SchemaFamily,
) -> Result<LayerDiff> {
    let file = std::fs::File::open(archive).map_err(|e| RecastError::io(archive, e))?;
    let mut sink = LayerSink::new(store.content())?;
    let copied = if is_gzip_archive(archive) {
        std::io::copy(&mut flate2::read::GzDecoder::new(file), &mut sink)
    } else {
        std::io::copy(&mut std::io::BufReader::new(file), &mut sink)
    }
    .map_err(|e| RecastError::io(archive, e))?;
    tracing::debug!(archive = %archive.display(), bytes = copied, "archive copied into layer");
    sink.finish(family, lease)
}

/// Determines whether the archive is gzip-compressed based on extension.
fn is_gzip_archive(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_file_source_existing_dir_returns_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uri = format!("file://{}", dir.path().display());
        let source = resolve_source(&uri).expect("resolve");
        assert_eq!(source, ImageSource::File(dir.path().to_path_buf()));
        assert_eq!(source.uri(), uri);
    }

    #[test]
    fn resolve_tar_source_existing_file_returns_tar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tar_path = dir.path().join("rootfs.tar");
        std::fs::write(&tar_path, b"fake tar").expect("write");
        let source = resolve_source(&format!("tar://{}", tar_path.display())).expect("resolve");
        assert!(matches!(source, ImageSource::Tar(_)));
    }

    #[test]
    fn remote_sources_are_rejected() {
        assert!(resolve_source("https://example.com/image.tar").is_err());
        assert!(resolve_source("http://example.com/image.tar").is_err());
    }

    #[test]
    fn resolve_unknown_scheme_returns_error() {
        assert!(resolve_source("ftp://example.com/image").is_err());
    }

    #[test]
    fn resolve_missing_paths_are_not_found() {
        assert!(resolve_source("file:///nonexistent/path").unwrap_err().is_not_found());
        assert!(resolve_source("tar:///nonexistent/archive.tar").unwrap_err().is_not_found());
    }

    #[test]
    fn is_gzip_archive_detects_extensions() {
        assert!(is_gzip_archive(Path::new("layer.tar.gz")));
        assert!(is_gzip_archive(Path::new("layer.tgz")));
        assert!(!is_gzip_archive(Path::new("layer.tar")));
    }
}
