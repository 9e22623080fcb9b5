//! Media types of the two supported manifest schema families.

use std::fmt;

use recast_common::error::{RecastError, Result};

/// Docker registry schema 2 manifest.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker image configuration.
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
/// Docker gzip-compressed layer.
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image configuration.
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// OCI gzip-compressed layer.
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// OCI uncompressed layer.
pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// Schema family of an image, derived from its manifest media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFamily {
    /// Legacy Docker registry schema 2.
    Docker,
    /// Open Container Initiative image specification.
    Oci,
}

impl SchemaFamily {
    /// Determines the family of a manifest media type.
    ///
    /// # Errors
    ///
    /// Returns `RecastError::UnsupportedManifestType` for anything but the
    /// Docker schema 2 and OCI manifest media types.
    pub fn from_manifest_media_type(media_type: &str) -> Result<Self> {
        match media_type {
            DOCKER_MANIFEST => Ok(Self::Docker),
            OCI_MANIFEST => Ok(Self::Oci),
            other => Err(RecastError::UnsupportedManifestType {
                media_type: other.to_owned(),
            }),
        }
    }

    /// Manifest media type of this family.
    #[must_use]
    pub const fn manifest_media_type(self) -> &'static str {
        match self {
            Self::Docker => DOCKER_MANIFEST,
            Self::Oci => OCI_MANIFEST,
        }
    }

    /// Configuration media type of this family.
    #[must_use]
    pub const fn config_media_type(self) -> &'static str {
        match self {
            Self::Docker => DOCKER_CONFIG,
            Self::Oci => OCI_CONFIG,
        }
    }

    /// Media type new gzip layers must carry in this family.
    #[must_use]
    pub const fn layer_media_type(self) -> &'static str {
        match self {
            Self::Docker => DOCKER_LAYER_GZIP,
            Self::Oci => OCI_LAYER_GZIP,
        }
    }
}

impl fmt::Display for SchemaFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => f.write_str("docker"),
            Self::Oci => f.write_str("oci"),
        }
    }
}

/// Returns `true` when a layer media type denotes a gzip-compressed tar.
#[must_use]
pub fn is_gzip_layer(media_type: &str) -> bool {
    media_type == DOCKER_LAYER_GZIP || media_type == OCI_LAYER_GZIP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_both_manifest_families() {
        assert_eq!(
            SchemaFamily::from_manifest_media_type(DOCKER_MANIFEST).expect("docker"),
            SchemaFamily::Docker
        );
        assert_eq!(
            SchemaFamily::from_manifest_media_type(OCI_MANIFEST).expect("oci"),
            SchemaFamily::Oci
        );
    }

    #[test]
    fn rejects_other_manifest_types() {
        let err = SchemaFamily::from_manifest_media_type(
            "application/vnd.docker.distribution.manifest.v1+prettyjws",
        )
        .unwrap_err();
        assert!(matches!(err, RecastError::UnsupportedManifestType { .. }));
    }

    #[test]
    fn layer_media_type_follows_family() {
        assert_eq!(SchemaFamily::Docker.layer_media_type(), DOCKER_LAYER_GZIP);
        assert_eq!(SchemaFamily::Oci.layer_media_type(), OCI_LAYER_GZIP);
        assert!(is_gzip_layer(OCI_LAYER_GZIP));
        assert!(!is_gzip_layer(OCI_LAYER_TAR));
    }
}
