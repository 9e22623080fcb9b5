//! Image manifest and content descriptors.
//!
//! Only the fields the build pipeline manipulates are typed; everything
//! else a manifest or descriptor carries is kept in an `extra` map and
//! written back unchanged.

use std::collections::BTreeMap;

use recast_common::constants::LABEL_GC_REF_CONTENT_PREFIX;
use recast_common::error::Result;
use recast_common::types::Digest;
use serde::{Deserialize, Serialize};

use crate::media::SchemaFamily;

/// Reference to a blob in the content store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Media type of the referenced content.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Digest of the referenced bytes.
    pub digest: Digest,
    /// Size of the referenced bytes.
    pub size: u64,
    /// Fields this crate does not interpret (annotations, urls, platform).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Descriptor {
    /// Creates a descriptor without extra fields.
    #[must_use]
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            extra: serde_json::Map::new(),
        }
    }
}

/// Single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Always `2` for both supported families.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Manifest media type, mandatory for Docker and optional for OCI.
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Configuration blob.
    pub config: Descriptor,
    /// Layers, bottom first.
    pub layers: Vec<Descriptor>,
    /// Fields this crate does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Manifest {
    /// Creates a manifest of the given family.
    #[must_use]
    pub fn new(family: SchemaFamily, config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(family.manifest_media_type().to_owned()),
            config,
            layers,
            extra: serde_json::Map::new(),
        }
    }

    /// Parses a manifest blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a manifest document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serializes the manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Labels protecting every blob this manifest references from
    /// garbage collection: the configuration first, then each layer.
    #[must_use]
    pub fn gc_labels(&self) -> BTreeMap<String, String> {
        std::iter::once(&self.config)
            .chain(&self.layers)
            .enumerate()
            .map(|(i, desc)| {
                (
                    format!("{LABEL_GC_REF_CONTENT_PREFIX}{i}"),
                    desc.digest.to_string(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media;

    fn sample_json() -> String {
        format!(
            r#"{{
                "schemaVersion": 2,
                "mediaType": "{}",
                "config": {{"mediaType": "{}", "digest": "{}", "size": 10}},
                "layers": [
                    {{"mediaType": "{}", "digest": "{}", "size": 20,
                      "annotations": {{"org.example": "kept"}}}}
                ],
                "annotations": {{"org.opencontainers.image.title": "base"}}
            }}"#,
            media::OCI_MANIFEST,
            media::OCI_CONFIG,
            Digest::from_bytes(b"config"),
            media::OCI_LAYER_GZIP,
            Digest::from_bytes(b"layer"),
        )
    }

    #[test]
    fn parse_keeps_unknown_fields() {
        let manifest = Manifest::from_slice(sample_json().as_bytes()).expect("parse");
        assert_eq!(manifest.layers.len(), 1);
        assert!(manifest.extra.contains_key("annotations"));
        assert!(manifest.layers[0].extra.contains_key("annotations"));

        let reparsed = Manifest::from_slice(&manifest.to_vec().expect("encode")).expect("reparse");
        assert_eq!(reparsed, manifest);
    }

    #[test]
    fn gc_labels_enumerate_config_then_layers() {
        let manifest = Manifest::new(
            SchemaFamily::Oci,
            Descriptor::new(media::OCI_CONFIG, Digest::from_bytes(b"c"), 1),
            vec![
                Descriptor::new(media::OCI_LAYER_GZIP, Digest::from_bytes(b"l0"), 1),
                Descriptor::new(media::OCI_LAYER_GZIP, Digest::from_bytes(b"l1"), 1),
            ],
        );
        let labels = manifest.gc_labels();
        assert_eq!(labels.len(), 3);
        assert_eq!(
            labels["io.recast.gc.ref.content.0"],
            Digest::from_bytes(b"c").to_string()
        );
        assert_eq!(
            labels["io.recast.gc.ref.content.2"],
            Digest::from_bytes(b"l1").to_string()
        );
    }

    #[test]
    fn rejects_invalid_layer_digest() {
        let bad = sample_json().replace("sha256:", "md5:");
        assert!(Manifest::from_slice(bad.as_bytes()).is_err());
    }
}
