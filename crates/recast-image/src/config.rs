//! Image configuration documents.
//!
//! The configuration is treated as an opaque, key-ordered document: each
//! top-level field is kept as its raw JSON text, and only the `rootfs`
//! field is decoded when the layer list has to change. Fields recast does
//! not know about survive a patch byte for byte.

use std::collections::BTreeMap;

use recast_common::error::{RecastError, Result};
use recast_common::types::Digest;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

const ROOTFS_FIELD: &str = "rootfs";

/// The `rootfs` section of an image configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `layers`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Uncompressed layer digests, bottom first.
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
    /// Fields this crate does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Generic image configuration document.
#[derive(Debug, Clone)]
pub struct ImageConfigDocument {
    fields: BTreeMap<String, Box<RawValue>>,
}

impl ImageConfigDocument {
    /// Parses a configuration blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a JSON object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let fields: BTreeMap<String, Box<RawValue>> = serde_json::from_slice(bytes)?;
        Ok(Self { fields })
    }

    /// Creates the configuration of a single-platform base image.
    ///
    /// # Errors
    ///
    /// Returns an error if a field cannot be encoded.
    pub fn new_base(diff_ids: Vec<Digest>, created_by: &str) -> Result<Self> {
        let now = chrono::Utc::now().to_rfc3339();
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        let mut doc = Self {
            fields: BTreeMap::new(),
        };
        doc.set_field("architecture", &architecture)?;
        doc.set_field("os", &"linux")?;
        doc.set_field("created", &now)?;
        doc.set_field("config", &serde_json::json!({}))?;
        doc.set_field(
            "history",
            &serde_json::json!([{ "created": now, "created_by": created_by }]),
        )?;
        doc.set_rootfs(&RootFs {
            kind: "layers".to_owned(),
            diff_ids,
            extra: serde_json::Map::new(),
        })?;
        Ok(doc)
    }

    /// Returns the raw JSON text of a top-level field.
    #[must_use]
    pub fn raw_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|raw| raw.get())
    }

    /// Decodes the `rootfs` section.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the document has no `rootfs` field, or a
    /// serialization error if it is malformed.
    pub fn rootfs(&self) -> Result<RootFs> {
        let raw = self.fields.get(ROOTFS_FIELD).ok_or_else(|| RecastError::NotFound {
            kind: "configuration field",
            id: ROOTFS_FIELD.to_owned(),
        })?;
        Ok(serde_json::from_str(raw.get())?)
    }

    /// Replaces the `rootfs` section, leaving every other field untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the section cannot be encoded.
    pub fn set_rootfs(&mut self, rootfs: &RootFs) -> Result<()> {
        self.set_field(ROOTFS_FIELD, rootfs)
    }

    /// Appends an uncompressed layer digest to `rootfs.diff_ids`.
    ///
    /// # Errors
    ///
    /// Returns an error if the `rootfs` section is missing or malformed.
    pub fn append_diff_id(&mut self, diff_id: Digest) -> Result<()> {
        let mut rootfs = self.rootfs()?;
        rootfs.diff_ids.push(diff_id);
        self.set_rootfs(&rootfs)
    }

    /// Uncompressed layer digests, bottom first.
    ///
    /// # Errors
    ///
    /// Returns an error if the `rootfs` section is missing or malformed.
    pub fn diff_ids(&self) -> Result<Vec<Digest>> {
        Ok(self.rootfs()?.diff_ids)
    }

    /// Default process environment (`config.Env`), empty when absent.
    #[must_use]
    pub fn env(&self) -> Vec<String> {
        #[derive(Deserialize)]
        struct RuntimeConfig {
            #[serde(rename = "Env", default)]
            env: Option<Vec<String>>,
        }
        self.fields
            .get("config")
            .and_then(|raw| serde_json::from_str::<Option<RuntimeConfig>>(raw.get()).ok())
            .flatten()
            .and_then(|c| c.env)
            .unwrap_or_default()
    }

    /// Serializes the whole document.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.fields)?)
    }

    fn set_field<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<()> {
        let raw = serde_json::value::to_raw_value(value)?;
        let _ = self.fields.insert(name.to_owned(), raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> String {
        format!(
            r#"{{"architecture":"amd64","os":"linux",
                "config":{{"Env":["PATH=/usr/bin"],"Labels":{{"b":"2","a":"1"}}}},
                "x-vendor":{{"nested":[3,2,1],"z":true,"a":null}},
                "rootfs":{{"type":"layers","diff_ids":["{}"]}}}}"#,
            Digest::from_bytes(b"layer0")
        )
    }

    #[test]
    fn append_diff_id_extends_rootfs() {
        let mut doc = ImageConfigDocument::from_slice(sample().as_bytes()).expect("parse");
        doc.append_diff_id(Digest::from_bytes(b"layer1")).expect("append");
        assert_eq!(
            doc.diff_ids().expect("diff ids"),
            vec![Digest::from_bytes(b"layer0"), Digest::from_bytes(b"layer1")]
        );
    }

    #[test]
    fn unknown_fields_survive_patch_verbatim() {
        let mut doc = ImageConfigDocument::from_slice(sample().as_bytes()).expect("parse");
        doc.append_diff_id(Digest::from_bytes(b"layer1")).expect("append");
        let patched = ImageConfigDocument::from_slice(&doc.to_vec().expect("encode")).expect("reparse");
        assert_eq!(
            patched.raw_field("x-vendor"),
            Some(r#"{"nested":[3,2,1],"z":true,"a":null}"#)
        );
        assert_eq!(
            patched.raw_field("config"),
            Some(r#"{"Env":["PATH=/usr/bin"],"Labels":{"b":"2","a":"1"}}"#)
        );
    }

    #[test]
    fn missing_rootfs_is_reported() {
        let doc = ImageConfigDocument::from_slice(br#"{"os":"linux"}"#).expect("parse");
        assert!(doc.rootfs().unwrap_err().is_not_found());
    }

    #[test]
    fn non_object_document_is_rejected() {
        assert!(ImageConfigDocument::from_slice(b"[1,2]").is_err());
        assert!(ImageConfigDocument::from_slice(b"not json").is_err());
    }

    #[test]
    fn env_reads_runtime_config() {
        let doc = ImageConfigDocument::from_slice(sample().as_bytes()).expect("parse");
        assert_eq!(doc.env(), vec!["PATH=/usr/bin".to_owned()]);
        let bare = ImageConfigDocument::from_slice(br#"{"config":null}"#).expect("parse");
        assert!(bare.env().is_empty());
    }

    #[test]
    fn new_base_has_single_layer_rootfs() {
        let doc = ImageConfigDocument::new_base(vec![Digest::from_bytes(b"l")], "test").expect("base");
        let rootfs = doc.rootfs().expect("rootfs");
        assert_eq!(rootfs.kind, "layers");
        assert_eq!(rootfs.diff_ids.len(), 1);
        assert_eq!(doc.raw_field("os"), Some("\"linux\""));
    }
}
