//! Domain primitive types used across the recast workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{RecastError, Result};

/// Unique identifier for an ephemeral stage container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of a build's working snapshot.
///
/// Freshly generated for every build and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotKey(String);

impl SnapshotKey {
    /// Creates a key from an existing string.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Generates a fresh, collision-resistant key.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 content digest, rendered as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Algorithm prefix used in the string form.
    pub const ALGORITHM: &'static str = "sha256";

    /// Creates a digest from a hex-encoded string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a 64-character lowercase hex string.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let hex = hex.into();
        if hex.len() != crate::constants::SHA256_HEX_LENGTH
            || !hex
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(RecastError::Config {
                message: format!("invalid SHA-256 hex string: {hex}"),
            });
        }
        Ok(Self(hex))
    }

    /// Parses the canonical `sha256:<hex>` form.
    ///
    /// # Errors
    ///
    /// Returns an error if the algorithm is not `sha256` or the hex part is invalid.
    pub fn parse(s: &str) -> Result<Self> {
        let hex = s
            .strip_prefix("sha256:")
            .ok_or_else(|| RecastError::Config {
                message: format!("unsupported digest algorithm: {s}"),
            })?;
        Self::from_hex(hex)
    }

    /// Computes the digest of a byte slice.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    /// Finalizes a running hasher into a digest.
    #[must_use]
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Returns the hex-encoded part.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.0)
    }
}

impl FromStr for Digest {
    type Err = RecastError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = RecastError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

/// One of the fixed build stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Runs the image's prepare hook.
    Prepare,
    /// Runs the image's per-recipe build hook.
    Build,
    /// Runs the image's teardown hook.
    Teardown,
}

impl Stage {
    /// All stages in the order they run.
    pub const ALL: [Self; 3] = [Self::Prepare, Self::Build, Self::Teardown];

    /// Lowercase stage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Build => "build",
            Self::Teardown => "teardown",
        }
    }

    /// In-container entry point invoked by this stage.
    #[must_use]
    pub const fn entry_point(self) -> &'static str {
        match self {
            Self::Prepare => crate::constants::PREPARE_HOOK,
            Self::Build => crate::constants::BUILD_HOOK,
            Self::Teardown => crate::constants::TEARDOWN_HOOK,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn digest_of_empty_input_matches_known_value() {
        assert_eq!(Digest::from_bytes(b"").as_hex(), EMPTY_SHA256);
    }

    #[test]
    fn digest_parse_accepts_canonical_form() {
        let d = Digest::parse(&format!("sha256:{EMPTY_SHA256}")).expect("parse");
        assert_eq!(d.to_string(), format!("sha256:{EMPTY_SHA256}"));
    }

    #[test]
    fn digest_parse_rejects_other_algorithms() {
        assert!(Digest::parse(&format!("sha512:{EMPTY_SHA256}")).is_err());
        assert!(Digest::parse(EMPTY_SHA256).is_err());
    }

    #[test]
    fn digest_rejects_uppercase_and_short_hex() {
        assert!(Digest::from_hex(EMPTY_SHA256.to_uppercase()).is_err());
        assert!(Digest::from_hex("abc").is_err());
    }

    #[test]
    fn digest_serializes_as_prefixed_string() {
        let d = Digest::from_bytes(b"");
        let json = serde_json::to_string(&d).expect("serialize");
        assert_eq!(json, format!("\"sha256:{EMPTY_SHA256}\""));
        let back: Digest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, d);
    }

    #[test]
    fn snapshot_keys_are_unique() {
        assert_ne!(SnapshotKey::generate(), SnapshotKey::generate());
    }

    #[test]
    fn stages_run_in_declared_order() {
        let names: Vec<_> = Stage::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(names, ["prepare", "build", "teardown"]);
    }
}
