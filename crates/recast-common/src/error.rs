//! Unified error type for the recast workspace.
//!
//! Every library crate returns [`RecastError`]. The build pipeline variants
//! (`ReferenceResolution` through `Unpack`) identify the phase that failed;
//! the remaining variants describe the underlying store or I/O condition.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::Stage;

/// Snapshot operation that produced a [`RecastError::Snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOp {
    /// Creating a writable snapshot.
    Prepare,
    /// Creating a read-only view.
    View,
    /// Enumerating the mounts of a snapshot.
    Mounts,
    /// Reading snapshot metadata.
    Stat,
    /// Turning an active snapshot into a committed one.
    Commit,
    /// Deleting a snapshot.
    Remove,
}

impl fmt::Display for SnapshotOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Prepare => "prepare",
            Self::View => "view",
            Self::Mounts => "mounts",
            Self::Stat => "stat",
            Self::Commit => "commit",
            Self::Remove => "remove",
        };
        f.write_str(op)
    }
}

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum RecastError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A digest validation failed.
    #[error("hash mismatch for {resource}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Resource that failed validation.
        resource: String,
        /// Expected digest.
        expected: String,
        /// Actual computed digest.
        actual: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// An image reference could not be parsed or derived.
    #[error("invalid image reference '{reference}': {reason}")]
    ReferenceResolution {
        /// The offending reference string.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The parent image named by a recipe is not present in the store.
    #[error("unresolved parent image: {reference}")]
    UnresolvedParent {
        /// Fully resolved parent reference.
        reference: String,
    },

    /// The parent image exists but could not be loaded.
    #[error("failed to fetch parent image {reference}: {source}")]
    ParentImageFetch {
        /// Fully resolved parent reference.
        reference: String,
        /// Underlying failure.
        #[source]
        source: Box<RecastError>,
    },

    /// A snapshot operation failed.
    #[error("snapshot {op} failed for '{key}': {message}")]
    Snapshot {
        /// Operation that failed.
        op: SnapshotOp,
        /// Snapshot key involved.
        key: String,
        /// Description of the failure.
        message: String,
    },

    /// A build stage container could not be launched or exited non-zero.
    #[error("{stage} stage failed (exit code {}): {message}", exit_code.map_or_else(|| "none".to_owned(), |c| c.to_string()))]
    StageExecution {
        /// Stage that failed.
        stage: Stage,
        /// Exit code, when the container ran to completion.
        exit_code: Option<i32>,
        /// Description of the failure.
        message: String,
    },

    /// The parent manifest belongs to neither supported schema family.
    #[error("unsupported manifest media type: {media_type}")]
    UnsupportedManifestType {
        /// Media type found on the parent manifest.
        media_type: String,
    },

    /// The image configuration document could not be patched.
    #[error("failed to patch image configuration: {message}")]
    ConfigPatch {
        /// Description of the failure.
        message: String,
    },

    /// The new manifest could not be written to the content store.
    #[error("failed to write manifest: {source}")]
    ManifestWrite {
        /// Underlying failure.
        #[source]
        source: Box<RecastError>,
    },

    /// The image record could not be created or replaced.
    #[error("failed to register image {name}: {source}")]
    ImageRegistration {
        /// Target image name.
        name: String,
        /// Underlying failure.
        #[source]
        source: Box<RecastError>,
    },

    /// An image could not be materialized into snapshots.
    #[error("failed to unpack image {image}: {source}")]
    Unpack {
        /// Image being unpacked.
        image: String,
        /// Underlying failure.
        #[source]
        source: Box<RecastError>,
    },

    /// A per-name lock could not be acquired.
    #[error("could not lock {name}: {message}")]
    Lock {
        /// Name the lock guards.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// The surrounding operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl RecastError {
    /// Builds an [`RecastError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` when this error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, RecastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_execution_display_includes_stage_and_code() {
        let err = RecastError::StageExecution {
            stage: Stage::Build,
            exit_code: Some(2),
            message: "container exited".into(),
        };
        let text = err.to_string();
        assert!(text.contains("build"), "{text}");
        assert!(text.contains("exit code 2"), "{text}");
    }

    #[test]
    fn stage_execution_display_without_code() {
        let err = RecastError::StageExecution {
            stage: Stage::Prepare,
            exit_code: None,
            message: "entry point missing".into(),
        };
        assert!(err.to_string().contains("exit code none"));
    }

    #[test]
    fn wrapped_errors_expose_source() {
        use std::error::Error as _;
        let err = RecastError::Unpack {
            image: "myorg/base:latest".into(),
            source: Box::new(RecastError::NotFound {
                kind: "blob",
                id: "sha256:00".into(),
            }),
        };
        assert!(err.source().is_some());
    }

    #[test]
    fn is_not_found_matches_only_not_found() {
        assert!(
            RecastError::NotFound {
                kind: "image",
                id: "x".into()
            }
            .is_not_found()
        );
        assert!(!RecastError::Cancelled.is_not_found());
    }
}
