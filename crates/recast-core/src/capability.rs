//! Privilege detection.
//!
//! Mount-backed snapshots, ownership-preserving extraction, and chroot
//! stage containers all need an effective uid of 0.

use recast_common::error::{RecastError, Result};

/// Returns `true` when running with an effective uid of 0.
#[must_use]
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Fails with a configuration error unless running as root.
///
/// # Errors
///
/// Returns `RecastError::Config` naming the operation that needs root.
pub fn require_root(operation: &str) -> Result<()> {
    if is_root() {
        return Ok(());
    }
    tracing::debug!(operation, "privilege check failed");
    Err(RecastError::Config {
        message: format!("{operation} requires root privileges"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_root_agrees_with_is_root() {
        assert_eq!(require_root("testing").is_ok(), is_root());
    }

    #[test]
    fn error_names_the_operation() {
        if !is_root() {
            let err = require_root("overlay snapshots").unwrap_err();
            assert!(err.to_string().contains("overlay snapshots"));
        }
    }
}
