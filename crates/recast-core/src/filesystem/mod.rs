//! Filesystem management for snapshots and stage containers.
//!
//! Provides `OverlayFS` layer mounting and bind-mount utilities.

pub mod mount;
pub mod overlayfs;
