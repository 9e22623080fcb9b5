//! # recast-core
//!
//! Low-level Linux filesystem primitives used by the snapshotter and the
//! stage runner:
//! - **Bind mounts**: exposing host directories inside a container root.
//! - **`OverlayFS`**: stacking read-only lower layers under a writable upper.
//! - **Privileges**: detecting whether root-only features are usable.
//!
//! Every mount syscall is wrapped with proper error mapping; non-Linux
//! platforms get stubs that report the missing capability.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod filesystem;
