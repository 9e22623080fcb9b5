//! # recast-image
//!
//! The local backing store the build pipeline runs against.
//!
//! Handles:
//! - **Content**: digest-addressed blobs with labels, leases, and garbage collection.
//! - **Snapshots**: copy-on-write filesystem instances keyed by opaque tokens.
//! - **Layers**: walking diffs between mount sets and whiteout-aware extraction.
//! - **Manifests**: manifest/config documents and the two schema families.
//! - **Registry**: name → manifest records guarded by per-name locks.
//! - **Unpack/Import**: materializing images into snapshot chains.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod content;
pub mod diff;
pub mod gc;
pub mod hash;
pub mod identity;
pub mod layer;
pub mod lease;
pub mod lock;
pub mod manifest;
pub mod media;
pub mod mount;
pub mod reference;
pub mod registry;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod unpack;

pub use store::Store;
