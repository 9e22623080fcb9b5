//! Content garbage collection.
//!
//! Mark and sweep over the content store. Roots are the manifests named by
//! image records and every blob held by a live lease; references are
//! followed through `io.recast.gc.ref.content.*` labels. Unmarked blobs
//! are deleted.
//!
//! The whole run holds the content store's collection lock, so no blob is
//! published between reading the roots and sweeping. Leases are read
//! before image records: a writer releases its lease only after the
//! record referencing its blobs exists.

use std::collections::{BTreeSet, VecDeque};

use recast_common::constants::LABEL_GC_REF_CONTENT_PREFIX;
use recast_common::error::Result;
use recast_common::types::Digest;

use crate::content::ContentStore;
use crate::lease::LeaseManager;
use crate::registry::ImageRecords;

/// Outcome of a collection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcSummary {
    /// Number of blobs deleted.
    pub removed: usize,
    /// Bytes freed.
    pub reclaimed_bytes: u64,
}

/// Deletes every blob unreachable from image records and leases.
///
/// # Errors
///
/// Returns an error if the roots cannot be enumerated or a blob cannot be
/// deleted.
pub fn collect(
    content: &ContentStore,
    leases: &LeaseManager,
    images: &ImageRecords,
) -> Result<GcSummary> {
    let _collecting = content.lock_for_collection()?;
    let mut queue: VecDeque<Digest> = leases.protected_resources()?.into_iter().collect();
    queue.extend(images.list()?.into_iter().map(|record| record.target.digest));

    let mut marked = BTreeSet::new();
    while let Some(digest) = queue.pop_front() {
        if !marked.insert(digest.clone()) {
            continue;
        }
        let info = match content.info(&digest) {
            Ok(info) => info,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        for (key, value) in &info.labels {
            if !key.starts_with(LABEL_GC_REF_CONTENT_PREFIX) {
                continue;
            }
            match Digest::parse(value) {
                Ok(child) => queue.push_back(child),
                Err(e) => tracing::warn!(blob = %digest, label = %key, error = %e, "ignoring malformed gc reference"),
            }
        }
    }

    let mut summary = GcSummary::default();
    for info in content.list()? {
        if marked.contains(&info.digest) {
            continue;
        }
        summary.reclaimed_bytes += content.delete(&info.digest)?;
        summary.removed += 1;
        tracing::debug!(digest = %info.digest, "collected blob");
    }
    tracing::info!(
        marked = marked.len(),
        removed = summary.removed,
        reclaimed_bytes = summary.reclaimed_bytes,
        "garbage collection finished"
    );
    Ok(summary)
}
