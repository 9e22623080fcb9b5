//! Filesystem chain identities.
//!
//! A chain identity names an exact stack of layers: the first entry is the
//! bottom layer's uncompressed digest, and each further entry digests the
//! previous chain identity and the next layer's uncompressed digest joined
//! by a single space.

use recast_common::types::Digest;

/// Computes the chain identity of an ordered list of uncompressed layer digests.
///
/// Returns `None` for an empty list.
#[must_use]
pub fn chain_id(diff_ids: &[Digest]) -> Option<Digest> {
    chain_ids(diff_ids).pop()
}

/// Computes the chain identity of every prefix of the list, bottom first.
#[must_use]
pub fn chain_ids(diff_ids: &[Digest]) -> Vec<Digest> {
    let mut chain: Vec<Digest> = Vec::with_capacity(diff_ids.len());
    for diff_id in diff_ids {
        let next = match chain.last() {
            None => diff_id.clone(),
            Some(parent) => Digest::from_bytes(format!("{parent} {diff_id}").as_bytes()),
        };
        chain.push(next);
    }
    chain
}
