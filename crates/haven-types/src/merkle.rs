//! Merkle root construction for sector payloads and contract sector sets.
//!
//! A sector root is the binary Merkle root over the sector's 64-byte
//! leaves. A contract's file Merkle root is the binary Merkle root whose
//! leaves are the contract's sector roots in order. Leaf and inner hashes
//! are domain separated by a one-byte prefix so a leaf can never be
//! confused with an interior node.

use crate::{Hash256, LEAF_SIZE, SECTOR_SIZE};

/// Domain prefix for leaf hashes.
const LEAF_PREFIX: u8 = 0x00;

/// Domain prefix for inner-node hashes.
const NODE_PREFIX: u8 = 0x01;

/// Hash a Merkle leaf: `blake3(0x00 || data)`.
pub fn leaf_hash(data: &[u8]) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(data);
    Hash256(*hasher.finalize().as_bytes())
}

/// Hash a Merkle inner node: `blake3(0x01 || left || right)`.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash256(*hasher.finalize().as_bytes())
}

/// Compute the Merkle root of a full sector payload.
///
/// The sector is split into 64-byte leaves; the tree over 65 536 leaves
/// is perfect, so no padding rule applies.
///
/// # Panics
///
/// Panics if `sector` is not exactly [`SECTOR_SIZE`] bytes. Callers
/// validate payload length at the I/O boundary before hashing.
pub fn sector_root(sector: &[u8]) -> Hash256 {
    assert_eq!(sector.len(), SECTOR_SIZE, "sector payload must be 4 MiB");
    let leaves: Vec<Hash256> = sector.chunks(LEAF_SIZE).map(leaf_hash).collect();
    fold_tree(leaves)
}

/// Compute the Merkle root over a contract's ordered sector roots.
///
/// The sector roots themselves are the leaves. An empty set has the zero
/// root, matching a freshly formed contract with no data.
pub fn meta_root(roots: &[Hash256]) -> Hash256 {
    if roots.is_empty() {
        return Hash256::ZERO;
    }
    fold_tree(roots.to_vec())
}

/// Fold a level of nodes up to the root. An unpaired trailing node is
/// hashed with itself, the same padding rule at every level.
fn fold_tree(mut level: Vec<Hash256>) -> Hash256 {
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut i = 0;
        while i < level.len() {
            let left = &level[i];
            let right = if i + 1 < level.len() {
                &level[i + 1]
            } else {
                &level[i]
            };
            next.push(node_hash(left, right));
            i += 2;
        }
        level = next;
    }
    level[0]
}
