//! Merkle tree root computation.
//!
//! Binary tree of SHA-256 nodes. A leaf is the hash of a serialized
//! transaction; a parent is `SHA256(left ++ right)`. A level with odd
//! cardinality duplicates its last node before pairing.

use crate::Hash;
use sha2::{Digest, Sha256};

fn ensure_even(level: &mut Vec<Hash>) {
    if level.len() % 2 != 0 {
        let last = *level.last().expect("non-empty level");
        level.push(last);
    }
}

fn parent_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Compute the Merkle root over a sequence of transaction hashes.
///
/// Panics if `tx_hashes` is empty — a block always has at least a coinbase.
pub fn merkle_root(tx_hashes: &[Hash]) -> Hash {
    assert!(!tx_hashes.is_empty(), "merkle root requires at least one transaction");

    let mut level: Vec<Hash> = tx_hashes.to_vec();
    while level.len() > 1 {
        ensure_even(&mut level);
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            next.push(parent_hash(&pair[0], &pair[1]));
        }
        level = next;
    }
    level[0]
}
