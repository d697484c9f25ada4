//! Deterministic binary codec.
//!
//! Hashing and Merkle construction depend on exact byte output, so encoding is
//! a protocol-level concern, not an implementation detail. `bincode`'s default
//! configuration (fixed-width integers, length-prefixed sequences, no padding)
//! gives a stable, self-describing encoding for any `Serialize` type in this
//! crate.

use serde::{Deserialize, Serialize};

/// Encode `value` into the protocol's canonical byte representation.
pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("in-memory types are always serializable")
}

/// Decode a value previously produced by [`encode`]. Fails on truncated or
/// otherwise malformed input — callers on the network boundary (gossip,
/// chain store) treat this as "drop the message," not a fatal error.
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}
