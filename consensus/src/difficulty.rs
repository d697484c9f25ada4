//! Fixed-difficulty proof-of-work target.
//!
//! Difficulty is a compile-time constant: `TARGET_BITS` leading bits of the
//! header hash, interpreted as a big-endian 256-bit unsigned integer, must be
//! zero. There is no retargeting — the source's difficulty-adjustment
//! algorithm (block-time-based `calculate_next_difficulty`) has no
//! counterpart here by design (see base spec Non-goals).

use smellycoin_core::{Hash, TARGET_BITS};

/// `2^(256 - TARGET_BITS)` as a big-endian 32-byte array.
pub fn target_bytes() -> [u8; 32] {
    let mut target = [0u8; 32];
    let exponent = 256 - TARGET_BITS;
    let byte_from_lsb = (exponent / 8) as usize;
    let bit_in_byte = exponent % 8;
    target[31 - byte_from_lsb] = 1u8 << bit_in_byte;
    target
}

/// Interpret `hash` as a big-endian 256-bit unsigned integer and check it is
/// strictly less than the fixed target.
pub fn hash_meets_target(hash: &Hash) -> bool {
    *hash < target_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_has_the_expected_leading_zero_bits() {
        let target = target_bytes();
        let bits = target
            .iter()
            .flat_map(|byte| (0..8).rev().map(move |i| (byte >> i) & 1));
        let leading_zeros = bits.take_while(|&b| b == 0).count();
        // The target's single set bit sits at bit index `256 - TARGET_BITS`,
        // so only `TARGET_BITS - 1` bits above it are zero.
        assert_eq!(leading_zeros as u32, TARGET_BITS - 1);
    }

    #[test]
    fn all_zero_hash_meets_target() {
        assert!(hash_meets_target(&[0u8; 32]));
    }

    #[test]
    fn all_ff_hash_does_not_meet_target() {
        assert!(!hash_meets_target(&[0xffu8; 32]));
    }
}
