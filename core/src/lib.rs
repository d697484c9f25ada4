//! SmellyCoin Core Types and Data Structures
//!
//! This module defines the fundamental data structures used throughout the SmellyCoin
//! node: blocks, transactions, the Merkle tree, and their deterministic binary codec.

use thiserror::Error;

pub mod block;
pub mod codec;
pub mod merkle;
pub mod transaction;

pub use block::{Block, BlockHeader, BlockValidationError};
pub use merkle::merkle_root;
pub use transaction::{Transaction, TransactionValidationError, TxInput, TxOutput};

/// Hash type used throughout the system (SHA-256 digest).
pub type Hash = [u8; 32];

/// Public key hash (P2PKH address payload, RIPEMD160(SHA256(pubkey))).
pub type PubKeyHash = [u8; 20];

/// Maximum serialized block size in bytes.
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Block subsidy in smallest units, constant (no halving).
pub const BLOCK_SUBSIDY: u64 = 10;

/// Number of bits that must be zero in a header hash for it to be valid.
pub const TARGET_BITS: u32 = 14;

/// Core error types, aggregating the block/transaction validation error enums.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("block validation error: {0}")]
    BlockValidation(#[from] BlockValidationError),

    #[error("transaction validation error: {0}")]
    TransactionValidation(#[from] TransactionValidationError),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}
