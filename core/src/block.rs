//! Block and BlockHeader data model, codec, and structural validation.
//!
//! Chain-state-aware validation (height vs. tip, prev-hash vs. tip, proof of
//! work against the live difficulty target) lives in `smellycoin-consensus`;
//! this module only enforces what can be checked from the block's own bytes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{codec, merkle_root, Hash, Transaction, TransactionValidationError, MAX_BLOCK_SIZE};

/// Block header. Height is carried alongside the header for convenience but,
/// per protocol, is **not** part of the hashed bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Empty (`[0; 32]`) for the genesis block.
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub nonce: u32,
    pub height: i32,
}

impl BlockHeader {
    /// `SHA256(prev_hash ++ merkle_root ++ le32(nonce))`. Height is not hashed.
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.prev_block_hash);
        hasher.update(self.merkle_root);
        hasher.update(self.nonce.to_le_bytes());
        hasher.finalize().into()
    }
}

/// A block: a header plus its ordered transaction list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    /// Construct a block with the given transactions (coinbase first),
    /// computing the Merkle root. Nonce starts at zero; height is caller-supplied.
    pub fn new(txs: Vec<Transaction>, prev_block_hash: Hash, height: i32) -> Self {
        let root = merkle_root(&txs.iter().map(Transaction::hash).collect::<Vec<_>>());
        let header = BlockHeader { prev_block_hash, merkle_root: root, nonce: 0, height };
        Block { header, txs }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn serialize(&self) -> Vec<u8> {
        codec::encode(self)
    }

    /// Decode a block from the wire. Used on the receiving end of `DATA`
    /// frames during gossip.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        codec::decode(bytes)
    }

    /// Recompute the Merkle root from `self.txs` and overwrite the header.
    pub fn recompute_merkle_root(&mut self) {
        self.header.merkle_root = merkle_root(&self.txs.iter().map(Transaction::hash).collect::<Vec<_>>());
    }

    /// Try to append `tx`, refusing if the resulting block would exceed the
    /// size limit. On success the Merkle root is recomputed.
    pub fn try_add(&mut self, tx: Transaction) -> bool {
        self.txs.push(tx);
        if self.serialize().len() > MAX_BLOCK_SIZE {
            self.txs.pop();
            return false;
        }
        self.recompute_merkle_root();
        true
    }

    /// Structural checks that don't require chain state or the live PoW
    /// target: exactly one coinbase and it is first, Merkle root matches,
    /// size within bound, and every transaction passes its own basic checks.
    pub fn validate_structure(&self) -> Result<(), BlockValidationError> {
        if self.txs.is_empty() || !self.txs[0].is_coinbase {
            return Err(BlockValidationError::MissingCoinbase);
        }
        if self.txs[1..].iter().any(|tx| tx.is_coinbase) {
            return Err(BlockValidationError::MultipleCoinbase);
        }

        let expected_root = merkle_root(&self.txs.iter().map(Transaction::hash).collect::<Vec<_>>());
        if expected_root != self.header.merkle_root {
            return Err(BlockValidationError::InvalidMerkleRoot);
        }

        if self.serialize().len() > MAX_BLOCK_SIZE {
            return Err(BlockValidationError::BlockTooLarge);
        }

        for tx in &self.txs {
            tx.validate_basic()?;
        }

        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum BlockValidationError {
    #[error("block's first transaction is not a coinbase")]
    MissingCoinbase,
    #[error("block contains more than one coinbase transaction")]
    MultipleCoinbase,
    #[error("header merkle root does not match recomputed root")]
    InvalidMerkleRoot,
    #[error("block exceeds the maximum serialized size")]
    BlockTooLarge,
    #[error("transaction validation error: {0}")]
    TransactionValidation(#[from] TransactionValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transaction;

    fn coinbase() -> Transaction {
        Transaction::coinbase([1u8; 20], 10)
    }

    #[test]
    fn new_block_computes_merkle_root_over_single_coinbase() {
        let cb = coinbase();
        let block = Block::new(vec![cb.clone()], [0u8; 32], 0);
        assert_eq!(block.header.merkle_root, merkle_root(&[cb.hash()]));
        assert_eq!(block.header.nonce, 0);
    }

    #[test]
    fn validate_structure_rejects_missing_coinbase() {
        let tx = Transaction::new(
            vec![crate::transaction::TxInput {
                prev_tx_hash: [9u8; 32],
                out_index: 0,
                signature: vec![],
                pub_key: vec![],
            }],
            vec![crate::transaction::TxOutput { value: 1, pub_key_hash: [0u8; 20] }],
        );
        let block = Block::new(vec![tx], [0u8; 32], 0);
        assert!(matches!(block.validate_structure(), Err(BlockValidationError::MissingCoinbase)));
    }

    #[test]
    fn validate_structure_rejects_second_coinbase() {
        let mut block = Block::new(vec![coinbase()], [0u8; 32], 0);
        block.txs.push(coinbase());
        block.recompute_merkle_root();
        assert!(matches!(block.validate_structure(), Err(BlockValidationError::MultipleCoinbase)));
    }

    #[test]
    fn validate_structure_detects_tampered_merkle_root() {
        let mut block = Block::new(vec![coinbase()], [0u8; 32], 0);
        block.header.merkle_root = [0xAB; 32];
        assert!(matches!(block.validate_structure(), Err(BlockValidationError::InvalidMerkleRoot)));
    }

    #[test]
    fn try_add_recomputes_merkle_root() {
        let mut block = Block::new(vec![coinbase()], [0u8; 32], 0);
        let root_before = block.header.merkle_root;
        let spend = Transaction::new(
            vec![crate::transaction::TxInput {
                prev_tx_hash: [2u8; 32],
                out_index: 0,
                signature: vec![9],
                pub_key: vec![9],
            }],
            vec![crate::transaction::TxOutput { value: 1, pub_key_hash: [3u8; 20] }],
        );
        assert!(block.try_add(spend));
        assert_ne!(block.header.merkle_root, root_before);
    }
}
