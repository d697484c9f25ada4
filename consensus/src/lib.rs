//! SmellyCoin consensus rules: the node-wide error taxonomy, fixed-difficulty
//! proof-of-work check, and transaction/block validation against chain state.

use log::debug;
use thiserror::Error;

use smellycoin_core::{Block, BlockHeader, BlockValidationError, Hash, Transaction, TransactionValidationError, TxOutput};

pub mod difficulty;

pub use difficulty::{hash_meets_target, target_bytes};

/// The ten error kinds surfaced by the validator, chain store, and gossip
/// state machine. Shared across crates so network/storage/mining code can
/// propagate one consistent taxonomy to callers.
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("input references a non-existent or already-spent output")]
    InvalidInputUtxo,

    #[error("transaction outputs exceed inputs")]
    OutputExceedsInput,

    #[error("block height does not follow the tip")]
    InvalidHeight,

    #[error("block's prev_block_hash does not match the current tip")]
    InvalidPrev,

    #[error("block header merkle root does not match its transactions")]
    InvalidMerkle,

    #[error("block header hash does not meet the proof-of-work target")]
    InvalidNonce,

    #[error("received block sequence does not link to any known block")]
    OrphanBlock,

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("block structure invalid: {0}")]
    BlockStructure(#[from] BlockValidationError),

    #[error("transaction structure invalid: {0}")]
    TransactionStructure(#[from] TransactionValidationError),

    #[error("crypto error: {0}")]
    Crypto(#[from] smellycoin_crypto::CryptoError),
}

/// A lookup of currently-unspent outputs, keyed by `(tx_hash, out_index)`.
/// Implemented by the chain store; kept as a trait object here so consensus
/// does not depend on storage's concrete type.
pub trait UtxoLookup {
    fn lookup(&self, tx_hash: &Hash, out_index: i32) -> Option<TxOutput>;
}

/// Verify a transaction against chain state. Does not mutate anything.
///
/// Coinbase transactions pass unconditionally — their correctness (subsidy
/// amount, uniqueness within a block) is enforced by block-level checks.
pub fn verify_transaction(tx: &Transaction, utxos: &dyn UtxoLookup) -> Result<(), ConsensusError> {
    tx.validate_basic()?;

    if tx.is_coinbase {
        return Ok(());
    }

    let trimmed = tx.trimmed_copy();
    let digest = trimmed.hash();

    let mut input_total: u64 = 0;
    for input in &tx.vin {
        let output = utxos
            .lookup(&input.prev_tx_hash, input.out_index)
            .ok_or(ConsensusError::InvalidInputUtxo)?;

        let pub_key_hash = smellycoin_crypto::pub_key_hash(&input.pub_key);
        if pub_key_hash != output.pub_key_hash {
            return Err(ConsensusError::InvalidSignature);
        }
        if !smellycoin_crypto::verify(&input.pub_key, &digest, &input.signature)? {
            return Err(ConsensusError::InvalidSignature);
        }

        input_total = input_total
            .checked_add(output.value)
            .ok_or(ConsensusError::OutputExceedsInput)?;
    }

    let output_total = tx.output_total();
    if output_total > input_total {
        return Err(ConsensusError::OutputExceedsInput);
    }

    Ok(())
}

/// Verify a block's header against the expected chain position and the
/// fixed-difficulty target. Structural checks (merkle root, single
/// coinbase, size) are delegated to `Block::validate_structure`.
pub fn verify_block_header(header: &BlockHeader, expected_height: i32, expected_prev: &Hash) -> Result<(), ConsensusError> {
    if header.height != expected_height {
        return Err(ConsensusError::InvalidHeight);
    }
    if &header.prev_block_hash != expected_prev {
        return Err(ConsensusError::InvalidPrev);
    }
    if !hash_meets_target(&header.hash()) {
        return Err(ConsensusError::InvalidNonce);
    }
    Ok(())
}

/// Full verification of a candidate block: structure, header position, PoW,
/// and every transaction against the supplied UTXO view. Does not check for
/// conflicting spends *within* the block — callers are expected to run each
/// transaction through a scratch mempool for that (see base spec §4.H phase
/// 4), since that check is stateful across the whole block.
pub fn verify_block(block: &Block, expected_height: i32, expected_prev: &Hash, utxos: &dyn UtxoLookup) -> Result<(), ConsensusError> {
    block.validate_structure()?;
    verify_block_header(&block.header, expected_height, expected_prev)?;

    for tx in &block.txs {
        verify_transaction(tx, utxos)?;
    }

    debug!("block {} at height {} passed full verification", hex::encode(block.hash()), block.header.height);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use smellycoin_core::{Transaction, TxInput};
    use std::collections::HashMap;

    struct FakeUtxos(HashMap<(Hash, i32), TxOutput>);

    impl UtxoLookup for FakeUtxos {
        fn lookup(&self, tx_hash: &Hash, out_index: i32) -> Option<TxOutput> {
            self.0.get(&(*tx_hash, out_index)).cloned()
        }
    }

    #[test]
    fn coinbase_passes_unconditionally() {
        let tx = Transaction::coinbase([1u8; 20], 10);
        let utxos = FakeUtxos(HashMap::new());
        assert!(verify_transaction(&tx, &utxos).is_ok());
    }

    #[test]
    fn spend_with_valid_signature_passes() {
        let keypair = smellycoin_crypto::KeyPair::generate();
        let prev_hash = [5u8; 32];
        let prev_output = TxOutput { value: 10, pub_key_hash: keypair.pub_key_hash() };

        let mut tx = Transaction::new(
            vec![TxInput { prev_tx_hash: prev_hash, out_index: 0, signature: vec![], pub_key: vec![] }],
            vec![TxOutput { value: 10, pub_key_hash: [9u8; 20] }],
        );
        let digest = tx.trimmed_copy().hash();
        tx.vin[0].signature = keypair.sign(&digest);
        tx.vin[0].pub_key = keypair.public_key_bytes().to_vec();

        let mut map = HashMap::new();
        map.insert((prev_hash, 0), prev_output);
        let utxos = FakeUtxos(map);

        assert!(verify_transaction(&tx, &utxos).is_ok());
    }

    #[test]
    fn spend_exceeding_input_value_is_rejected() {
        let keypair = smellycoin_crypto::KeyPair::generate();
        let prev_hash = [5u8; 32];
        let prev_output = TxOutput { value: 5, pub_key_hash: keypair.pub_key_hash() };

        let mut tx = Transaction::new(
            vec![TxInput { prev_tx_hash: prev_hash, out_index: 0, signature: vec![], pub_key: vec![] }],
            vec![TxOutput { value: 10, pub_key_hash: [9u8; 20] }],
        );
        let digest = tx.trimmed_copy().hash();
        tx.vin[0].signature = keypair.sign(&digest);
        tx.vin[0].pub_key = keypair.public_key_bytes().to_vec();

        let mut map = HashMap::new();
        map.insert((prev_hash, 0), prev_output);
        let utxos = FakeUtxos(map);

        assert!(matches!(verify_transaction(&tx, &utxos), Err(ConsensusError::OutputExceedsInput)));
    }

    #[test]
    fn missing_utxo_is_rejected() {
        let keypair = smellycoin_crypto::KeyPair::generate();
        let mut tx = Transaction::new(
            vec![TxInput { prev_tx_hash: [1u8; 32], out_index: 0, signature: vec![], pub_key: vec![] }],
            vec![TxOutput { value: 1, pub_key_hash: [9u8; 20] }],
        );
        let digest = tx.trimmed_copy().hash();
        tx.vin[0].signature = keypair.sign(&digest);
        tx.vin[0].pub_key = keypair.public_key_bytes().to_vec();

        let utxos = FakeUtxos(HashMap::new());
        assert!(matches!(verify_transaction(&tx, &utxos), Err(ConsensusError::InvalidInputUtxo)));
    }

    #[test]
    fn header_position_checks() {
        let header = BlockHeader { prev_block_hash: [1u8; 32], merkle_root: [0u8; 32], nonce: 0, height: 5 };
        assert!(matches!(verify_block_header(&header, 6, &[1u8; 32]), Err(ConsensusError::InvalidHeight)));
        assert!(matches!(verify_block_header(&header, 5, &[2u8; 32]), Err(ConsensusError::InvalidPrev)));
    }
}
