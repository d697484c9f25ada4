//! Transaction data model, codec, and structural validation.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{codec, Hash, PubKeyHash};

/// Sentinel previous-tx hash for a coinbase input.
const COINBASE_PREV_HASH: Hash = [0u8; 32];
/// Sentinel out-index for a coinbase input.
const COINBASE_OUT_INDEX: i32 = -1;
/// Bytes of randomness carried in a coinbase input's `pub_key` slot so that
/// two coinbases paying the same miner at the same height don't collide.
const COINBASE_RANDOMNESS_LEN: usize = 20;

/// A reference to a previously-unspent output, plus the proof that the
/// spender is entitled to consume it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_tx_hash: Hash,
    pub out_index: i32,
    pub signature: Vec<u8>,
    /// 64-byte ECDSA P-256 public key (X || Y), or coinbase randomness.
    pub pub_key: Vec<u8>,
}

impl TxInput {
    /// `out_index = -1` and an all-zero `prev_tx_hash` identify a coinbase input.
    pub fn is_coinbase(&self) -> bool {
        self.out_index == COINBASE_OUT_INDEX && self.prev_tx_hash == COINBASE_PREV_HASH
    }
}

/// A spendable output locking `value` units to `pub_key_hash`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub pub_key_hash: PubKeyHash,
}

/// A transaction: an ordered sequence of inputs and outputs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub vin: Vec<TxInput>,
    pub vout: Vec<TxOutput>,
    pub is_coinbase: bool,
}

impl Transaction {
    /// Build a non-coinbase transaction from existing inputs/outputs.
    pub fn new(vin: Vec<TxInput>, vout: Vec<TxOutput>) -> Self {
        Transaction { vin, vout, is_coinbase: false }
    }

    /// Build the coinbase transaction for a newly mined block, paying the
    /// fixed subsidy to `pub_key_hash`. The input carries 20 bytes of
    /// randomness in place of a public key so that two coinbases paying the
    /// same address at the same height still hash to distinct transactions.
    pub fn coinbase(pub_key_hash: PubKeyHash, subsidy: u64) -> Self {
        let mut randomness = vec![0u8; COINBASE_RANDOMNESS_LEN];
        rand::thread_rng().fill_bytes(&mut randomness);

        let vin = vec![TxInput {
            prev_tx_hash: COINBASE_PREV_HASH,
            out_index: COINBASE_OUT_INDEX,
            signature: Vec::new(),
            pub_key: randomness,
        }];
        let vout = vec![TxOutput { value: subsidy, pub_key_hash }];

        Transaction { vin, vout, is_coinbase: true }
    }

    /// Deterministic binary encoding of this transaction.
    pub fn serialize(&self) -> Vec<u8> {
        codec::encode(self)
    }

    /// Decode a transaction from the wire. Used on the receiving end of
    /// `DATA` frames and the wallet HTTP surface.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        codec::decode(bytes)
    }

    /// SHA-256 of the transaction's deterministic serialization. This is the
    /// transaction identifier used everywhere: UTXO keys, mempool index,
    /// inventory hashes.
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.serialize());
        hasher.finalize().into()
    }

    /// A copy of this transaction with every input's `signature` and
    /// `pub_key` cleared. This is exactly what gets signed and exactly what
    /// a verifier must reconstruct and hash to check a signature.
    pub fn trimmed_copy(&self) -> Transaction {
        let vin = self
            .vin
            .iter()
            .map(|input| TxInput {
                prev_tx_hash: input.prev_tx_hash,
                out_index: input.out_index,
                signature: Vec::new(),
                pub_key: Vec::new(),
            })
            .collect();

        Transaction { vin, vout: self.vout.clone(), is_coinbase: self.is_coinbase }
    }

    /// Structural checks that don't require chain state: at least one input
    /// (coinbase's sentinel input counts), at least one output, no output of
    /// value zero, non-coinbase inputs are not themselves coinbase sentinels.
    pub fn validate_basic(&self) -> Result<(), TransactionValidationError> {
        if self.vin.is_empty() {
            return Err(TransactionValidationError::NoInputs);
        }
        if self.vout.is_empty() {
            return Err(TransactionValidationError::NoOutputs);
        }
        for output in &self.vout {
            if output.value == 0 {
                return Err(TransactionValidationError::ZeroOutput);
            }
        }
        if !self.is_coinbase {
            for input in &self.vin {
                if input.is_coinbase() {
                    return Err(TransactionValidationError::UnexpectedCoinbaseInput);
                }
            }
        }
        Ok(())
    }

    pub fn output_total(&self) -> u64 {
        self.vout.iter().map(|o| o.value).sum()
    }
}

#[derive(Error, Debug)]
pub enum TransactionValidationError {
    #[error("transaction has no inputs")]
    NoInputs,
    #[error("transaction has no outputs")]
    NoOutputs,
    #[error("transaction has a zero-value output")]
    ZeroOutput,
    #[error("non-coinbase transaction has a coinbase-shaped input")]
    UnexpectedCoinbaseInput,
}
