//! Embedded chain store for SmellyCoin.
//!
//! Backed by `sled`, an ordered byte-key KV store. Two trees: `blocks`
//! (block hash -> encoded block, plus the tip pointer under key `"l"`) and
//! `chainstate` (the UTXO set, forward- and reverse-indexed for O(1)
//! apply/revert during reorgs). Mirrors the reference node's LevelDB layout
//! one level up: the forward index lets spend checks avoid re-deriving the
//! whole UTXO set from block history, and the reverse index lets `remove_block`
//! undo a transaction's spends without replaying the chain from genesis.
//!
//! Disk I/O failures are unexpected once `sled::open` has succeeded, so they
//! are treated as fatal: logged at `error!` and turned into a panic, the same
//! discipline the reference node applies to its LevelDB calls. Logical
//! contract violations (removing a block that isn't the tip, looking up a
//! block that was never stored) are ordinary `Result` errors.

use std::collections::BTreeMap;
use std::path::Path;

use log::error;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use smellycoin_consensus::UtxoLookup;
use smellycoin_core::{Block, Hash, Transaction, TxOutput};

const TIP_KEY: &[u8] = b"l";
const UTXO_PREFIX: &[u8] = b"utxo:";
const REV_PREFIX: &[u8] = b"rev:";

/// The all-zero hash marks "no parent" (the genesis block's `prev_block_hash`)
/// and, symmetrically, "no tip" (an empty chain). An actual block hashing to
/// all zeroes is not something SHA-256 preimage resistance will produce.
pub const NO_PARENT: Hash = [0u8; 32];

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("block not found")]
    BlockNotFound,

    #[error("cannot remove a block that is not the current tip")]
    NotTip,

    #[error("chain is empty")]
    EmptyChain,

    #[error("transaction input references a UTXO this store does not have: {0}")]
    MissingUtxo(String),
}

type UtxoMap = BTreeMap<u32, TxOutput>;

fn utxo_key(tx_hash: &Hash) -> Vec<u8> {
    let mut key = UTXO_PREFIX.to_vec();
    key.extend_from_slice(tx_hash);
    key
}

fn rev_key(spender: &Hash, spent: &Hash) -> Vec<u8> {
    let mut key = REV_PREFIX.to_vec();
    key.extend_from_slice(spender);
    key.push(b':');
    key.extend_from_slice(spent);
    key
}

/// Panics on disk I/O failure, matching the reference node's "an unreadable
/// database is not a recoverable condition" stance.
fn expect_ok<T>(result: sled::Result<T>, context: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            error!("fatal storage error during {context}: {err}");
            panic!("fatal storage error during {context}: {err}");
        }
    }
}

/// The node's chain store: blocks plus the UTXO set they imply.
///
/// Callers are expected to run full consensus validation (see the
/// `smellycoin-consensus` crate) *before* calling `put_block` — this type
/// performs no re-validation, only the mechanical work of linking a block
/// in and updating indices. Serializing concurrent mutation (so a reorg
/// cannot interleave with a competing `put_block`) is the node supervisor's
/// job, not this crate's.
pub struct ChainStore {
    blocks: sled::Tree,
    chainstate: sled::Tree,
}

impl ChainStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = expect_ok(sled::open(path), "opening database");
        let blocks = expect_ok(db.open_tree("blocks"), "opening blocks tree");
        let chainstate = expect_ok(db.open_tree("chainstate"), "opening chainstate tree");
        Ok(ChainStore { blocks, chainstate })
    }

    /// The current tip's hash, or `None` if the chain is empty.
    pub fn tip_hash(&self) -> Option<Hash> {
        let ivec = expect_ok(self.blocks.get(TIP_KEY), "reading tip pointer")?;
        if ivec.len() != 32 {
            return None;
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&ivec);
        Some(hash)
    }

    /// The tip's height, or `-1` if the chain is empty.
    pub fn height(&self) -> i32 {
        match self.tip_hash().and_then(|hash| self.get_block(&hash)) {
            Some(block) => block.header.height,
            None => -1,
        }
    }

    pub fn get_block(&self, hash: &Hash) -> Option<Block> {
        let bytes = expect_ok(self.blocks.get(hash), "reading block")?;
        Some(decode(&bytes, "block"))
    }

    /// Link a new tip block onto the chain and index its transactions.
    /// The caller must have already validated `block` against the current
    /// tip (height, prev-hash linkage, proof of work, per-transaction
    /// balance and signature checks).
    pub fn put_block(&self, block: &Block) -> Result<(), StorageError> {
        for tx in &block.txs {
            self.apply_transaction(tx)?;
        }

        let hash = block.hash();
        expect_ok(self.blocks.insert(hash, block.serialize()), "inserting block");
        expect_ok(self.blocks.insert(TIP_KEY, &hash), "advancing tip");
        expect_ok(self.blocks.flush(), "flushing block write");
        Ok(())
    }

    /// Undo the current tip, restoring the UTXO set to its state as of the
    /// parent block and moving the tip pointer back one block. Used during
    /// reorgs to unwind the losing branch down to the common ancestor.
    pub fn remove_block(&self, hash: &Hash) -> Result<(), StorageError> {
        let tip = self.tip_hash().ok_or(StorageError::EmptyChain)?;
        if tip != *hash {
            return Err(StorageError::NotTip);
        }
        let block = self.get_block(hash).ok_or(StorageError::BlockNotFound)?;

        for tx in block.txs.iter().rev() {
            self.revert_transaction(tx)?;
        }

        expect_ok(self.blocks.remove(hash), "removing block body");
        if block.header.prev_block_hash == NO_PARENT {
            expect_ok(self.blocks.remove(TIP_KEY), "clearing tip pointer");
        } else {
            expect_ok(self.blocks.insert(TIP_KEY, &block.header.prev_block_hash), "rewinding tip");
        }
        expect_ok(self.blocks.flush(), "flushing block removal");
        Ok(())
    }

    fn apply_transaction(&self, tx: &Transaction) -> Result<(), StorageError> {
        let tx_hash = tx.hash();

        if !tx.is_coinbase {
            let mut consumed_by_prev: BTreeMap<Hash, UtxoMap> = BTreeMap::new();

            for input in &tx.vin {
                let key = utxo_key(&input.prev_tx_hash);
                let mut map: UtxoMap = expect_ok(self.chainstate.get(&key), "reading utxo entry")
                    .map(|ivec| decode(&ivec, "utxo map"))
                    .ok_or_else(|| StorageError::MissingUtxo(hex::encode(input.prev_tx_hash)))?;

                let output = map
                    .remove(&(input.out_index as u32))
                    .ok_or_else(|| StorageError::MissingUtxo(hex::encode(input.prev_tx_hash)))?;

                if map.is_empty() {
                    expect_ok(self.chainstate.remove(&key), "removing exhausted utxo entry");
                } else {
                    expect_ok(self.chainstate.insert(&key, encode(&map)), "updating utxo entry");
                }

                consumed_by_prev
                    .entry(input.prev_tx_hash)
                    .or_default()
                    .insert(input.out_index as u32, output);
            }

            for (prev_tx_hash, consumed) in consumed_by_prev {
                let key = rev_key(&tx_hash, &prev_tx_hash);
                expect_ok(self.chainstate.insert(&key, encode(&consumed)), "recording reverse index");
            }
        }

        if !tx.vout.is_empty() {
            let map: UtxoMap = tx
                .vout
                .iter()
                .enumerate()
                .map(|(index, output)| (index as u32, output.clone()))
                .collect();
            expect_ok(self.chainstate.insert(&utxo_key(&tx_hash), encode(&map)), "inserting new utxo entry");
        }

        Ok(())
    }

    fn revert_transaction(&self, tx: &Transaction) -> Result<(), StorageError> {
        let tx_hash = tx.hash();
        expect_ok(self.chainstate.remove(&utxo_key(&tx_hash)), "removing reverted utxo entry");

        if !tx.is_coinbase {
            let mut prevs: Vec<Hash> = tx.vin.iter().map(|input| input.prev_tx_hash).collect();
            prevs.sort();
            prevs.dedup();

            for prev_tx_hash in prevs {
                let key = rev_key(&tx_hash, &prev_tx_hash);
                let restored: UtxoMap = match expect_ok(self.chainstate.get(&key), "reading reverse index") {
                    Some(ivec) => decode(&ivec, "reverse index entry"),
                    None => continue,
                };

                let utxo_key = utxo_key(&prev_tx_hash);
                let mut map: UtxoMap = expect_ok(self.chainstate.get(&utxo_key), "reading utxo entry for restore")
                    .map(|ivec| decode(&ivec, "utxo map"))
                    .unwrap_or_default();
                map.extend(restored);
                expect_ok(self.chainstate.insert(&utxo_key, encode(&map)), "restoring utxo entry");
                expect_ok(self.chainstate.remove(&key), "clearing reverse index");
            }
        }

        Ok(())
    }

    /// Up to `n` hashes walking back from the tip, most recent first.
    pub fn last_block_hashes(&self, n: usize) -> Vec<Hash> {
        let mut hashes = Vec::with_capacity(n);
        let mut cursor = self.tip_hash();
        while hashes.len() < n {
            let Some(hash) = cursor else { break };
            hashes.push(hash);
            cursor = self.get_block(&hash).and_then(|block| {
                (block.header.prev_block_hash != NO_PARENT).then_some(block.header.prev_block_hash)
            });
        }
        hashes
    }

    /// Blocks strictly after `from` up to and including the tip, in
    /// ascending height order. `from == NO_PARENT` returns the whole chain.
    pub fn blocks_starting_at(&self, from: &Hash) -> Vec<Block> {
        let mut collected = Vec::new();
        let mut cursor = self.tip_hash();

        while let Some(hash) = cursor {
            if hash == *from {
                break;
            }
            let Some(block) = self.get_block(&hash) else { break };
            let prev = block.header.prev_block_hash;
            let is_genesis = prev == NO_PARENT;
            collected.push(block);
            if is_genesis {
                break;
            }
            cursor = Some(prev);
        }

        collected.reverse();
        collected
    }

    /// Every unspent output paying `pub_key_hash`.
    pub fn find_utxos(&self, pub_key_hash: &[u8; 20]) -> Vec<(Hash, u32, TxOutput)> {
        let mut found = Vec::new();
        for entry in self.chainstate.scan_prefix(UTXO_PREFIX) {
            let (key, value) = expect_ok(entry, "scanning utxo set");
            let tx_hash: Hash = match key[UTXO_PREFIX.len()..].try_into() {
                Ok(hash) => hash,
                Err(_) => continue,
            };
            let map: UtxoMap = decode(&value, "utxo map");
            for (index, output) in map {
                if &output.pub_key_hash == pub_key_hash {
                    found.push((tx_hash, index, output));
                }
            }
        }
        found
    }

    /// Enough unspent outputs paying `pub_key_hash` to cover `amount`, plus
    /// their combined value. Stops scanning as soon as the target is met;
    /// does not guarantee a minimal selection.
    pub fn find_spendable_utxos(&self, pub_key_hash: &[u8; 20], amount: u64) -> (u64, Vec<(Hash, u32)>) {
        let mut total = 0u64;
        let mut selected = Vec::new();

        'scan: for entry in self.chainstate.scan_prefix(UTXO_PREFIX) {
            let (key, value) = expect_ok(entry, "scanning utxo set");
            let tx_hash: Hash = match key[UTXO_PREFIX.len()..].try_into() {
                Ok(hash) => hash,
                Err(_) => continue,
            };
            let map: UtxoMap = decode(&value, "utxo map");
            for (index, output) in map {
                if &output.pub_key_hash == pub_key_hash {
                    total += output.value;
                    selected.push((tx_hash, index));
                    if total >= amount {
                        break 'scan;
                    }
                }
            }
        }

        (total, selected)
    }
}

impl UtxoLookup for ChainStore {
    fn lookup(&self, tx_hash: &Hash, out_index: i32) -> Option<TxOutput> {
        if out_index < 0 {
            return None;
        }
        let ivec = expect_ok(self.chainstate.get(utxo_key(tx_hash)), "looking up utxo")?;
        let map: UtxoMap = decode(&ivec, "utxo map");
        map.get(&(out_index as u32)).cloned()
    }
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("chainstate values are always serializable")
}

fn decode<T: for<'a> Deserialize<'a>>(bytes: &[u8], what: &str) -> T {
    bincode::deserialize(bytes).unwrap_or_else(|err| {
        error!("corrupt {what} in chainstate: {err}");
        panic!("corrupt {what} in chainstate: {err}");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use smellycoin_core::{Block, Transaction, TxInput};

    fn temp_store() -> ChainStore {
        let dir = std::env::temp_dir().join(format!(
            "smellycoin-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .subsec_nanos()
        ));
        ChainStore::open(dir).unwrap()
    }

    #[test]
    fn empty_store_has_no_tip_and_height_minus_one() {
        let store = temp_store();
        assert_eq!(store.tip_hash(), None);
        assert_eq!(store.height(), -1);
    }

    #[test]
    fn put_block_advances_tip_and_indexes_coinbase_output() {
        let store = temp_store();
        let coinbase = Transaction::coinbase([7u8; 20], 10);
        let coinbase_hash = coinbase.hash();
        let genesis = Block::new(vec![coinbase], NO_PARENT, 0);
        let genesis_hash = genesis.hash();

        store.put_block(&genesis).unwrap();

        assert_eq!(store.tip_hash(), Some(genesis_hash));
        assert_eq!(store.height(), 0);
        assert_eq!(store.lookup(&coinbase_hash, 0).unwrap().value, 10);
    }

    #[test]
    fn spend_moves_output_into_reverse_index_and_remove_block_restores_it() {
        let store = temp_store();
        let keypair = smellycoin_crypto::KeyPair::generate();
        let coinbase = Transaction::coinbase(keypair.pub_key_hash(), 10);
        let coinbase_hash = coinbase.hash();
        let genesis = Block::new(vec![coinbase], NO_PARENT, 0);
        store.put_block(&genesis).unwrap();

        let mut spend = Transaction::new(
            vec![TxInput { prev_tx_hash: coinbase_hash, out_index: 0, signature: vec![], pub_key: vec![] }],
            vec![TxOutput { value: 10, pub_key_hash: [9u8; 20] }],
        );
        let digest = spend.trimmed_copy().hash();
        spend.vin[0].signature = keypair.sign(&digest);
        spend.vin[0].pub_key = keypair.public_key_bytes().to_vec();
        let spend_hash = spend.hash();

        let next = Block::new(vec![Transaction::coinbase([1u8; 20], 10), spend], genesis.hash(), 1);
        store.put_block(&next).unwrap();

        assert!(store.lookup(&coinbase_hash, 0).is_none());
        assert_eq!(store.lookup(&spend_hash, 0).unwrap().value, 10);

        store.remove_block(&next.hash()).unwrap();

        assert_eq!(store.tip_hash(), Some(genesis.hash()));
        assert_eq!(store.lookup(&coinbase_hash, 0).unwrap().value, 10);
        assert!(store.lookup(&spend_hash, 0).is_none());
    }

    #[test]
    fn remove_block_refuses_non_tip() {
        let store = temp_store();
        let genesis = Block::new(vec![Transaction::coinbase([1u8; 20], 10)], NO_PARENT, 0);
        store.put_block(&genesis).unwrap();
        assert!(matches!(store.remove_block(&[0xffu8; 32]), Err(StorageError::NotTip)));
    }

    #[test]
    fn find_utxos_filters_by_pub_key_hash() {
        let store = temp_store();
        let genesis = Block::new(vec![Transaction::coinbase([3u8; 20], 10)], NO_PARENT, 0);
        store.put_block(&genesis).unwrap();

        let found = store.find_utxos(&[3u8; 20]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].2.value, 10);

        assert!(store.find_utxos(&[4u8; 20]).is_empty());
    }

    #[test]
    fn find_spendable_utxos_stops_once_amount_is_covered() {
        let store = temp_store();
        let genesis = Block::new(vec![Transaction::coinbase([3u8; 20], 10)], NO_PARENT, 0);
        store.put_block(&genesis).unwrap();

        let (total, selected) = store.find_spendable_utxos(&[3u8; 20], 5);
        assert_eq!(total, 10);
        assert_eq!(selected.len(), 1);

        let (total, selected) = store.find_spendable_utxos(&[3u8; 20], 100);
        assert_eq!(total, 10);
        assert_eq!(selected.len(), 1);
    }
}
