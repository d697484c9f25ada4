//! Memory pool and proof-of-work mining loop for SmellyCoin.
//!
//! The pool is a FIFO queue of pending transactions, hash-indexed, with a
//! `spent_utxos` map tracking which mempool transaction currently owns each
//! referenced input — the mechanism that makes double-spend rejection and
//! conflict eviction O(1) instead of a linear scan. The mining loop runs on
//! a dedicated OS thread (CPU-bound nonce search has no business on the
//! async executor) and is cancelled cooperatively through a `watch` channel
//! checked once per attempt.

use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::Duration;

use log::debug;
use thiserror::Error;
use tokio::sync::watch;

use smellycoin_consensus::hash_meets_target;
use smellycoin_core::{Block, Hash, Transaction};

#[derive(Error, Debug)]
pub enum MempoolError {
    #[error("transaction is already in the pool")]
    AlreadyPresent,

    #[error("input references a UTXO already spent by another mempool transaction")]
    InvalidInputUtxo,
}

/// A FIFO pool of pending transactions with conflict detection.
///
/// Invariant: for every `(prev_tx_hash, out_index)` key in `spent_utxos`,
/// exactly one transaction in `index` has a matching input, and vice versa.
#[derive(Default)]
pub struct Mempool {
    order: VecDeque<Hash>,
    index: HashMap<Hash, Transaction>,
    spent_utxos: HashMap<(Hash, i32), Hash>,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&Transaction> {
        self.index.get(hash)
    }

    fn conflicting_owner(&self, tx: &Transaction) -> Option<Hash> {
        tx.vin
            .iter()
            .find_map(|input| self.spent_utxos.get(&(input.prev_tx_hash, input.out_index)).copied())
    }

    fn index_inputs(&mut self, hash: Hash, tx: &Transaction) {
        for input in &tx.vin {
            self.spent_utxos.insert((input.prev_tx_hash, input.out_index), hash);
        }
    }

    /// Append `tx` at the tail. Fails without evicting anything if `tx` is
    /// already present or any of its inputs conflict with an existing
    /// mempool transaction.
    pub fn push_back(&mut self, tx: Transaction) -> Result<(), MempoolError> {
        let hash = tx.hash();
        if self.index.contains_key(&hash) {
            return Err(MempoolError::AlreadyPresent);
        }
        if self.conflicting_owner(&tx).is_some() {
            return Err(MempoolError::InvalidInputUtxo);
        }

        self.index_inputs(hash, &tx);
        self.order.push_back(hash);
        self.index.insert(hash, tx);
        Ok(())
    }

    /// Insert `tx` at the head, displacing whatever mempool transaction(s)
    /// currently hold the outputs it spends. Used to reinstate a
    /// transaction that a reorg rolled back, ahead of everything already
    /// queued.
    pub fn push_front(&mut self, tx: Transaction) -> Result<(), MempoolError> {
        let hash = tx.hash();
        if self.index.contains_key(&hash) {
            return Err(MempoolError::AlreadyPresent);
        }

        while let Some(owner) = self.conflicting_owner(&tx) {
            self.delete(&owner);
        }

        self.index_inputs(hash, &tx);
        self.order.push_front(hash);
        self.index.insert(hash, tx);
        Ok(())
    }

    /// Remove a transaction and release its claim on `spent_utxos`.
    pub fn delete(&mut self, hash: &Hash) -> Option<Transaction> {
        let tx = self.index.remove(hash)?;
        for input in &tx.vin {
            if self.spent_utxos.get(&(input.prev_tx_hash, input.out_index)) == Some(hash) {
                self.spent_utxos.remove(&(input.prev_tx_hash, input.out_index));
            }
        }
        self.order.retain(|h| h != hash);
        Some(tx)
    }

    /// Evict whatever mempool transaction currently owns any of `tx`'s
    /// inputs, without inserting `tx` itself. Called when `tx` lands in a
    /// newly accepted block: any mempool transaction racing to spend the
    /// same input lost and is no longer spendable, even though `tx` itself
    /// doesn't need to be (re)inserted — it's already confirmed.
    pub fn evict_conflicts(&mut self, tx: &Transaction) {
        while let Some(owner) = self.conflicting_owner(tx) {
            self.delete(&owner);
        }
    }

    /// Remove every mempool transaction that (transitively) spends an
    /// output of `tx_hash`. Used when a transaction is reinstated into the
    /// pool during a reorg rollback: anything already queued against its
    /// (not-yet-real-again) outputs is no longer valid.
    pub fn delete_descendants(&mut self, tx_hash: &Hash) -> Vec<Transaction> {
        let mut removed = Vec::new();
        let mut frontier = vec![*tx_hash];

        while let Some(hash) = frontier.pop() {
            let owners: Vec<Hash> = self
                .spent_utxos
                .iter()
                .filter(|((prev, _), _)| *prev == hash)
                .map(|(_, owner)| *owner)
                .collect();

            for owner in owners {
                if let Some(tx) = self.delete(&owner) {
                    frontier.push(owner);
                    removed.push(tx);
                }
            }
        }

        removed
    }

    /// Greedily pack mempool transactions into `block` head-to-tail,
    /// stopping at the first one the block's size limit refuses. Does not
    /// mutate the pool — packed transactions stay queued until the block
    /// that contains them is actually committed.
    ///
    /// Coinbase transactions are never packed: a reorg rollback can
    /// reinstate a displaced coinbase into the pool (base spec §4.H phase
    /// 4), and `block` already carries its own coinbase as `txs[0]` —
    /// packing another would give the block a second coinbase, which
    /// `Block::validate_structure` rejects everywhere but locally.
    pub fn fill_block(&self, block: &mut Block) {
        for hash in &self.order {
            let Some(tx) = self.index.get(hash) else { continue };
            if tx.is_coinbase {
                continue;
            }
            if !block.try_add(tx.clone()) {
                break;
            }
        }
    }
}

/// Outcome of a `mine` call.
pub enum MineOutcome {
    Found(Block),
    Cancelled,
}

/// Search nonces for `block` until its header hash meets the fixed
/// difficulty target, or `cancel` is signalled. Checked once per attempt,
/// with a short sleep between attempts so the miner yields the core instead
/// of spinning — the exact sleep duration is a tuning knob, not a
/// correctness requirement.
pub fn mine(mut block: Block, cancel: &watch::Receiver<u64>) -> MineOutcome {
    let started_at = *cancel.borrow();

    for nonce in 0..=u32::MAX {
        if *cancel.borrow() != started_at {
            return MineOutcome::Cancelled;
        }

        block.header.nonce = nonce;
        if hash_meets_target(&block.header.hash()) {
            debug!("found valid nonce {nonce} for block at height {}", block.header.height);
            return MineOutcome::Found(block);
        }

        thread::sleep(Duration::from_micros(50));
    }

    MineOutcome::Cancelled
}

/// Spawn the mining loop on a dedicated OS thread. `cancel` is a `watch`
/// channel whose value is bumped (e.g. incremented) by any path that just
/// extended or reorganized the chain; `mine` notices the change within one
/// attempt and abandons its candidate.
pub fn spawn_miner(
    block: Block,
    cancel: watch::Receiver<u64>,
    on_found: impl FnOnce(Block) + Send + 'static,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        if let MineOutcome::Found(mined) = mine(block, &cancel) {
            on_found(mined);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use smellycoin_core::{TxInput, TxOutput};

    fn tx_spending(prev: Hash, out_index: i32, salt: u8) -> Transaction {
        Transaction::new(
            vec![TxInput { prev_tx_hash: prev, out_index, signature: vec![], pub_key: vec![] }],
            vec![TxOutput { value: 1, pub_key_hash: [salt; 20] }],
        )
    }

    #[test]
    fn push_back_rejects_duplicate_and_conflicting_input() {
        let mut pool = Mempool::new();
        let tx1 = tx_spending([1u8; 32], 0, 1);
        let tx2 = tx_spending([1u8; 32], 0, 2);

        assert!(pool.push_back(tx1.clone()).is_ok());
        assert!(matches!(pool.push_back(tx1), Err(MempoolError::AlreadyPresent)));
        assert!(matches!(pool.push_back(tx2), Err(MempoolError::InvalidInputUtxo)));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn push_front_displaces_conflicting_owner() {
        let mut pool = Mempool::new();
        let tx1 = tx_spending([1u8; 32], 0, 1);
        let tx1_hash = tx1.hash();
        pool.push_back(tx1).unwrap();

        let tx2 = tx_spending([1u8; 32], 0, 2);
        let tx2_hash = tx2.hash();
        pool.push_front(tx2).unwrap();

        assert!(!pool.contains(&tx1_hash));
        assert!(pool.contains(&tx2_hash));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn evict_conflicts_removes_only_the_input_owner() {
        let mut pool = Mempool::new();
        let root = [9u8; 32];
        let owner = tx_spending(root, 0, 1);
        let owner_hash = owner.hash();
        pool.push_back(owner).unwrap();

        let child = tx_spending(owner_hash, 0, 2);
        let child_hash = child.hash();
        pool.push_back(child).unwrap();

        let winner = tx_spending(root, 0, 3);
        pool.evict_conflicts(&winner);

        assert!(!pool.contains(&owner_hash));
        assert!(pool.contains(&child_hash));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn delete_descendants_removes_transitive_spenders() {
        let mut pool = Mempool::new();
        let root = [9u8; 32];
        let child = tx_spending(root, 0, 1);
        let child_hash = child.hash();
        pool.push_back(child).unwrap();

        let grandchild = tx_spending(child_hash, 0, 2);
        let grandchild_hash = grandchild.hash();
        pool.push_back(grandchild).unwrap();

        let removed = pool.delete_descendants(&root);
        assert_eq!(removed.len(), 2);
        assert!(!pool.contains(&child_hash));
        assert!(!pool.contains(&grandchild_hash));
    }

    #[test]
    fn fill_block_stops_at_size_limit_without_mutating_pool() {
        let mut pool = Mempool::new();
        for i in 0..3u8 {
            pool.push_back(tx_spending([i; 32], 0, i)).unwrap();
        }

        let mut block = Block::new(vec![Transaction::coinbase([0u8; 20], 10)], [0u8; 32], 1);
        pool.fill_block(&mut block);

        assert_eq!(block.txs.len(), 4);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn fill_block_skips_a_reinstated_coinbase() {
        let mut pool = Mempool::new();
        let coinbase = Transaction::coinbase([7u8; 20], 10);
        pool.push_back(coinbase).unwrap();
        pool.push_back(tx_spending([1u8; 32], 0, 1)).unwrap();

        let mut block = Block::new(vec![Transaction::coinbase([0u8; 20], 10)], [0u8; 32], 1);
        pool.fill_block(&mut block);

        assert_eq!(block.txs.len(), 2);
        assert!(!block.txs[1].is_coinbase);
    }

    #[test]
    fn mine_finds_a_nonce_for_trivial_target() {
        let block = Block::new(vec![Transaction::coinbase([0u8; 20], 10)], [0u8; 32], 0);
        let (_tx, rx) = watch::channel(0u64);
        match mine(block, &rx) {
            MineOutcome::Found(mined) => assert!(hash_meets_target(&mined.header.hash())),
            MineOutcome::Cancelled => panic!("expected a nonce to be found"),
        }
    }

    #[test]
    fn mine_stops_when_cancel_is_signalled() {
        let block = Block::new(vec![Transaction::coinbase([0u8; 20], 10)], [0u8; 32], 0);
        let (tx, rx) = watch::channel(0u64);
        tx.send(1).unwrap();
        assert!(matches!(mine(block, &rx), MineOutcome::Cancelled));
    }
}
