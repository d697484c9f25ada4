//! Gossip state machine: handshake, inventory exchange, and fork-aware
//! block/transaction propagation (base spec §4.H).
//!
//! `GossipContext` bundles exactly the shared state a gossip-driven state
//! transition needs: the chain store, the mempool, the peer registry, and
//! the mining cancellation signal. It is the thing the node supervisor
//! (the binary crate) constructs once and clones (cheaply, behind `Arc`s)
//! into the command loop and the HTTP wallet surface alike.

use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use smellycoin_consensus::{verify_block, verify_transaction, ConsensusError};
use smellycoin_core::{Block, Hash, PubKeyHash, Transaction, TxOutput};
use smellycoin_mining::{Mempool, MempoolError};
use smellycoin_storage::{ChainStore, StorageError, NO_PARENT};

use crate::message::{
    self, decode_hash, encode_data_items, encode_hash, encode_inv_items, parse_data_items, parse_inv_items, Frame,
    InvItem, InvKind,
};
use crate::peer::{PeerCommand, PeerManager};

/// Locator depth for `GET_BLOCKS`: the last six tip hashes, newest first.
pub const BLOCK_CONFIRMATIONS: usize = 6;

#[derive(Error, Debug)]
pub enum GossipError {
    #[error("received block sequence does not link to any known block")]
    OrphanBlock,

    #[error("two transactions in the same block spend the same output")]
    DoubleSpendWithinBlock,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("mempool rejected transaction: {0}")]
    Mempool(#[from] MempoolError),
}

/// Shared state for every gossip-driven state transition. Cheap to clone:
/// every field is already an `Arc` (or, for `cancel`, a `watch::Sender`,
/// itself cheaply cloneable).
#[derive(Clone)]
pub struct GossipContext {
    pub store: Arc<ChainStore>,
    pub mempool: Arc<RwLock<Mempool>>,
    pub peers: Arc<PeerManager>,
    /// Bumped by any path that just extended or reorganized the chain; the
    /// miner polls this once per nonce attempt and abandons stale work.
    pub cancel: watch::Sender<u64>,
    /// Serializes `put_block`/`remove_block`/reorg against the mining
    /// loop's own `put_block` on a freshly-mined block (base spec §4.I).
    pub node_mu: Arc<Mutex<()>>,
    /// Addresses learned from `ADDR` that aren't connected yet are handed
    /// to the supervisor's dial loop over this channel, rather than dialed
    /// directly from a gossip handler (dialing needs the TCP listener's
    /// context, not just chain state).
    pub dial_requests: mpsc::UnboundedSender<IpAddr>,
}

impl GossipContext {
    fn signal_new_tip(&self) {
        self.cancel.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Every unspent output paying `pub_key_hash`, tagged with the owning
    /// transaction hash and output index so a wallet can build inputs from
    /// the result.
    pub fn find_utxos(&self, pub_key_hash: &PubKeyHash) -> Vec<(Hash, u32, TxOutput)> {
        self.store.find_utxos(pub_key_hash)
    }

    /// Enough unspent outputs to cover `amount`, grouped by owning
    /// transaction hash, plus their combined value.
    pub fn find_spendable_utxos(&self, pub_key_hash: &PubKeyHash, amount: u64) -> (u64, Vec<(Hash, u32)>) {
        self.store.find_spendable_utxos(pub_key_hash, amount)
    }

    /// Validate-then-push-back a wallet-submitted transaction, broadcasting
    /// `INV` for it on success. The entry point the HTTP wallet surface and
    /// any other trusted local submitter calls (base spec §4.I
    /// `add_tx_to_mempool`) — unlike `receive_txs`, this path does run full
    /// chainstate validation, since a locally-submitted transaction has no
    /// upstream gossip peer to have already checked it.
    pub async fn add_tx_to_mempool(&self, tx: Transaction) -> Result<Hash, GossipError> {
        verify_transaction(&tx, self.store.as_ref())?;
        let hash = tx.hash();
        self.mempool.write().await.push_back(tx)?;
        self.peers.broadcast(Frame::new(message::INV, encode_inv_items(&[InvItem { kind: InvKind::Tx, hash }]))).await;
        Ok(hash)
    }

    /// Deserialize and admit each transaction payload into the mempool.
    /// Already-known transactions are skipped; failures (double-spend
    /// against another mempool entry, malformed bytes) are dropped
    /// silently — full chainstate validity is enforced at block-verify
    /// time or by `add_tx_to_mempool`, not here (base spec §4.H).
    pub async fn receive_txs(&self, payloads: &[Vec<u8>]) -> Vec<Hash> {
        let mut accepted = Vec::new();
        let mut mempool = self.mempool.write().await;
        for bytes in payloads {
            let Ok(tx) = Transaction::deserialize(bytes) else { continue };
            let hash = tx.hash();
            if mempool.contains(&hash) {
                continue;
            }
            if mempool.push_back(tx).is_ok() {
                accepted.push(hash);
            }
        }
        accepted
    }

    /// Fork-aware block acceptance (base spec §4.H, 4 phases). `payloads`
    /// is an ordered sequence of serialized blocks claimed to extend from
    /// some locally-known ancestor to a new tip.
    pub async fn receive_blocks(&self, payloads: &[Vec<u8>]) -> Result<Vec<Hash>, GossipError> {
        let mut blocks = Vec::with_capacity(payloads.len());
        for bytes in payloads {
            match Block::deserialize(bytes) {
                Ok(block) => blocks.push(block),
                Err(_) => return Err(GossipError::OrphanBlock),
            }
        }
        if blocks.is_empty() {
            return Ok(Vec::new());
        }

        // Phase 1: locate the common ancestor.
        let first = &blocks[0];
        if first.header.prev_block_hash != NO_PARENT && self.store.get_block(&first.header.prev_block_hash).is_none() {
            return Err(GossipError::OrphanBlock);
        }

        let mut highest_known_idx: Option<usize> = None;
        for (i, block) in blocks.iter().enumerate() {
            if self.store.get_block(&block.hash()).is_some() {
                highest_known_idx = Some(i);
            } else {
                break;
            }
        }

        let (highest_known_height, highest_known_hash) = match highest_known_idx {
            Some(i) => (blocks[i].header.height, blocks[i].hash()),
            None if first.header.prev_block_hash == NO_PARENT => (-1, NO_PARENT),
            None => {
                let parent = self.store.get_block(&first.header.prev_block_hash).expect("checked above");
                (parent.header.height, parent.hash())
            }
        };

        let new_blocks = &blocks[highest_known_idx.map(|i| i + 1).unwrap_or(0)..];
        if new_blocks.is_empty() {
            return Ok(Vec::new());
        }

        // Phase 2: the remainder must form a contiguous chain.
        let mut expected_prev = highest_known_hash;
        for block in new_blocks {
            if block.header.prev_block_hash != expected_prev {
                return Err(GossipError::OrphanBlock);
            }
            expected_prev = block.hash();
        }

        // Phase 3: adopt only if strictly longer than our local chain.
        let local_height = self.store.height();
        let new_chain_height = highest_known_height + new_blocks.len() as i32;
        if new_chain_height <= local_height {
            debug!("rejecting block sequence: new height {new_chain_height} <= local height {local_height}");
            return Ok(Vec::new());
        }

        // Phase 4: atomic reorg.
        let _guard = self.node_mu.lock().await;
        {
            let mut mempool = self.mempool.write().await;
            loop {
                let Some(tip) = self.store.tip_hash() else { break };
                if tip == highest_known_hash {
                    break;
                }
                let block = self.store.get_block(&tip).ok_or(StorageError::BlockNotFound)?;
                self.store.remove_block(&tip)?;
                for tx in &block.txs {
                    let tx_hash = tx.hash();
                    if verify_transaction(tx, self.store.as_ref()).is_ok() {
                        let _ = mempool.push_front(tx.clone());
                    }
                    mempool.delete_descendants(&tx_hash);
                }
            }
        }

        let mut accepted = Vec::with_capacity(new_blocks.len());
        for block in new_blocks {
            let expected_height = self.store.height() + 1;
            let expected_prev = self.store.tip_hash().unwrap_or(NO_PARENT);
            verify_block(block, expected_height, &expected_prev, self.store.as_ref())?;

            let mut scratch = Mempool::new();
            for tx in &block.txs {
                if !tx.is_coinbase && scratch.push_back(tx.clone()).is_err() {
                    return Err(GossipError::DoubleSpendWithinBlock);
                }
            }

            self.store.put_block(block)?;

            let mut mempool = self.mempool.write().await;
            for tx in &block.txs {
                mempool.evict_conflicts(tx);
                mempool.delete(&tx.hash());
            }

            accepted.push(block.hash());
        }

        self.signal_new_tip();
        Ok(accepted)
    }
}

fn version_frame(local_height: i32, ack: bool) -> Frame {
    let mut args = vec![message::PROTOCOL_VERSION.to_string(), local_height.to_string()];
    if ack {
        args.push("ACK".to_string());
    }
    Frame::new(message::VERSION, args)
}

/// The frame an outbound dial sends immediately after connecting (base
/// spec §4.H "On outbound connect: send VERSION").
pub fn initial_version_frame(local_height: i32) -> Frame {
    version_frame(local_height, false)
}

fn locator_args(store: &ChainStore) -> Vec<String> {
    store.last_block_hashes(BLOCK_CONFIRMATIONS).iter().map(encode_hash).collect()
}

/// The most recent hash in `locator` (searched in the caller's given
/// order, which is newest-first per the wire format) that exists locally.
/// Falls back to genesis (`NO_PARENT`) if nothing in the locator is known.
fn find_fork_point(store: &ChainStore, locator: &[Hash]) -> Hash {
    for hash in locator {
        if store.get_block(hash).is_some() {
            return *hash;
        }
    }
    NO_PARENT
}

async fn handle_version(ctx: &GossipContext, cmd: &PeerCommand) {
    if cmd.frame.args.len() < 2 {
        debug!("malformed VERSION from {}", cmd.peer_addr);
        return;
    }
    let Ok(peer_height) = cmd.frame.args[1].parse::<i32>() else {
        debug!("malformed VERSION height from {}", cmd.peer_addr);
        return;
    };
    let has_ack = cmd.frame.args.get(2).map(String::as_str) == Some("ACK");
    let local_height = ctx.store.height();

    if !has_ack {
        ctx.peers.send_to(&cmd.peer_addr, version_frame(local_height, true)).await;
    } else {
        ctx.peers.send_to(&cmd.peer_addr, Frame::new(message::VERSION_ACK, vec![])).await;
        ctx.peers.send_to(&cmd.peer_addr, Frame::new(message::GET_ADDR, vec![])).await;
        if let Some(handle) = ctx.peers.get(&cmd.peer_addr).await {
            handle.mark_established().await;
        }
    }

    if peer_height > local_height {
        ctx.peers.send_to(&cmd.peer_addr, Frame::new(message::GET_BLOCKS, locator_args(&ctx.store))).await;
    }
}

async fn handle_version_ack(ctx: &GossipContext, cmd: &PeerCommand) {
    if let Some(handle) = ctx.peers.get(&cmd.peer_addr).await {
        handle.mark_established().await;
    }
}

async fn handle_get_addr(ctx: &GossipContext, cmd: &PeerCommand) {
    let addrs = ctx.peers.established_addrs_except(&cmd.peer_addr).await;
    let args = addrs.iter().map(IpAddr::to_string).collect();
    ctx.peers.send_to(&cmd.peer_addr, Frame::new(message::ADDR, args)).await;
}

async fn handle_addr(ctx: &GossipContext, cmd: &PeerCommand) {
    for raw in &cmd.frame.args {
        let Ok(addr) = raw.parse::<IpAddr>() else { continue };
        if !ctx.peers.is_known(&addr).await {
            let _ = ctx.dial_requests.send(addr);
        }
    }
}

async fn handle_get_blocks(ctx: &GossipContext, cmd: &PeerCommand) {
    let locator: Vec<Hash> = cmd.frame.args.iter().filter_map(|s| decode_hash(s)).collect();
    let fork_point = find_fork_point(&ctx.store, &locator);
    let items: Vec<InvItem> = ctx
        .store
        .blocks_starting_at(&fork_point)
        .iter()
        .map(|block| InvItem { kind: InvKind::Block, hash: block.hash() })
        .collect();
    ctx.peers.send_to(&cmd.peer_addr, Frame::new(message::INV, encode_inv_items(&items))).await;
}

async fn handle_inv(ctx: &GossipContext, cmd: &PeerCommand) {
    let items = parse_inv_items(&cmd.frame.args);
    let mut unknown = Vec::new();
    {
        let mempool = ctx.mempool.read().await;
        for item in items {
            let is_unknown = match item.kind {
                InvKind::Tx => !mempool.contains(&item.hash),
                InvKind::Block => ctx.store.get_block(&item.hash).is_none(),
            };
            if is_unknown {
                unknown.push(item);
            }
        }
    }
    if !unknown.is_empty() {
        ctx.peers.send_to(&cmd.peer_addr, Frame::new(message::GET_DATA, encode_inv_items(&unknown))).await;
    }
}

async fn handle_get_data(ctx: &GossipContext, cmd: &PeerCommand) {
    let items = parse_inv_items(&cmd.frame.args);
    let mut data = Vec::new();
    for item in items {
        match item.kind {
            InvKind::Tx => {
                if let Some(tx) = ctx.mempool.read().await.get(&item.hash) {
                    data.push((InvKind::Tx, tx.serialize()));
                }
            }
            InvKind::Block => {
                if let Some(block) = ctx.store.get_block(&item.hash) {
                    data.push((InvKind::Block, block.serialize()));
                }
            }
        }
    }
    if !data.is_empty() {
        ctx.peers.send_to(&cmd.peer_addr, Frame::new(message::DATA, encode_data_items(&data))).await;
    }
}

async fn handle_data(ctx: &GossipContext, cmd: &PeerCommand) {
    let items = parse_data_items(&cmd.frame.args);
    let (tx_bytes, block_bytes): (Vec<_>, Vec<_>) = items.into_iter().partition(|(kind, _)| *kind == InvKind::Tx);
    let tx_bytes: Vec<Vec<u8>> = tx_bytes.into_iter().map(|(_, bytes)| bytes).collect();
    let block_bytes: Vec<Vec<u8>> = block_bytes.into_iter().map(|(_, bytes)| bytes).collect();

    let mut accepted = Vec::new();
    if !tx_bytes.is_empty() {
        accepted.extend(ctx.receive_txs(&tx_bytes).await.into_iter().map(|hash| InvItem { kind: InvKind::Tx, hash }));
    }
    if !block_bytes.is_empty() {
        match ctx.receive_blocks(&block_bytes).await {
            Ok(newly_accepted) => {
                accepted.extend(newly_accepted.into_iter().map(|hash| InvItem { kind: InvKind::Block, hash }))
            }
            Err(GossipError::OrphanBlock) => {
                ctx.peers.send_to(&cmd.peer_addr, Frame::new(message::GET_BLOCKS, locator_args(&ctx.store))).await;
            }
            Err(err) => warn!("rejecting block sequence from {}: {err}", cmd.peer_addr),
        }
    }

    if !accepted.is_empty() {
        ctx.peers.broadcast(Frame::new(message::INV, encode_inv_items(&accepted))).await;
    }
}

/// Dispatch one parsed frame to its handler. Unknown commands are dropped
/// with a debug log (base spec §4.G).
pub async fn handle_command(ctx: &GossipContext, cmd: PeerCommand) {
    match cmd.frame.command.as_str() {
        message::VERSION => handle_version(ctx, &cmd).await,
        message::VERSION_ACK => handle_version_ack(ctx, &cmd).await,
        message::GET_ADDR => handle_get_addr(ctx, &cmd).await,
        message::ADDR => handle_addr(ctx, &cmd).await,
        message::GET_BLOCKS => handle_get_blocks(ctx, &cmd).await,
        message::INV => handle_inv(ctx, &cmd).await,
        message::GET_DATA => handle_get_data(ctx, &cmd).await,
        message::DATA => handle_data(ctx, &cmd).await,
        other => debug!("dropping unknown command {other} from {}", cmd.peer_addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smellycoin_core::{Transaction, TxInput, TxOutput};

    fn temp_store() -> ChainStore {
        let dir = std::env::temp_dir().join(format!(
            "smellycoin-sync-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().subsec_nanos()
        ));
        ChainStore::open(dir).unwrap()
    }

    /// Search for a valid nonce so the block passes `verify_block`'s
    /// proof-of-work check. Average ~2^TARGET_BITS attempts; fine for a test.
    fn mined(block: Block) -> Block {
        let (_tx, rx) = watch::channel(0u64);
        match smellycoin_mining::mine(block, &rx) {
            smellycoin_mining::MineOutcome::Found(mined) => mined,
            smellycoin_mining::MineOutcome::Cancelled => panic!("mining should not be cancelled in a test"),
        }
    }

    fn test_context(store: ChainStore) -> GossipContext {
        let (cancel, _) = watch::channel(0u64);
        let (dial_tx, _dial_rx) = mpsc::unbounded_channel();
        GossipContext {
            store: Arc::new(store),
            mempool: Arc::new(RwLock::new(Mempool::new())),
            peers: Arc::new(PeerManager::new()),
            cancel,
            node_mu: Arc::new(Mutex::new(())),
            dial_requests: dial_tx,
        }
    }

    #[test]
    fn find_fork_point_falls_back_to_genesis() {
        let store = temp_store();
        assert_eq!(find_fork_point(&store, &[[9u8; 32]]), NO_PARENT);
    }

    #[tokio::test]
    async fn receive_txs_skips_already_known_and_conflicting() {
        let ctx = test_context(temp_store());
        let tx = Transaction::new(
            vec![TxInput { prev_tx_hash: [1u8; 32], out_index: 0, signature: vec![], pub_key: vec![] }],
            vec![TxOutput { value: 1, pub_key_hash: [2u8; 20] }],
        );
        let bytes = tx.serialize();

        let accepted = ctx.receive_txs(&[bytes.clone()]).await;
        assert_eq!(accepted.len(), 1);

        let accepted_again = ctx.receive_txs(&[bytes]).await;
        assert!(accepted_again.is_empty());
    }

    #[tokio::test]
    async fn receive_blocks_extends_empty_chain() {
        let ctx = test_context(temp_store());
        let genesis = mined(Block::new(vec![Transaction::coinbase([1u8; 20], 10)], NO_PARENT, 0));
        let genesis_hash = genesis.hash();

        let accepted = ctx.receive_blocks(&[genesis.serialize()]).await.unwrap();
        assert_eq!(accepted, vec![genesis_hash]);
        assert_eq!(ctx.store.tip_hash(), Some(genesis_hash));
    }

    #[tokio::test]
    async fn receive_blocks_evicts_conflicting_mempool_transaction() {
        let ctx = test_context(temp_store());
        let keypair = smellycoin_crypto::KeyPair::generate();
        let coinbase = Transaction::coinbase(keypair.pub_key_hash(), 10);
        let coinbase_hash = coinbase.hash();
        let genesis = Block::new(vec![coinbase], NO_PARENT, 0);
        ctx.store.put_block(&genesis).unwrap();

        let sign = |tx: &mut Transaction| {
            let digest = tx.trimmed_copy().hash();
            tx.vin[0].signature = keypair.sign(&digest);
            tx.vin[0].pub_key = keypair.public_key_bytes().to_vec();
        };

        // Our own mempool holds a spend of the coinbase output.
        let mut ours = Transaction::new(
            vec![TxInput { prev_tx_hash: coinbase_hash, out_index: 0, signature: vec![], pub_key: vec![] }],
            vec![TxOutput { value: 10, pub_key_hash: [7u8; 20] }],
        );
        sign(&mut ours);
        let ours_hash = ours.hash();
        ctx.mempool.write().await.push_back(ours).unwrap();

        // A peer's block spends the same output with a different transaction.
        let mut theirs = Transaction::new(
            vec![TxInput { prev_tx_hash: coinbase_hash, out_index: 0, signature: vec![], pub_key: vec![] }],
            vec![TxOutput { value: 10, pub_key_hash: [8u8; 20] }],
        );
        sign(&mut theirs);

        let next = mined(Block::new(vec![Transaction::coinbase([2u8; 20], 10), theirs], genesis.hash(), 1));
        let accepted = ctx.receive_blocks(&[next.serialize()]).await.unwrap();

        assert_eq!(accepted, vec![next.hash()]);
        assert!(!ctx.mempool.read().await.contains(&ours_hash));
    }

    #[tokio::test]
    async fn receive_blocks_rejects_shorter_chain() {
        let ctx = test_context(temp_store());
        let genesis = Block::new(vec![Transaction::coinbase([1u8; 20], 10)], NO_PARENT, 0);
        ctx.store.put_block(&genesis).unwrap();
        let second = Block::new(vec![Transaction::coinbase([2u8; 20], 10)], genesis.hash(), 1);
        ctx.store.put_block(&second).unwrap();

        // Re-offering just the genesis block (height 0) is not longer than
        // our local height of 1, so it must be rejected without error.
        let accepted = ctx.receive_blocks(&[genesis.serialize()]).await.unwrap();
        assert!(accepted.is_empty());
        assert_eq!(ctx.store.tip_hash(), Some(second.hash()));
    }

    #[tokio::test]
    async fn receive_blocks_reorgs_onto_a_longer_fork() {
        let ctx = test_context(temp_store());
        let genesis = Block::new(vec![Transaction::coinbase([1u8; 20], 10)], NO_PARENT, 0);
        ctx.store.put_block(&genesis).unwrap();
        let our_second = Block::new(vec![Transaction::coinbase([2u8; 20], 10)], genesis.hash(), 1);
        ctx.store.put_block(&our_second).unwrap();

        // A rival two-block extension of genesis, strictly longer than our
        // one-block tip.
        let rival_second = mined(Block::new(vec![Transaction::coinbase([3u8; 20], 10)], genesis.hash(), 1));
        let rival_third = mined(Block::new(vec![Transaction::coinbase([4u8; 20], 10)], rival_second.hash(), 2));

        let accepted = ctx
            .receive_blocks(&[genesis.serialize(), rival_second.serialize(), rival_third.serialize()])
            .await
            .unwrap();

        assert_eq!(accepted, vec![rival_second.hash(), rival_third.hash()]);
        assert_eq!(ctx.store.tip_hash(), Some(rival_third.hash()));
        assert_eq!(ctx.store.height(), 2);

        // Our displaced coinbase is reinstated as a pending mempool entry.
        let our_coinbase_hash = our_second.txs[0].hash();
        assert!(ctx.mempool.read().await.contains(&our_coinbase_hash));
    }

    #[tokio::test]
    async fn receive_blocks_reports_orphan_for_unknown_parent() {
        let ctx = test_context(temp_store());
        let dangling = Block::new(vec![Transaction::coinbase([1u8; 20], 10)], [0xAAu8; 32], 5);
        let result = ctx.receive_blocks(&[dangling.serialize()]).await;
        assert!(matches!(result, Err(GossipError::OrphanBlock)));
    }
}
