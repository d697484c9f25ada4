//! SmellyCoin node entry point: parses the CLI surface, opens the chain
//! store, and wires the gossip, mining, and wallet HTTP components together.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use smellycoin_consensus::verify_block;
use smellycoin_core::{Block, Transaction, BLOCK_SUBSIDY};
use smellycoin_crypto::decode_address;
use smellycoin_mining::{spawn_miner, Mempool};
use smellycoin_network::{self, GossipContext, NetworkError, PeerManager};
use smellycoin_storage::{ChainStore, StorageError, NO_PARENT};

/// Aggregates every crate's error boundary for the supervisor's top level
/// (base spec §6's ambient error-handling design).
#[derive(Error, Debug)]
enum NodeError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A peer-to-peer node for a Bitcoin-style UTXO blockchain.
#[derive(Parser)]
#[clap(name = "smellycoin")]
struct Cli {
    /// Base58-check P2PKH address (version byte 0x00) that receives mined
    /// block subsidies.
    #[clap(long)]
    miner: String,

    /// Comma-separated list of seed peer addresses, each matching
    /// `^[A-Za-z0-9.-]+$`.
    #[clap(long)]
    seeds: Option<String>,

    /// P2P listen address.
    #[clap(long, default_value = "0.0.0.0:8333")]
    listen: SocketAddr,

    /// Wallet HTTP surface bind address.
    #[clap(long, default_value = "127.0.0.1:8080")]
    rpc: SocketAddr,

    /// Directory holding the chain store (`blocks/` and `chainstate/` trees).
    #[clap(long, default_value = "./data")]
    datadir: PathBuf,

    /// Increase log verbosity (repeatable: -v, -vv, -vvv).
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity (repeatable). Takes precedence over `-v` when
    /// both are given.
    #[clap(short = 'q', long = "quiet", action = clap::ArgAction::Count)]
    quiet: u8,
}

fn init_logging(verbose: u8, quiet: u8) {
    let level = match (verbose as i16) - (quiet as i16) {
        i16::MIN..=-2 => log::LevelFilter::Error,
        -1 => log::LevelFilter::Warn,
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).format_timestamp_millis().init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let miner_pub_key_hash = match decode_address(&cli.miner) {
        Ok(hash) => hash,
        Err(err) => {
            error!("invalid --miner address: {err}");
            process::exit(1);
        }
    };

    let seeds = match cli.seeds.as_deref().map(parse_seeds).transpose() {
        Ok(seeds) => seeds.unwrap_or_default(),
        Err(bad_seed) => {
            error!("invalid --seeds entry: {bad_seed:?}");
            process::exit(1);
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("failed to start the async runtime");
    if let Err(err) = runtime.block_on(run(cli, miner_pub_key_hash, seeds)) {
        error!("node exited with an error: {err}");
        process::exit(1);
    }
}

/// Parse and validate a `--seeds` value, returning the first offending
/// entry as `Err` so `main` can report it before exiting.
fn parse_seeds(raw: &str) -> Result<Vec<String>, String> {
    let entries = smellycoin_util::parse_seeds(raw);
    for entry in &entries {
        if smellycoin_util::validate_seed(entry).is_err() {
            return Err(entry.clone());
        }
    }
    Ok(entries)
}

async fn run(cli: Cli, miner_pub_key_hash: [u8; 20], seeds: Vec<String>) -> Result<(), NodeError> {
    let store = Arc::new(ChainStore::open(&cli.datadir)?);
    if store.tip_hash().is_none() {
        info!("blockchain not found, mining a fresh genesis block");
        let candidate = Block::new(vec![Transaction::coinbase(miner_pub_key_hash, BLOCK_SUBSIDY)], NO_PARENT, 0);
        let (_never_cancels, cancel_rx) = watch::channel(0u64);
        let genesis = match smellycoin_mining::mine(candidate, &cancel_rx) {
            smellycoin_mining::MineOutcome::Found(block) => block,
            smellycoin_mining::MineOutcome::Cancelled => unreachable!("genesis mining is never cancelled"),
        };
        info!("generated genesis block {}", hex::encode(genesis.hash()));
        store.put_block(&genesis)?;
    }

    let mempool = Arc::new(RwLock::new(Mempool::new()));
    let peers = Arc::new(PeerManager::new());
    let (cancel_tx, cancel_rx) = watch::channel(0u64);
    let (dial_tx, mut dial_rx) = mpsc::unbounded_channel::<IpAddr>();
    let (commands_tx, mut commands_rx) = mpsc::channel(1024);

    let ctx = GossipContext {
        store: store.clone(),
        mempool: mempool.clone(),
        peers: peers.clone(),
        cancel: cancel_tx.clone(),
        node_mu: Arc::new(Mutex::new(())),
        dial_requests: dial_tx,
    };

    // Inbound connections.
    {
        let peers = peers.clone();
        let commands_tx = commands_tx.clone();
        let listen_addr = cli.listen;
        tokio::spawn(async move {
            if let Err(err) = smellycoin_network::listen(listen_addr, peers, commands_tx).await {
                error!("P2P listener stopped: {}", NodeError::from(err));
            }
        });
    }

    // Gossip command loop.
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            while let Some(cmd) = commands_rx.recv().await {
                smellycoin_network::sync::handle_command(&ctx, cmd).await;
            }
        });
    }

    // Outbound dial loop, serving both the configured seeds and addresses
    // learned later through `ADDR`.
    {
        let peers = peers.clone();
        let commands_tx = commands_tx.clone();
        let store = store.clone();
        for seed in seeds {
            if let Err(err) = dial_seed(&seed, store.height(), peers.clone(), commands_tx.clone()).await {
                warn!("failed to dial seed {seed}: {err}");
            }
        }
        tokio::spawn(async move {
            while let Some(addr) = dial_rx.recv().await {
                if let Err(err) = smellycoin_network::dial(addr, store.height(), peers.clone(), commands_tx.clone()).await {
                    warn!("failed to dial {addr}: {err}");
                }
            }
        });
    }

    // Wallet HTTP surface.
    {
        let ctx = ctx.clone();
        let rpc_addr = cli.rpc;
        tokio::spawn(async move {
            if let Err(err) = smellycoin_rpc::serve(rpc_addr, ctx).await {
                error!("wallet HTTP surface stopped: {}", NodeError::from(err));
            }
        });
    }

    mining_loop(ctx, miner_pub_key_hash, cancel_rx).await;
    Ok(())
}

async fn dial_seed(
    seed: &str,
    local_height: i32,
    peers: Arc<PeerManager>,
    commands_tx: mpsc::Sender<smellycoin_network::PeerCommand>,
) -> std::io::Result<()> {
    let addr: IpAddr = tokio::net::lookup_host((seed, smellycoin_network::default_port()))
        .await?
        .next()
        .map(|socket| socket.ip())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "seed did not resolve"))?;
    smellycoin_network::dial(addr, local_height, peers, commands_tx).await?;
    Ok(())
}

/// Continuously mine on top of the current tip: build a candidate block
/// from the mempool, search for a valid nonce, and commit it under
/// `node_mu` when found. Cancelled mid-search whenever `ctx.cancel` has
/// already moved on (another path extended the chain first).
async fn mining_loop(ctx: GossipContext, miner_pub_key_hash: [u8; 20], cancel_rx: watch::Receiver<u64>) {
    loop {
        let prev_hash = ctx.store.tip_hash().unwrap_or(NO_PARENT);
        let height = ctx.store.height() + 1;
        let coinbase = Transaction::coinbase(miner_pub_key_hash, BLOCK_SUBSIDY);
        let mut candidate = Block::new(vec![coinbase], prev_hash, height);
        ctx.mempool.read().await.fill_block(&mut candidate);

        let (found_tx, found_rx) = tokio::sync::oneshot::channel();
        let join = spawn_miner(candidate, cancel_rx.clone(), move |mined| {
            let _ = found_tx.send(mined);
        });
        let Ok(mined) = found_rx.await else {
            // Cancelled: the thread exits without sending. Join it to avoid
            // leaking a finished handle before looping to the new tip.
            let _ = tokio::task::spawn_blocking(move || join.join()).await;
            continue;
        };

        let _guard = ctx.node_mu.lock().await;
        // Another peer's block may have landed while we were searching; a
        // stale prev-hash just means this attempt is wasted, not wrong.
        if ctx.store.tip_hash().unwrap_or(NO_PARENT) != mined.header.prev_block_hash {
            continue;
        }
        if let Err(err) = verify_block(&mined, mined.header.height, &mined.header.prev_block_hash, ctx.store.as_ref()) {
            warn!("mined an invalid block, discarding: {err}");
            continue;
        }
        if let Err(err) = ctx.store.put_block(&mined) {
            warn!("failed to commit mined block: {err}");
            continue;
        }

        let mut mempool = ctx.mempool.write().await;
        for tx in &mined.txs {
            mempool.evict_conflicts(tx);
            mempool.delete(&tx.hash());
        }
        drop(mempool);
        drop(_guard);

        info!("mined block {} at height {}", hex::encode(mined.hash()), mined.header.height);
        ctx.cancel.send_modify(|generation| *generation = generation.wrapping_add(1));
        ctx.peers
            .broadcast(smellycoin_network::Frame::new(
                smellycoin_network::message::INV,
                smellycoin_network::message::encode_inv_items(&[smellycoin_network::message::InvItem {
                    kind: smellycoin_network::message::InvKind::Block,
                    hash: mined.hash(),
                }]),
            ))
            .await;
    }
}
