//! Networking: the wire protocol, peer connection management, and the
//! gossip state machine that drives chain synchronization.
//!
//! This crate owns everything downstream of "a TCP byte stream" up to "a
//! parsed command dispatched against chain state." It does not own the
//! node's lifecycle (listener bind address, seed dialing, mining, the
//! wallet HTTP surface) — that's the binary crate's job, wired up with
//! the [`listen`] and [`dial`] helpers below.

use std::net::{IpAddr, SocketAddr};

use log::{debug, info};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub mod message;
pub mod peer;
pub mod sync;

pub use message::Frame;
pub use peer::{PeerCommand, PeerHandle, PeerManager};
pub use sync::{GossipContext, GossipError, BLOCK_CONFIRMATIONS};

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bind `listen_addr` and accept inbound connections forever, registering
/// each with `peers` and forwarding its frames onto `commands`. Runs until
/// the listener itself fails; individual connection errors are logged and
/// otherwise ignored.
pub async fn listen(
    listen_addr: SocketAddr,
    peers: std::sync::Arc<PeerManager>,
    commands: mpsc::Sender<PeerCommand>,
) -> Result<(), NetworkError> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("listening for peers on {listen_addr}");
    loop {
        let (stream, remote) = listener.accept().await?;
        let addr = remote.ip();
        if peers.is_known(&addr).await {
            debug!("rejecting duplicate inbound connection from {addr}");
            continue;
        }
        peers.register(addr, stream, false, commands.clone()).await;
    }
}

/// Dial an outbound peer, register it, and queue the initial `VERSION`
/// frame the base protocol requires of the connecting side.
pub async fn dial(
    addr: IpAddr,
    local_height: i32,
    peers: std::sync::Arc<PeerManager>,
    commands: mpsc::Sender<PeerCommand>,
) -> Result<(), NetworkError> {
    if peers.is_known(&addr).await {
        return Ok(());
    }
    let stream = TcpStream::connect(SocketAddr::new(addr, default_port())).await?;
    let handle = peers.register(addr, stream, true, commands).await;
    handle.send(sync::initial_version_frame(local_height));
    Ok(())
}

/// The fixed TCP port every node listens on, used both for binding and for
/// dialing addresses learned through `ADDR`/`--seeds`.
pub fn default_port() -> u16 {
    8333
}
