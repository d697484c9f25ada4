//! Peer connection management.
//!
//! Each peer owns a TCP connection, a reader task that parses wire frames
//! (§4.G) and forwards them to the node's single command channel, and a
//! writer task draining a bounded per-peer outgoing queue. Bounding the
//! outgoing queue (rather than writing line-at-a-time from whatever task
//! wants to send) is the one deviation from the reference server's
//! blocking-send design: a stuck peer fills its own queue and gets dropped
//! instead of stalling the node (base spec §5/§9).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

use crate::message::Frame;

/// Outgoing frames per peer are queued here; a full queue means the peer is
/// not keeping up and gets dropped rather than blocking the sender.
const OUTBOX_CAPACITY: usize = 256;

/// A single inbound frame, tagged with the peer it came from.
#[derive(Debug, Clone)]
pub struct PeerCommand {
    pub peer_addr: IpAddr,
    pub frame: Frame,
}

/// A connected peer: its address, whether the handshake has completed, and
/// a handle to its writer task's queue.
pub struct PeerHandle {
    pub addr: IpAddr,
    pub outbound: bool,
    established: RwLock<bool>,
    outbox: mpsc::Sender<Frame>,
}

impl PeerHandle {
    pub async fn is_established(&self) -> bool {
        *self.established.read().await
    }

    pub async fn mark_established(&self) {
        *self.established.write().await = true;
    }

    /// Queue a frame for delivery. Drops it (logging) if the peer's outbox
    /// is full rather than blocking the caller.
    pub fn send(&self, frame: Frame) {
        if let Err(err) = self.outbox.try_send(frame) {
            warn!("dropping outgoing frame to {}: {err}", self.addr);
        }
    }
}

/// Registry of connected peers, keyed by IP address per base spec §4.H
/// (peers are tracked by IP, not by full socket address, since a dialed
/// peer and one that dials us present different ephemeral ports).
#[derive(Default)]
pub struct PeerManager {
    peers: RwLock<HashMap<IpAddr, Arc<PeerHandle>>>,
}

impl PeerManager {
    pub fn new() -> Self {
        PeerManager::default()
    }

    pub async fn is_known(&self, addr: &IpAddr) -> bool {
        self.peers.read().await.contains_key(addr)
    }

    pub async fn get(&self, addr: &IpAddr) -> Option<Arc<PeerHandle>> {
        self.peers.read().await.get(addr).cloned()
    }

    pub async fn remove(&self, addr: &IpAddr) {
        self.peers.write().await.remove(addr);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// IP addresses of every established peer other than `exclude`, for
    /// `ADDR` replies.
    pub async fn established_addrs_except(&self, exclude: &IpAddr) -> Vec<IpAddr> {
        let peers = self.peers.read().await;
        let mut out = Vec::new();
        for (addr, handle) in peers.iter() {
            if addr != exclude && handle.is_established().await {
                out.push(*addr);
            }
        }
        out
    }

    pub async fn send_to(&self, addr: &IpAddr, frame: Frame) {
        if let Some(handle) = self.get(addr).await {
            handle.send(frame);
        }
    }

    /// Send `frame` to every established peer.
    pub async fn broadcast(&self, frame: Frame) {
        let peers = self.peers.read().await;
        for handle in peers.values() {
            if handle.is_established().await {
                handle.send(frame.clone());
            }
        }
    }

    /// Accept an already-connected socket (inbound or outbound), spawn its
    /// reader/writer tasks, and register it. Returns the handle so the
    /// caller can immediately queue a handshake frame.
    pub async fn register(
        self: &Arc<Self>,
        addr: IpAddr,
        stream: TcpStream,
        outbound: bool,
        commands: mpsc::Sender<PeerCommand>,
    ) -> Arc<PeerHandle> {
        let (read_half, write_half) = stream.into_split();
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);

        let handle = Arc::new(PeerHandle {
            addr,
            outbound,
            established: RwLock::new(false),
            outbox: outbox_tx,
        });

        self.peers.write().await.insert(addr, handle.clone());

        tokio::spawn(reader_loop(addr, read_half, commands));
        tokio::spawn(writer_loop(addr, write_half, outbox_rx));

        handle
    }
}

async fn reader_loop(
    addr: IpAddr,
    read_half: tokio::net::tcp::OwnedReadHalf,
    commands: mpsc::Sender<PeerCommand>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(frame) = Frame::parse(&line) else { continue };
                trace!("recv from {addr}: {}", frame.render());
                if commands.send(PeerCommand { peer_addr: addr, frame }).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!("peer {addr} closed its connection");
                return;
            }
            Err(err) => {
                debug!("read error from peer {addr}: {err}");
                return;
            }
        }
    }
}

async fn writer_loop(addr: IpAddr, mut write_half: OwnedWriteHalf, mut outbox: mpsc::Receiver<Frame>) {
    while let Some(frame) = outbox.recv().await {
        let mut line = frame.render();
        line.push('\n');
        trace!("send to {addr}: {}", frame.render());
        if write_half.write_all(line.as_bytes()).await.is_err() {
            debug!("write error to peer {addr}, dropping connection");
            return;
        }
    }
}
