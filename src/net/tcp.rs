//! TCP transport.
//!
//! One listener task, one dialer task, and per connection a reader task and
//! a writer task. Frames are not interpreted here beyond the header: the
//! reader checks magic and length against `max_message_size` before
//! buffering, then hands the raw frame to the node's inbound queue. A frame
//! announcing more than that closes the connection.
//!
//! # Handshake
//!
//! Both sides send a `Hello` immediately and expect one back within
//! `handshake_timeout`. The Hello carries the protocol version, PeerId, a
//! random nonce, the listen port, the PoR flag and an agent string. A Hello with our own
//! PeerId or one of our outstanding nonces means we dialed ourselves.

use super::message::{decode_frame, encode_frame, parse_header, FrameError, HelloPayload, WireMessage, HEADER_SIZE, PROTOCOL_VERSION};
use super::registry::{Connection, PeerObserver, PeerRegistry, RegistryError};
use super::transport::{ready_ack, InboundFrame, SendAck, Transport, TransportError};
use crate::config::NetConfig;
use crate::node::PorNode;
use crate::types::{Direction, PeerId};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ===== CONSTANTS =====

/// Frames queued per connection before `send_frame` reports `QueueFull`
const SEND_QUEUE_CAPACITY: usize = 1000;

/// Frames buffered between all readers and the node's inbound loop
const INBOUND_QUEUE_CAPACITY: usize = 4096;

/// Dial backoff doubles per failure up to this many times
const MAX_BACKOFF_SHIFT: u32 = 6;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("handshake timeout")]
    HandshakeTimeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection refused: {0}")]
    Registry(#[from] RegistryError),
}

type Outgoing = (Vec<u8>, oneshot::Sender<Result<(), TransportError>>);

struct Link {
    id: u64,
    tx: mpsc::Sender<Outgoing>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
struct DialBackoff {
    failures: u32,
    next_attempt: Instant,
}

pub struct TcpTransport {
    config: NetConfig,
    local_id: PeerId,
    registry: Arc<PeerRegistry>,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    links: RwLock<HashMap<PeerId, Link>>,
    next_link_id: AtomicU64,
    inbound_tx: mpsc::Sender<InboundFrame>,
    /// Hello nonces we have sent and not yet seen answered
    sent_nonces: Mutex<HashSet<u64>>,
    backoff: Mutex<HashMap<SocketAddr, DialBackoff>>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    /// Bind the listen socket. Nothing runs until [`start`](Self::start).
    pub async fn bind(
        config: &NetConfig,
        registry: Arc<PeerRegistry>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<InboundFrame>), NetError> {
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
        let local_addr = listener.local_addr()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

        let transport = Arc::new(Self {
            config: config.clone(),
            local_id: registry.local_id(),
            registry: registry.clone(),
            local_addr,
            listener: Mutex::new(Some(listener)),
            links: RwLock::new(HashMap::new()),
            next_link_id: AtomicU64::new(0),
            inbound_tx,
            sent_nonces: Mutex::new(HashSet::new()),
            backoff: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });
        registry.subscribe(transport.clone());
        Ok((transport, inbound_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn listen_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Spawn the listener and dialer loops.
    pub fn start(self: &Arc<Self>) {
        if let Some(listener) = self.listener.lock().take() {
            info!("Listening on port {}", self.listen_port());
            tokio::spawn(self.clone().listener_loop(listener));
        }
        tokio::spawn(self.clone().dialer_loop());
    }

    /// Close every connection and stop all loops.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Dial `addr` and complete the handshake. Returns the remote PeerId.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId, NetError> {
        let stream = tokio::time::timeout(self.config.handshake_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| NetError::HandshakeTimeout)??;
        self.establish(stream, addr, Direction::Outbound).await
    }

    async fn listener_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        continue;
                    }
                },
            };

            if self.registry.len() >= self.config.max_num_peers {
                debug!("Rejecting {}: max connections reached", addr);
                continue;
            }

            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.establish(stream, addr, Direction::Inbound).await {
                    debug!("Inbound connection from {} failed: {}", addr, e);
                }
            });
        }
    }

    async fn dialer_loop(self: Arc<Self>) {
        let boot_nodes: Vec<SocketAddr> = self
            .config
            .boot_nodes
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!("Ignoring invalid boot node address: {}", s);
                    None
                }
            })
            .collect();

        let mut tick = interval(self.config.reconnect_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            for addr in self.dial_candidates(&boot_nodes) {
                if !self.needs_outbound() {
                    break;
                }
                info!("Connecting to {}", addr);
                match self.connect(addr).await {
                    Ok(_) => {
                        self.backoff.lock().remove(&addr);
                    }
                    Err(e) => {
                        debug!("Connect to {} failed: {}", addr, e);
                        self.record_dial_failure(addr);
                    }
                }
            }
        }
    }

    fn needs_outbound(&self) -> bool {
        let connected = self.registry.len();
        connected < self.config.max_num_peers
            && (connected < self.config.ideal_connections_lo
                || self.registry.outbound_count() < self.config.minimum_outbound_peers)
    }

    /// Boot nodes and recently seen peers we are not connected to and are
    /// not backing off from.
    fn dial_candidates(&self, boot_nodes: &[SocketAddr]) -> Vec<SocketAddr> {
        if !self.needs_outbound() {
            return Vec::new();
        }

        let mut skip: HashSet<SocketAddr> = HashSet::new();
        for peer in self.registry.connections() {
            if let Some(conn) = self.registry.connection(&peer) {
                skip.insert(conn.addr);
                skip.extend(conn.listen_addr);
            }
        }

        let now = Instant::now();
        let backoff = self.backoff.lock();
        let known = self.registry.reconnect_candidates().into_iter().map(|(_, addr)| addr);

        let mut out = Vec::new();
        for addr in boot_nodes.iter().copied().chain(known) {
            let waiting = backoff.get(&addr).is_some_and(|b| now < b.next_attempt);
            if !waiting && skip.insert(addr) {
                out.push(addr);
            }
        }
        out
    }

    fn record_dial_failure(&self, addr: SocketAddr) {
        let mut backoff = self.backoff.lock();
        let entry = backoff.entry(addr).or_insert(DialBackoff { failures: 0, next_attempt: Instant::now() });
        entry.failures = entry.failures.saturating_add(1);
        let shift = entry.failures.min(MAX_BACKOFF_SHIFT);
        entry.next_attempt = Instant::now() + self.config.reconnect_interval() * (1u32 << shift);
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<HelloPayload, NetError> {
        let ours = HelloPayload::new(self.local_id, self.listen_port(), self.config.por_enabled);
        self.sent_nonces.lock().insert(ours.nonce);

        let max_frame = self.config.rate_limit.max_message_size;
        let result = tokio::time::timeout(self.config.handshake_timeout(), exchange_hello(stream, &ours, max_frame)).await;

        let self_dial = match &result {
            Ok(Ok(theirs)) => theirs.peer_id == self.local_id || self.sent_nonces.lock().contains(&theirs.nonce),
            _ => false,
        };
        self.sent_nonces.lock().remove(&ours.nonce);

        let theirs = result.map_err(|_| NetError::HandshakeTimeout)??;
        if self_dial {
            return Err(RegistryError::SelfConnection.into());
        }
        if theirs.version != PROTOCOL_VERSION {
            return Err(NetError::Protocol(format!("unsupported protocol version {}", theirs.version)));
        }
        Ok(theirs)
    }

    async fn establish(
        self: &Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
        direction: Direction,
    ) -> Result<PeerId, NetError> {
        stream.set_nodelay(true)?;
        let hello = self.handshake(&mut stream).await?;
        let peer = hello.peer_id;

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let cancel = self.shutdown.child_token();
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut links = self.links.write();
            if links.contains_key(&peer) {
                return Err(RegistryError::AlreadyConnected(peer).into());
            }
            links.insert(peer, Link { id, tx, cancel: cancel.clone() });
        }

        // Observers may send as soon as the registry announces the peer
        tokio::spawn(writer_loop(writer, rx, cancel.clone(), peer));

        let listen_addr = SocketAddr::new(addr.ip(), hello.listen_port);
        let conn = Connection::new(peer, addr, direction, hello.por_enabled).with_listen_addr(listen_addr);
        if let Err(e) = self.registry.on_connect(conn) {
            cancel.cancel();
            self.remove_link(&peer, id);
            return Err(e.into());
        }

        info!(
            "Connected to {} at {} ({}, {}, por: {})",
            peer, addr, direction, hello.agent, hello.por_enabled
        );
        tokio::spawn(self.clone().reader_loop(reader, peer, id, cancel));
        Ok(peer)
    }

    async fn reader_loop(self: Arc<Self>, mut reader: OwnedReadHalf, peer: PeerId, id: u64, cancel: CancellationToken) {
        let max_frame = self.config.rate_limit.max_message_size;
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = read_frame(&mut reader, max_frame) => frame,
            };
            match frame {
                Ok(frame) => {
                    if self.inbound_tx.send(InboundFrame { via: peer, frame }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Read error from {}: {}", peer, e);
                    break;
                }
            }
        }

        cancel.cancel();
        // Deregister before dropping the link so a reconnect cannot slip in between
        self.registry.on_disconnect(&peer);
        self.remove_link(&peer, id);
    }

    fn remove_link(&self, peer: &PeerId, id: u64) {
        let mut links = self.links.write();
        if links.get(peer).is_some_and(|l| l.id == id) {
            links.remove(peer);
        }
    }
}

async fn exchange_hello(stream: &mut TcpStream, ours: &HelloPayload, max_frame: usize) -> Result<HelloPayload, NetError> {
    let frame = encode_frame(&WireMessage::Hello(ours.clone()))?;
    write_frame(stream, &frame).await?;
    let frame = read_frame(stream, max_frame).await?;
    match decode_frame(&frame)? {
        WireMessage::Hello(theirs) => Ok(theirs),
        other => Err(NetError::Protocol(format!("expected hello, got {}", other.command()))),
    }
}

async fn writer_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Outgoing>, cancel: CancellationToken, peer: PeerId) {
    loop {
        let (frame, ack) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };
        match write_frame(&mut writer, &frame).await {
            Ok(()) => {
                let _ = ack.send(Ok(()));
            }
            Err(e) => {
                debug!("Write error to {}: {}", peer, e);
                let _ = ack.send(Err(TransportError::Io(e.to_string())));
                break;
            }
        }
    }
    cancel.cancel();

    // Fail whatever is still queued
    rx.close();
    while let Ok((_, ack)) = rx.try_recv() {
        let _ = ack.send(Err(TransportError::Closed(peer)));
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<(), NetError> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame of at most `max_frame` bytes. The header is validated
/// before the payload is buffered.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_frame: usize) -> Result<Vec<u8>, NetError> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let len = parse_header(&header, max_frame)?;

    let mut frame = vec![0u8; HEADER_SIZE + len];
    frame[..HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEADER_SIZE..]).await?;
    Ok(frame)
}

impl Transport for TcpTransport {
    fn send_frame(&self, to: &PeerId, frame: Vec<u8>) -> SendAck {
        let links = self.links.read();
        let Some(link) = links.get(to) else {
            return ready_ack(Err(TransportError::NotConnected(*to)));
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        match link.tx.try_send((frame, ack_tx)) {
            Ok(()) => ack_rx,
            Err(mpsc::error::TrySendError::Full(_)) => ready_ack(Err(TransportError::QueueFull(*to))),
            Err(mpsc::error::TrySendError::Closed(_)) => ready_ack(Err(TransportError::Closed(*to))),
        }
    }
}

impl PeerObserver for TcpTransport {
    /// Closes the socket when the registry drops a peer (e.g. a ban).
    fn on_peer_disconnected(&self, peer: &PeerId) {
        if let Some(link) = self.links.read().get(peer) {
            link.cancel.cancel();
        }
    }
}

/// A [`PorNode`] running over [`TcpTransport`].
pub struct TcpNode {
    pub node: Arc<PorNode>,
    pub transport: Arc<TcpTransport>,
}

impl TcpNode {
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerId, NetError> {
        self.transport.connect(addr).await
    }

    pub async fn shutdown(&self) {
        self.transport.shutdown();
        self.node.shutdown().await;
    }
}

/// Bind, wire and start a TCP node.
pub async fn spawn_node(config: &NetConfig, local_id: PeerId) -> Result<TcpNode, NetError> {
    let registry = Arc::new(PeerRegistry::new(local_id, config));
    let (transport, inbound) = TcpTransport::bind(config, registry.clone()).await?;
    let node = PorNode::start(config, registry, transport.clone(), inbound);
    transport.start();
    Ok(TcpNode { node, transport })
}
