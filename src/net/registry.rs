//! Peer registry: who is connected right now.
//!
//! The registry owns every [`Connection`]. Components that hold per-peer
//! state (sessions, routes, rate budgets, socket tasks) register a
//! [`PeerObserver`] and are told about connects and disconnects, so nothing
//! tied to a dead connection lingers until a timeout notices.
//!
//! # Key Invariants
//!
//! 1. **One connection per peer**: a second connection from a connected peer is rejected
//! 2. **Bounded**: at most `max_num_peers` connections; the peer-state cache is an LRU
//! 3. **Observers run unlocked**: callbacks fire after the registry lock is released,
//!    so an observer may call back into the registry

use crate::config::NetConfig;
use crate::types::{Direction, PeerId};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("peer {0} is banned")]
    Banned(PeerId),
    #[error("max connections reached ({0})")]
    MaxConnections(usize),
    #[error("peer {0} already connected")]
    AlreadyConnected(PeerId),
    #[error("refusing connection to ourselves")]
    SelfConnection,
}

/// Subscriber to connection churn.
pub trait PeerObserver: Send + Sync {
    fn on_peer_connected(&self, _conn: &Connection) {}
    fn on_peer_disconnected(&self, _peer: &PeerId) {}
}

/// One live transport link.
#[derive(Debug, Clone)]
pub struct Connection {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub direction: Direction,
    /// Where the peer accepts connections, if it told us
    pub listen_addr: Option<SocketAddr>,
    pub established_at: Instant,
    pub last_activity: Instant,
    pub healthy: bool,
    /// Peer announced PoR support in its handshake
    pub por_enabled: bool,
}

impl Connection {
    pub fn new(peer_id: PeerId, addr: SocketAddr, direction: Direction, por_enabled: bool) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            addr,
            direction,
            listen_addr: None,
            established_at: now,
            last_activity: now,
            healthy: true,
            por_enabled,
        }
    }

    pub fn with_listen_addr(mut self, listen_addr: SocketAddr) -> Self {
        self.listen_addr = Some(listen_addr);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct KnownPeer {
    addr: SocketAddr,
    last_seen: Instant,
}

pub struct PeerRegistry {
    local_id: PeerId,
    max_num_peers: usize,
    safe_set_size: usize,
    peer_states_ttl: Duration,
    connections: RwLock<HashMap<PeerId, Connection>>,
    /// Banned peer → ban expiry
    bans: RwLock<HashMap<PeerId, Instant>>,
    /// Recently seen peers with a dialable address, for reconnection.
    known: Mutex<LruCache<PeerId, KnownPeer>>,
    observers: RwLock<Vec<Arc<dyn PeerObserver>>>,
}

impl PeerRegistry {
    pub fn new(local_id: PeerId, config: &NetConfig) -> Self {
        let cache_size = NonZeroUsize::new(config.peer_states_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            local_id,
            max_num_peers: config.max_num_peers,
            safe_set_size: config.safe_set_size,
            peer_states_ttl: config.peer_states_ttl(),
            connections: RwLock::new(HashMap::new()),
            bans: RwLock::new(HashMap::new()),
            known: Mutex::new(LruCache::new(cache_size)),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn subscribe(&self, observer: Arc<dyn PeerObserver>) {
        self.observers.write().push(observer);
    }

    pub fn on_connect(&self, conn: Connection) -> Result<(), RegistryError> {
        let peer = conn.peer_id;
        if peer == self.local_id {
            return Err(RegistryError::SelfConnection);
        }
        if self.is_banned(&peer) {
            return Err(RegistryError::Banned(peer));
        }

        {
            let mut connections = self.connections.write();
            if connections.contains_key(&peer) {
                return Err(RegistryError::AlreadyConnected(peer));
            }
            if connections.len() >= self.max_num_peers {
                return Err(RegistryError::MaxConnections(self.max_num_peers));
            }
            connections.insert(peer, conn.clone());
        }

        if let Some(listen_addr) = conn.listen_addr {
            self.remember(peer, listen_addr);
        }

        info!("Peer {} connected ({}, {})", peer, conn.addr, conn.direction);

        for observer in self.observers() {
            observer.on_peer_connected(&conn);
        }
        Ok(())
    }

    /// Remove a connection. Returns false if the peer was not connected.
    pub fn on_disconnect(&self, peer: &PeerId) -> bool {
        let Some(conn) = self.connections.write().remove(peer) else {
            return false;
        };

        if let Some(listen_addr) = conn.listen_addr {
            self.remember(*peer, listen_addr);
        }

        info!("Peer {} disconnected ({})", peer, conn.addr);

        for observer in self.observers() {
            observer.on_peer_disconnected(peer);
        }
        true
    }

    fn observers(&self) -> Vec<Arc<dyn PeerObserver>> {
        self.observers.read().clone()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connections.read().contains_key(peer)
    }

    pub fn connections(&self) -> HashSet<PeerId> {
        self.connections.read().keys().copied().collect()
    }

    pub fn connection(&self, peer: &PeerId) -> Option<Connection> {
        self.connections.read().get(peer).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn outbound_count(&self) -> usize {
        self.connections
            .read()
            .values()
            .filter(|c| c.direction == Direction::Outbound)
            .count()
    }

    /// Peers reliable enough for protocol-critical exchanges: healthy
    /// connections, longest-lived first, capped at `safe_set_size`.
    pub fn safe_peers(&self) -> Vec<PeerId> {
        let mut healthy: Vec<(Instant, PeerId)> = self
            .connections
            .read()
            .values()
            .filter(|c| c.healthy)
            .map(|c| (c.established_at, c.peer_id))
            .collect();
        healthy.sort();
        healthy.into_iter().take(self.safe_set_size).map(|(_, p)| p).collect()
    }

    /// Connections marked unhealthy. They are kept out of the safe set but
    /// still checked so they can recover.
    pub fn unhealthy_peers(&self) -> Vec<PeerId> {
        self.connections
            .read()
            .values()
            .filter(|c| !c.healthy)
            .map(|c| c.peer_id)
            .collect()
    }

    /// PoR-capable connections with no inbound traffic for `timeout`.
    pub fn idle_peers(&self, timeout: Duration, now: Instant) -> Vec<PeerId> {
        self.connections
            .read()
            .values()
            .filter(|c| c.por_enabled && now.saturating_duration_since(c.last_activity) >= timeout)
            .map(|c| c.peer_id)
            .collect()
    }

    /// Record activity on a connection.
    pub fn touch(&self, peer: &PeerId) {
        if let Some(conn) = self.connections.write().get_mut(peer) {
            conn.last_activity = Instant::now();
        }
    }

    pub fn set_healthy(&self, peer: &PeerId, healthy: bool) {
        if let Some(conn) = self.connections.write().get_mut(peer) {
            if conn.healthy != healthy {
                debug!("Peer {} health: {}", peer, healthy);
            }
            conn.healthy = healthy;
        }
    }

    /// Ban a peer for `duration` and drop its connection.
    pub fn ban(&self, peer: &PeerId, duration: Duration, reason: &str) {
        warn!("Banning peer {} for {:?}: {}", peer, duration, reason);
        self.bans.write().insert(*peer, Instant::now() + duration);
        self.on_disconnect(peer);
        self.known.lock().pop(peer);
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.bans
            .read()
            .get(peer)
            .is_some_and(|until| *until > Instant::now())
    }

    /// Lift expired bans. Returns how many were lifted.
    pub fn expire_bans(&self) -> usize {
        let now = Instant::now();
        let mut bans = self.bans.write();
        let before = bans.len();
        bans.retain(|_, until| *until > now);
        before - bans.len()
    }

    /// Refresh the dialable address cached for a peer.
    fn remember(&self, peer: PeerId, addr: SocketAddr) {
        self.known.lock().put(peer, KnownPeer { addr, last_seen: Instant::now() });
    }

    /// Recently seen peers that are neither connected nor banned.
    pub fn reconnect_candidates(&self) -> Vec<(PeerId, SocketAddr)> {
        let now = Instant::now();
        let mut known = self.known.lock();

        let stale: Vec<PeerId> = known
            .iter()
            .filter(|(_, k)| now.saturating_duration_since(k.last_seen) > self.peer_states_ttl)
            .map(|(p, _)| *p)
            .collect();
        for peer in &stale {
            known.pop(peer);
        }

        known
            .iter()
            .filter(|(p, _)| !self.is_connected(p) && !self.is_banned(p))
            .map(|(p, k)| (*p, k.addr))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(max: usize) -> PeerRegistry {
        let config = NetConfig { max_num_peers: max, safe_set_size: 2, ..Default::default() };
        PeerRegistry::new(PeerId([0; 32]), &config)
    }

    fn conn(byte: u8) -> Connection {
        Connection::new(PeerId([byte; 32]), "127.0.0.1:1000".parse().unwrap(), Direction::Outbound, true)
    }

    #[derive(Default)]
    struct Recorder {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl PeerObserver for Recorder {
        fn on_peer_connected(&self, _conn: &Connection) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_peer_disconnected(&self, _peer: &PeerId) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_connect_disconnect_notifies_observers() {
        let registry = registry(10);
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(recorder.clone());

        registry.on_connect(conn(1)).unwrap();
        assert!(registry.is_connected(&PeerId([1; 32])));
        assert_eq!(registry.connections().len(), 1);

        assert!(registry.on_disconnect(&PeerId([1; 32])));
        assert!(!registry.on_disconnect(&PeerId([1; 32])));
        assert!(!registry.is_connected(&PeerId([1; 32])));

        assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_limits_and_duplicates() {
        let registry = registry(2);
        registry.on_connect(conn(1)).unwrap();
        assert_eq!(registry.on_connect(conn(1)), Err(RegistryError::AlreadyConnected(PeerId([1; 32]))));
        registry.on_connect(conn(2)).unwrap();
        assert_eq!(registry.on_connect(conn(3)), Err(RegistryError::MaxConnections(2)));
        assert_eq!(registry.on_connect(conn(0)), Err(RegistryError::SelfConnection));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_disconnects_and_expires() {
        let registry = registry(10);
        let peer = PeerId([5; 32]);
        registry.on_connect(conn(5)).unwrap();

        registry.ban(&peer, Duration::from_secs(10), "test");
        assert!(!registry.is_connected(&peer));
        assert!(registry.is_banned(&peer));
        assert_eq!(registry.on_connect(conn(5)), Err(RegistryError::Banned(peer)));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!registry.is_banned(&peer));
        assert_eq!(registry.expire_bans(), 1);
        registry.on_connect(conn(5)).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_safe_peers_prefer_oldest_healthy() {
        let registry = registry(10);
        for b in 1..=3u8 {
            registry.on_connect(conn(b)).unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        registry.set_healthy(&PeerId([1; 32]), false);

        assert_eq!(registry.safe_peers(), vec![PeerId([2; 32]), PeerId([3; 32])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_peers_are_reported_until_touched() {
        let registry = registry(10);
        registry.on_connect(conn(1)).unwrap();
        registry.on_connect(conn(2)).unwrap();
        let silent_legacy = Connection::new(PeerId([3; 32]), "127.0.0.1:1000".parse().unwrap(), Direction::Inbound, false);
        registry.on_connect(silent_legacy).unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        registry.touch(&PeerId([2; 32]));
        tokio::time::advance(Duration::from_secs(30)).await;

        let idle = registry.idle_peers(Duration::from_secs(60), Instant::now());
        assert_eq!(idle, vec![PeerId([1; 32])]);
        assert!(registry.idle_peers(Duration::from_secs(61), Instant::now()).is_empty());
    }

    #[tokio::test]
    async fn test_unhealthy_peers() {
        let registry = registry(10);
        registry.on_connect(conn(1)).unwrap();
        registry.on_connect(conn(2)).unwrap();
        registry.set_healthy(&PeerId([2; 32]), false);
        assert_eq!(registry.unhealthy_peers(), vec![PeerId([2; 32])]);
        registry.set_healthy(&PeerId([2; 32]), true);
        assert!(registry.unhealthy_peers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_candidates() {
        let registry = registry(10);
        let addr: SocketAddr = "10.0.0.1:24567".parse().unwrap();
        registry.on_connect(conn(7).with_listen_addr(addr)).unwrap();
        assert!(registry.reconnect_candidates().is_empty());

        registry.on_disconnect(&PeerId([7; 32]));
        assert_eq!(registry.reconnect_candidates(), vec![(PeerId([7; 32]), addr)]);

        tokio::time::advance(Duration::from_secs(3_601)).await;
        assert!(registry.reconnect_candidates().is_empty());
    }
}
