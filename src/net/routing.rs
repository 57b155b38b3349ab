//! Next-hop resolution.
//!
//! Resolution order:
//!
//! 1. the destination is us → [`Route::Local`]
//! 2. direct connection to the destination → that peer
//! 3. a live route-back entry whose via-peer is still connected → the via-peer
//! 4. otherwise [`Route::Unreachable`]
//!
//! Route-back entries are learned from inbound messages that arrived
//! through an intermediate peer: a reply to the original sender goes back
//! the way the request came. The table is an LRU bounded by
//! `route_back_cache_size`, so a peer spraying forged sources only evicts
//! old entries. Entries also expire after `route_back_ttl`.
//!
//! Loops are prevented by the message TTL alone: it strictly decreases per
//! hop, so no visited-set is carried.

use super::registry::{PeerObserver, PeerRegistry};
use crate::types::PeerId;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    NextHop(PeerId),
    Unreachable,
}

#[derive(Debug, Clone, Copy)]
struct RouteBack {
    via: PeerId,
    expires_at: Instant,
}

pub struct RoutingTable {
    local_id: PeerId,
    registry: Arc<PeerRegistry>,
    route_back_ttl: Duration,
    route_back: Mutex<LruCache<PeerId, RouteBack>>,
}

impl RoutingTable {
    pub fn new(registry: Arc<PeerRegistry>, capacity: usize, route_back_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            local_id: registry.local_id(),
            registry,
            route_back_ttl,
            route_back: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn resolve(&self, destination: &PeerId) -> Route {
        self.resolve_at(destination, Instant::now())
    }

    pub fn resolve_at(&self, destination: &PeerId, now: Instant) -> Route {
        if *destination == self.local_id {
            return Route::Local;
        }
        if self.registry.is_connected(destination) {
            return Route::NextHop(*destination);
        }

        // Copy the entry out; the lock is not held across the registry check
        let entry = self.route_back.lock().get(destination).copied();
        match entry {
            Some(entry) if entry.expires_at > now => {
                if self.registry.is_connected(&entry.via) {
                    Route::NextHop(entry.via)
                } else {
                    Route::Unreachable
                }
            }
            Some(_) => {
                self.route_back.lock().pop(destination);
                debug!("Route back to {} expired", destination);
                Route::Unreachable
            }
            None => Route::Unreachable,
        }
    }

    /// Learn that `source` is reachable through `via`.
    pub fn record_route_back(&self, source: PeerId, via: PeerId) {
        self.record_route_back_at(source, via, Instant::now());
    }

    pub fn record_route_back_at(&self, source: PeerId, via: PeerId, now: Instant) {
        if source == via || source == self.local_id {
            return;
        }
        self.route_back.lock().put(
            source,
            RouteBack { via, expires_at: now + self.route_back_ttl },
        );
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn expire(&self) -> usize {
        let now = Instant::now();
        let mut table = self.route_back.lock();
        let expired: Vec<PeerId> = table
            .iter()
            .filter(|(_, r)| r.expires_at <= now)
            .map(|(p, _)| *p)
            .collect();
        for peer in &expired {
            table.pop(peer);
        }
        expired.len()
    }

    pub fn route_back_len(&self) -> usize {
        self.route_back.lock().len()
    }
}

impl PeerObserver for RoutingTable {
    fn on_peer_disconnected(&self, peer: &PeerId) {
        // LruCache has no retain(); collect first
        let mut table = self.route_back.lock();
        let stale: Vec<PeerId> = table
            .iter()
            .filter(|(_, r)| r.via == *peer)
            .map(|(p, _)| *p)
            .collect();
        for source in &stale {
            table.pop(source);
        }
        if !stale.is_empty() {
            debug!("Invalidated {} route-back entries via {}", stale.len(), peer);
        }
    }
}
