//! Admission control for protocol messages.
//!
//! Two budgets are checked for every message: a global one shared by all
//! peers and a per-peer one. Each budget has a per-second and a per-minute
//! fixed window, aligned on whole seconds/minutes since the limiter was
//! created. A message is admitted only if every window has room; a rejected
//! message leaves the budgets untouched. Nothing is queued.
//!
//! Rejections are tallied per peer per minute. Crossing
//! `violation_threshold` flags the peer for a ban, which the caller applies
//! through the peer registry.
//!
//! Per-peer state lives in lock shards selected by a keyed hash, so a peer
//! cannot pick its identity to pile onto one shard. Locks are always taken
//! global first, then shard.

use super::registry::PeerObserver;
use crate::config::RateLimitConfig;
use crate::types::PeerId;
use parking_lot::Mutex;
use siphasher::sip::SipHasher13;
use std::collections::HashMap;
use std::hash::Hasher;
use tokio::time::Instant;

const SHARDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Larger than `max_message_size`
    Oversized,
    /// A per-peer or global window is exhausted
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected {
        reason: Rejection,
        /// The peer just crossed the violation threshold
        ban: bool,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Window {
    index: u64,
    count: u32,
}

impl Window {
    fn roll(&mut self, index: u64) {
        if self.index != index {
            self.index = index;
            self.count = 0;
        }
    }
}

#[derive(Debug, Default)]
struct Budget {
    second: Window,
    minute: Window,
}

impl Budget {
    fn roll(&mut self, second: u64, minute: u64) {
        self.second.roll(second);
        self.minute.roll(minute);
    }

    fn has_room(&self, per_second: u32, per_minute: u32) -> bool {
        self.second.count < per_second && self.minute.count < per_minute
    }

    fn take(&mut self) {
        self.second.count += 1;
        self.minute.count += 1;
    }
}

#[derive(Debug, Default)]
struct PeerBudget {
    budget: Budget,
    violations: Window,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    epoch: Instant,
    global: Mutex<Budget>,
    shards: Vec<Mutex<HashMap<PeerId, PeerBudget>>>,
    shard_keys: (u64, u64),
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            global: Mutex::new(Budget::default()),
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            shard_keys: (rand::random(), rand::random()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn admit(&self, peer: &PeerId, size: usize) -> Admission {
        self.admit_at(peer, size, Instant::now())
    }

    pub fn admit_at(&self, peer: &PeerId, size: usize, now: Instant) -> Admission {
        let elapsed = now.saturating_duration_since(self.epoch).as_secs();
        let (second, minute) = (elapsed, elapsed / 60);

        let mut global = self.global.lock();
        let mut shard = self.shard(peer).lock();
        let entry = shard.entry(*peer).or_default();

        global.roll(second, minute);
        entry.budget.roll(second, minute);
        entry.violations.roll(minute);

        if size > self.config.max_message_size {
            return self.reject(entry, Rejection::Oversized);
        }

        let global_room = global.has_room(
            self.config.global_messages_per_second,
            self.config.global_messages_per_minute,
        );
        let peer_room = entry
            .budget
            .has_room(self.config.messages_per_second, self.config.messages_per_minute);

        if !global_room || !peer_room {
            return self.reject(entry, Rejection::RateLimited);
        }

        global.take();
        entry.budget.take();
        Admission::Admitted
    }

    fn reject(&self, entry: &mut PeerBudget, reason: Rejection) -> Admission {
        entry.violations.count = entry.violations.count.saturating_add(1);
        let ban = entry.violations.count >= self.config.violation_threshold;
        if ban {
            entry.violations.count = 0;
        }
        Admission::Rejected { reason, ban }
    }

    /// Drop per-peer state. Called on disconnect to keep the table bounded
    /// by the live connection count.
    pub fn forget(&self, peer: &PeerId) {
        self.shard(peer).lock().remove(peer);
    }

    pub fn tracked_peers(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    fn shard(&self, peer: &PeerId) -> &Mutex<HashMap<PeerId, PeerBudget>> {
        let mut hasher = SipHasher13::new_with_keys(self.shard_keys.0, self.shard_keys.1);
        hasher.write(peer.as_bytes());
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }
}

impl PeerObserver for RateLimiter {
    fn on_peer_disconnected(&self, peer: &PeerId) {
        self.forget(peer);
    }
}
