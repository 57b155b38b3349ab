//! Scheduler: periodic checks, on-connect checks, session deadlines and
//! housekeeping, all in one task.
//!
//! Each tick checks the safe set plus any unhealthy peers, so a peer that
//! starts answering again can rejoin the safe set.
//!
//! Session deadlines live in a `DelayQueue` keyed by nonce. The session
//! manager arms and disarms them through a [`TimerHandle`]; the queue itself
//! is only touched by the scheduler task.

use crate::config::NetConfig;
use crate::net::counters::Counters;
use crate::net::registry::{Connection, PeerObserver, PeerRegistry};
use crate::net::routing::RoutingTable;
use crate::por::{PorError, SessionManager};
use crate::types::{Nonce, PeerId};
use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, trace};

/// Pending on-connect notifications. Overflow is caught by the next tick.
const CONNECT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    /// Arm (or re-arm) the deadline for a session
    Schedule(Nonce, Instant),
    Cancel(Nonce),
}

/// Cheap, cloneable access to the scheduler's timer queue.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    tx: mpsc::UnboundedSender<TimerCommand>,
}

impl TimerHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TimerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn schedule(&self, nonce: Nonce, deadline: Instant) {
        // Closed only after the scheduler stopped; nothing left to time
        let _ = self.tx.send(TimerCommand::Schedule(nonce, deadline));
    }

    pub fn cancel(&self, nonce: Nonce) {
        let _ = self.tx.send(TimerCommand::Cancel(nonce));
    }
}

/// Registry observer that forwards PoR-capable connects to the scheduler.
pub struct ConnectNotifier {
    tx: mpsc::Sender<PeerId>,
}

impl ConnectNotifier {
    pub fn channel() -> (Arc<Self>, mpsc::Receiver<PeerId>) {
        let (tx, rx) = mpsc::channel(CONNECT_QUEUE_CAPACITY);
        (Arc::new(Self { tx }), rx)
    }
}

impl PeerObserver for ConnectNotifier {
    fn on_peer_connected(&self, conn: &Connection) {
        if conn.por_enabled && self.tx.try_send(conn.peer_id).is_err() {
            debug!("Connect queue full, {} waits for the next tick", conn.peer_id);
        }
    }
}

/// Session deadlines, one entry per nonce.
#[derive(Default)]
struct SessionTimers {
    queue: DelayQueue<Nonce>,
    keys: HashMap<Nonce, delay_queue::Key>,
}

impl SessionTimers {
    fn apply(&mut self, cmd: TimerCommand) {
        match cmd {
            TimerCommand::Schedule(nonce, deadline) => match self.keys.get(&nonce) {
                Some(key) => self.queue.reset_at(key, deadline),
                None => {
                    let key = self.queue.insert_at(nonce, deadline);
                    self.keys.insert(nonce, key);
                }
            },
            TimerCommand::Cancel(nonce) => {
                if let Some(key) = self.keys.remove(&nonce) {
                    self.queue.remove(&key);
                }
            }
        }
    }

    /// Forget an entry the queue just yielded.
    fn expired(&mut self, nonce: Nonce) {
        self.keys.remove(&nonce);
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

pub struct Scheduler {
    check_interval: Duration,
    idle_timeout: Option<Duration>,
    manager: Arc<SessionManager>,
    registry: Arc<PeerRegistry>,
    routing: Arc<RoutingTable>,
    timer_rx: mpsc::UnboundedReceiver<TimerCommand>,
    connect_rx: mpsc::Receiver<PeerId>,
    timers: SessionTimers,
}

impl Scheduler {
    pub fn new(
        config: &NetConfig,
        manager: Arc<SessionManager>,
        registry: Arc<PeerRegistry>,
        routing: Arc<RoutingTable>,
        timer_rx: mpsc::UnboundedReceiver<TimerCommand>,
        connect_rx: mpsc::Receiver<PeerId>,
    ) -> Self {
        Self {
            check_interval: config.por.check_interval(),
            idle_timeout: config.idle_timeout(),
            manager,
            registry,
            routing,
            timer_rx,
            connect_rx,
            timers: SessionTimers::default(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut tick = interval(self.check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(cmd) = self.timer_rx.recv() => self.timers.apply(cmd),
                Some(peer) = self.connect_rx.recv() => self.on_connect(peer),
                Some(expired) = poll_fn(|cx| self.timers.queue.poll_expired(cx)), if !self.timers.queue.is_empty() => {
                    let nonce = expired.into_inner();
                    self.timers.expired(nonce);
                    self.manager.on_timeout(nonce);
                }
                _ = tick.tick() => self.tick(),
            }
        }

        debug!("Scheduler stopped with {} armed timers", self.timers.len());
    }

    fn on_connect(&self, peer: PeerId) {
        if !self.manager.is_enabled() || !self.manager.needs_check(&peer, Instant::now()) {
            return;
        }
        match self.manager.initiate(peer) {
            Ok(handle) => trace!("On-connect PoR check {} with {}", handle.nonce, peer),
            // Raced with a disconnect
            Err(PorError::NoSuchPeer(_)) => {}
            Err(e) => debug!("On-connect PoR check with {} not started: {}", peer, e),
        }
    }

    fn tick(&self) {
        let now = Instant::now();
        let idle = self.drop_idle(now);

        if self.manager.is_enabled() {
            let mut started = 0;
            let mut candidates = self.registry.safe_peers();
            candidates.extend(self.registry.unhealthy_peers());
            for peer in candidates {
                let capable = self.registry.connection(&peer).is_some_and(|c| c.por_enabled);
                if !capable || !self.manager.needs_check(&peer, now) {
                    continue;
                }
                if self.manager.initiate(peer).is_ok() {
                    started += 1;
                }
            }
            if started > 0 {
                debug!("Periodic tick started {} PoR checks", started);
            }
        }

        let pruned = self.manager.prune(now);
        let unbanned = self.registry.expire_bans();
        let routes = self.routing.expire();
        if idle + pruned + unbanned + routes > 0 {
            info!(
                "Housekeeping: dropped {} idle peers, pruned {} sessions, lifted {} bans, expired {} routes",
                idle, pruned, unbanned, routes
            );
        }
    }

    /// Disconnect PoR-capable peers that have gone silent. Skipped while PoR
    /// is disabled locally.
    fn drop_idle(&self, now: Instant) -> usize {
        let Some(timeout) = self.idle_timeout.filter(|_| self.manager.is_enabled()) else {
            return 0;
        };
        let mut dropped = 0;
        for peer in self.registry.idle_peers(timeout, now) {
            if self.registry.on_disconnect(&peer) {
                info!("Dropping {}: silent for {:?}", peer, timeout);
                Counters::inc(&self.manager.counters().idle_disconnects);
                dropped += 1;
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::dispatcher::tests::{RecordingTransport, LOCAL};
    use crate::net::dispatcher::Dispatcher;
    use crate::net::message::MessageKind;
    use crate::net::rate_limit::RateLimiter;
    use crate::types::Direction;

    const B: PeerId = PeerId([2; 32]);
    const C: PeerId = PeerId([3; 32]);

    fn scheduler(config: &NetConfig) -> (Scheduler, Arc<PeerRegistry>, Arc<RecordingTransport>) {
        let registry = Arc::new(PeerRegistry::new(LOCAL, config));
        let routing = Arc::new(RoutingTable::new(registry.clone(), 64, config.route_back_ttl()));
        let transport = Arc::new(RecordingTransport::default());
        let counters = Arc::new(Counters::default());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            routing.clone(),
            Arc::new(RateLimiter::new(config.rate_limit.clone())),
            transport.clone(),
            counters.clone(),
        ));
        let (timers, timer_rx) = TimerHandle::channel();
        let manager = SessionManager::new(config, registry.clone(), dispatcher, counters, timers);
        registry.subscribe(routing.clone());
        registry.subscribe(manager.clone());
        let (_notifier, connect_rx) = ConnectNotifier::channel();
        let scheduler = Scheduler::new(config, manager, registry.clone(), routing, timer_rx, connect_rx);
        (scheduler, registry, transport)
    }

    fn connect(registry: &PeerRegistry, peer: PeerId, por_enabled: bool) {
        let addr = "127.0.0.1:1".parse().unwrap();
        registry.on_connect(Connection::new(peer, addr, Direction::Outbound, por_enabled)).unwrap();
    }

    #[tokio::test]
    async fn test_tick_rechecks_unhealthy_peers() {
        let config = NetConfig { por_enabled: true, ..Default::default() };
        let (scheduler, registry, transport) = scheduler(&config);
        connect(&registry, B, true);
        registry.set_healthy(&B, false);
        assert!(registry.safe_peers().is_empty());

        scheduler.tick();

        let sent = transport.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, B);
        assert_eq!(sent[0].1.kind, MessageKind::Request);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_drops_silent_por_peers() {
        let mut config = NetConfig { por_enabled: true, ..Default::default() };
        config.idle_timeout_ms = 60_000;
        let (scheduler, registry, _transport) = scheduler(&config);
        connect(&registry, B, true);
        connect(&registry, C, false);

        tokio::time::advance(Duration::from_secs(30)).await;
        scheduler.tick();
        assert!(registry.is_connected(&B));

        tokio::time::advance(Duration::from_secs(31)).await;
        scheduler.tick();
        assert!(!registry.is_connected(&B));
        assert!(registry.is_connected(&C));
        assert_eq!(scheduler.manager.counters().snapshot().idle_disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_peers_kept_when_por_disabled() {
        let mut config = NetConfig::default();
        config.idle_timeout_ms = 60_000;
        let (scheduler, registry, transport) = scheduler(&config);
        connect(&registry, B, true);

        tokio::time::advance(Duration::from_secs(120)).await;
        scheduler.tick();
        assert!(registry.is_connected(&B));
        assert!(transport.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_timers_reset_and_cancel() {
        let mut timers = SessionTimers::default();
        let start = Instant::now();

        timers.apply(TimerCommand::Schedule(1, start + Duration::from_secs(1)));
        timers.apply(TimerCommand::Schedule(2, start + Duration::from_secs(2)));
        // Re-arm 1 past 2
        timers.apply(TimerCommand::Schedule(1, start + Duration::from_secs(3)));
        timers.apply(TimerCommand::Cancel(2));
        timers.apply(TimerCommand::Cancel(2));
        assert_eq!(timers.len(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        let expired = poll_fn(|cx| timers.queue.poll_expired(cx)).await.unwrap();
        assert_eq!(expired.into_inner(), 1);
        timers.expired(1);
        assert_eq!(timers.len(), 0);
        assert!(timers.queue.is_empty());
    }
}
