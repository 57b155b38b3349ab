//! PoR session manager.
//!
//! Owns every [`PorSession`] and drives it from three directions:
//!
//! - the dispatcher delivering Requests, Responses and Acks ([`InboundHandler`])
//! - the scheduler firing deadlines ([`SessionManager::on_timeout`])
//! - the registry reporting disconnects ([`PeerObserver`])
//!
//! # Locking
//!
//! The session table lock is never held while a session mutex is taken:
//! entries are cloned out first. Each transition runs under its session's
//! mutex and re-checks the state, so a late Response racing a timeout
//! yields exactly one terminal event.
//!
//! # Peer health
//!
//! A completed check marks its peer healthy, a timeout or a transport
//! failure marks it unhealthy. Unhealthy peers leave the registry's safe set.

use super::session::{FailureReason, PorSession, SessionSnapshot, SessionState};
use super::{PorError, PorEvent, SessionHandle};
use crate::config::{NetConfig, PorConfig};
use crate::net::counters::Counters;
use crate::net::dispatcher::{DispatchError, Dispatcher, InboundHandler};
use crate::net::message::RoutedMessage;
use crate::net::rate_limit::RateLimiter;
use crate::net::registry::{PeerObserver, PeerRegistry};
use crate::net::transport::{SendAck, TransportError};
use crate::scheduler::TimerHandle;
use crate::types::{Nonce, PeerId};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the event broadcast channel. Slow subscribers lag, they
/// never block the protocol.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

type SessionEntry = Arc<Mutex<PorSession>>;

pub struct SessionManager {
    me: Weak<SessionManager>,
    local_id: PeerId,
    enabled: bool,
    config: PorConfig,
    routed_message_ttl: u8,
    registry: Arc<PeerRegistry>,
    dispatcher: Arc<Dispatcher>,
    /// Bounds how many Responses we hand out, separately from inbound
    /// admission. Keyed by the neighbour a request arrived from, never by
    /// its claimed source.
    responder_limiter: RateLimiter,
    counters: Arc<Counters>,
    timers: TimerHandle,
    sessions: RwLock<HashMap<Nonce, SessionEntry>>,
    /// Terminal sessions in finishing order, for retention pruning
    retired: Mutex<VecDeque<(Nonce, Instant)>>,
    last_completed: Mutex<HashMap<PeerId, Instant>>,
    next_nonce: AtomicU64,
    events: broadcast::Sender<PorEvent>,
}

impl SessionManager {
    pub fn new(
        config: &NetConfig,
        registry: Arc<PeerRegistry>,
        dispatcher: Arc<Dispatcher>,
        counters: Arc<Counters>,
        timers: TimerHandle,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            local_id: registry.local_id(),
            enabled: config.por_enabled,
            config: config.por.clone(),
            routed_message_ttl: config.routed_message_ttl,
            registry,
            dispatcher,
            responder_limiter: RateLimiter::new(config.rate_limit.clone()),
            counters,
            timers,
            sessions: RwLock::new(HashMap::new()),
            retired: Mutex::new(VecDeque::new()),
            last_completed: Mutex::new(HashMap::new()),
            // Random start so nonces differ across restarts
            next_nonce: AtomicU64::new(rand::random::<u32>() as u64),
            events,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PorEvent> {
        self.events.subscribe()
    }

    /// Start a liveness check against a connected peer.
    ///
    /// A send the dispatcher rejects outright fails the session immediately;
    /// the handle is still returned so the caller can look the session up.
    pub fn initiate(&self, peer: PeerId) -> Result<SessionHandle, PorError> {
        if !self.enabled {
            return Err(PorError::Disabled);
        }
        if !self.registry.is_connected(&peer) {
            return Err(PorError::NoSuchPeer(peer));
        }
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        self.start_session(peer, nonce)
    }

    pub(crate) fn start_session(&self, peer: PeerId, nonce: Nonce) -> Result<SessionHandle, PorError> {
        let now = Instant::now();
        let session = PorSession::new(
            nonce,
            peer,
            self.config.check_payload.as_bytes().to_vec(),
            self.config.request_timeout(),
            self.config.max_retries,
            now,
        );
        let deadline = session.deadline;
        let entry = Arc::new(Mutex::new(session));

        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&nonce) {
                return Err(PorError::DuplicateNonce(nonce));
            }
            sessions.insert(nonce, entry.clone());
        }

        self.timers.schedule(nonce, deadline);
        let mut session = entry.lock();
        self.send_request(&mut session, now);
        Ok(SessionHandle { nonce, peer })
    }

    fn send_request(&self, session: &mut PorSession, now: Instant) {
        let msg = RoutedMessage::request(
            self.local_id,
            session.target,
            session.nonce,
            self.routed_message_ttl,
            session.payload.clone(),
        )
        .with_attempt(session.attempts());
        info!(
            target: "por",
            peer = %session.target,
            nonce = session.nonce,
            attempt = session.attempts(),
            "Sending PoR request"
        );

        match self.dispatcher.send(msg) {
            Ok(ack) => {
                Counters::inc(&self.counters.requests_sent);
                self.emit(PorEvent::RequestSent {
                    peer: session.target,
                    nonce: session.nonce,
                    attempt: session.attempts(),
                    at: Utc::now(),
                });
                self.watch_request_ack(session.nonce, ack);
            }
            Err(e) => {
                let reason = match e {
                    DispatchError::Oversized(..) => FailureReason::Oversized,
                    _ => FailureReason::NoRoute,
                };
                debug!(target: "por", "Cannot send PoR request {}: {}", session.nonce, e);
                self.fail(session, reason, now);
            }
        }
    }

    /// Surface an asynchronous transport failure as `on_send_failed`.
    fn watch_request_ack(&self, nonce: Nonce, ack: SendAck) {
        let me = self.me.clone();
        tokio::spawn(async move {
            let result = ack
                .await
                .unwrap_or_else(|_| Err(TransportError::Io("send abandoned".into())));
            if let (Err(e), Some(manager)) = (result, me.upgrade()) {
                manager.on_send_failed(nonce, e);
            }
        });
    }

    /// Count a failed Response or Ack send. Nothing is retried.
    fn watch_reply_ack(&self, peer: PeerId, ack: SendAck) {
        let counters = self.counters.clone();
        tokio::spawn(async move {
            if let Ok(Err(e)) = ack.await {
                Counters::inc(&counters.send_failures);
                debug!(target: "por", "PoR reply to {} not sent: {}", peer, e);
            }
        });
    }

    fn send_ack(&self, peer: PeerId, nonce: Nonce, attempt: u32) {
        let msg = RoutedMessage::ack(self.local_id, peer, nonce, self.routed_message_ttl).with_attempt(attempt);
        match self.dispatcher.send(msg) {
            Ok(ack) => {
                Counters::inc(&self.counters.acks_sent);
                self.watch_reply_ack(peer, ack);
            }
            Err(e) => debug!(target: "por", "Cannot acknowledge PoR response {} from {}: {}", nonce, peer, e),
        }
    }

    /// Deadline callback. Delivery is at-least-once: anything but an
    /// expired `Pending` session is ignored.
    pub fn on_timeout(&self, nonce: Nonce) {
        let Some(entry) = self.entry(nonce) else {
            return;
        };
        let now = Instant::now();
        let mut session = entry.lock();
        if !session.is_pending() || !session.is_expired(now) {
            return;
        }

        if session.retry(self.config.request_timeout(), now) {
            Counters::inc(&self.counters.retries);
            debug!(
                target: "por",
                "PoR request {} to {} unanswered, retry {}/{}",
                nonce, session.target, session.retries, session.max_retries
            );
            self.timers.schedule(nonce, session.deadline);
            self.send_request(&mut session, now);
        } else if session.time_out(now) {
            Counters::inc(&self.counters.sessions_timed_out);
            self.registry.set_healthy(&session.target, false);
            warn!(
                target: "por",
                peer = %session.target,
                nonce,
                attempts = session.attempts(),
                "PoR session timed out"
            );
            self.retire(nonce, now);
            self.emit(PorEvent::TimedOut {
                peer: session.target,
                nonce,
                attempts: session.attempts(),
                at: Utc::now(),
            });
        }
    }

    /// Transport-level failure of a request send. Short-circuits retries.
    pub fn on_send_failed(&self, nonce: Nonce, error: TransportError) {
        let Some(entry) = self.entry(nonce) else {
            return;
        };
        let mut session = entry.lock();
        if session.is_pending() {
            Counters::inc(&self.counters.send_failures);
            self.registry.set_healthy(&session.target, false);
            self.fail(&mut session, FailureReason::Transport(error.to_string()), Instant::now());
        }
    }

    fn fail(&self, session: &mut PorSession, reason: FailureReason, now: Instant) {
        if !session.fail(reason.clone(), now) {
            return;
        }
        self.timers.cancel(session.nonce);
        Counters::inc(&self.counters.sessions_failed);
        warn!(
            target: "por",
            peer = %session.target,
            nonce = session.nonce,
            "PoR session failed: {}",
            reason
        );
        self.retire(session.nonce, now);
        self.emit(PorEvent::Failed {
            peer: session.target,
            nonce: session.nonce,
            reason,
            at: Utc::now(),
        });
    }

    fn retire(&self, nonce: Nonce, now: Instant) {
        self.retired.lock().push_back((nonce, now));
    }

    fn entry(&self, nonce: Nonce) -> Option<SessionEntry> {
        self.sessions.read().get(&nonce).cloned()
    }

    fn emit(&self, event: PorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn session(&self, nonce: Nonce) -> Option<SessionSnapshot> {
        self.entry(nonce).map(|entry| entry.lock().snapshot())
    }

    pub fn pending_count(&self) -> usize {
        let entries: Vec<SessionEntry> = self.sessions.read().values().cloned().collect();
        entries.iter().filter(|e| e.lock().is_pending()).count()
    }

    /// A peer needs a check when nothing is in flight to it and its last
    /// completed check is older than `check_interval`.
    pub fn needs_check(&self, peer: &PeerId, now: Instant) -> bool {
        if let Some(done) = self.last_completed.lock().get(peer) {
            if now.saturating_duration_since(*done) < self.config.check_interval() {
                return false;
            }
        }
        let entries: Vec<SessionEntry> = self.sessions.read().values().cloned().collect();
        !entries.iter().any(|e| {
            let s = e.lock();
            s.target == *peer && s.is_pending()
        })
    }

    /// Drop terminal sessions beyond the retention count or older than the
    /// retention window. Returns how many were dropped.
    pub fn prune(&self, now: Instant) -> usize {
        let window = self.config.session_retention_window();
        let expired: Vec<Nonce> = {
            let mut retired = self.retired.lock();
            let mut out = Vec::new();
            while let Some(&(nonce, finished)) = retired.front() {
                let too_many = retired.len() > self.config.session_retention;
                let too_old = now.saturating_duration_since(finished) >= window;
                if !too_many && !too_old {
                    break;
                }
                retired.pop_front();
                out.push(nonce);
            }
            out
        };

        if !expired.is_empty() {
            let mut sessions = self.sessions.write();
            for nonce in &expired {
                sessions.remove(nonce);
            }
        }
        expired.len()
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }
}

impl InboundHandler for SessionManager {
    /// Responder side: echo nonce, attempt and payload back to the requester.
    fn on_request(&self, via: PeerId, msg: RoutedMessage) {
        let RoutedMessage { source: peer, nonce, attempt, path, total_latency_ms, payload, .. } = msg;
        Counters::inc(&self.counters.requests_received);
        info!(
            target: "por",
            %peer,
            nonce,
            hops = path.len(),
            latency_ms = total_latency_ms,
            "Received PoR request"
        );
        self.emit(PorEvent::RequestReceived {
            peer,
            nonce,
            path,
            latency_ms: total_latency_ms,
            at: Utc::now(),
        });

        if !self.enabled {
            debug!(target: "por", "PoR disabled, ignoring request {} from {}", nonce, peer);
            return;
        }
        if !self.responder_limiter.admit(&via, payload.len()).is_admitted() {
            Counters::inc(&self.counters.responses_suppressed);
            debug!(target: "por", "Response budget for {} exhausted, dropping request {} from {}", via, nonce, peer);
            return;
        }

        info!(target: "por", %peer, nonce, "Sending PoR response");
        let reply = RoutedMessage::response(self.local_id, peer, nonce, self.routed_message_ttl, payload)
            .with_attempt(attempt);
        match self.dispatcher.send(reply) {
            Ok(ack) => {
                Counters::inc(&self.counters.responses_sent);
                self.emit(PorEvent::ResponseSent { peer, nonce, at: Utc::now() });
                self.watch_reply_ack(peer, ack);
            }
            Err(e) => debug!(target: "por", "Cannot answer PoR request {} from {}: {}", nonce, peer, e),
        }
    }

    fn on_response(&self, msg: RoutedMessage) {
        let RoutedMessage { source, nonce, attempt, path, total_latency_ms, payload, .. } = msg;
        Counters::inc(&self.counters.responses_received);
        info!(
            target: "por",
            peer = %source,
            nonce,
            hops = path.len(),
            latency_ms = total_latency_ms,
            "Received PoR response"
        );
        self.emit(PorEvent::ResponseReceived {
            peer: source,
            nonce,
            path,
            latency_ms: total_latency_ms,
            at: Utc::now(),
        });

        let Some(entry) = self.entry(nonce) else {
            Counters::inc(&self.counters.duplicate_responses);
            debug!(target: "por", "Response for unknown session {} from {}", nonce, source);
            return;
        };

        let now = Instant::now();
        let mut session = entry.lock();
        if session.state != SessionState::Pending {
            Counters::inc(&self.counters.duplicate_responses);
            debug!(target: "por", "Late response for {:?} session {}", session.state, nonce);
            return;
        }
        if session.target != source {
            Counters::inc(&self.counters.anomalous_responses);
            warn!(
                target: "por",
                "Response for session {} came from {}, expected {}",
                nonce, source, session.target
            );
            return;
        }
        if session.payload != payload {
            Counters::inc(&self.counters.anomalous_responses);
            warn!(target: "por", "Response for session {} from {} does not echo the request", nonce, source);
            return;
        }

        if let Some(rtt) = session.complete(attempt, now) {
            self.timers.cancel(nonce);
            Counters::inc(&self.counters.sessions_completed);
            self.last_completed.lock().insert(source, now);
            self.registry.set_healthy(&source, true);
            info!(
                target: "por",
                peer = %source,
                nonce,
                attempt,
                rtt_ms = rtt.as_millis() as u64,
                "PoR session completed"
            );
            self.retire(nonce, now);
            self.emit(PorEvent::Completed { peer: source, nonce, rtt, at: Utc::now() });
            self.send_ack(source, nonce, attempt);
        }
    }

    /// Closes the exchange on the responder side. Responders keep no
    /// session state, so this only logs and counts.
    fn on_ack(&self, msg: RoutedMessage) {
        Counters::inc(&self.counters.acks_received);
        info!(target: "por", peer = %msg.source, nonce = msg.nonce, "Received PoR ack");
        self.emit(PorEvent::AckReceived { peer: msg.source, nonce: msg.nonce, at: Utc::now() });
    }
}

impl PeerObserver for SessionManager {
    fn on_peer_disconnected(&self, peer: &PeerId) {
        self.responder_limiter.forget(peer);
        self.last_completed.lock().remove(peer);

        let entries: Vec<SessionEntry> = self.sessions.read().values().cloned().collect();
        let now = Instant::now();
        for entry in entries {
            let mut session = entry.lock();
            if session.target == *peer && session.is_pending() {
                self.fail(&mut session, FailureReason::PeerDisconnected, now);
            }
        }
    }
}
