//! Message dispatcher.
//!
//! Outbound: resolve the next hop, frame, hand to the transport without
//! waiting. Inbound: admit → parse → learn route back → deliver locally or
//! forward one hop closer.
//!
//! Every per-message failure is counted and the frame dropped. Nothing here
//! closes a connection except a ban for repeated rate-limit violations.
//!
//! Each hop restamps `hop_sent_at_ms` on send and adds the observed link
//! latency on arrival. Forwarders append themselves to the message path.

use super::counters::Counters;
use super::message::{decode_frame, encode_frame, unix_millis, FrameError, MessageKind, RoutedMessage, WireMessage};
use super::rate_limit::{Admission, RateLimiter, Rejection};
use super::registry::PeerRegistry;
use super::routing::{Route, RoutingTable};
use super::transport::{SendAck, Transport};
use crate::types::PeerId;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no route to {0}")]
    NoRoute(PeerId),
    #[error("frame from unregistered peer {0}")]
    NotConnected(PeerId),
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),
    #[error("unexpected {0} message")]
    Unexpected(&'static str),
    #[error("message too large: {0} bytes (max: {1})")]
    Oversized(usize, usize),
    #[error("rate limited")]
    RateLimited,
}

/// What happened to an inbound frame that was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Local(MessageKind),
    Forwarded(PeerId),
    /// Not for us and out of hops
    TtlExpired,
}

/// Receiver of messages addressed to this node.
pub trait InboundHandler: Send + Sync {
    /// A Request that reached us over the link to neighbour `via`.
    fn on_request(&self, via: PeerId, msg: RoutedMessage);
    fn on_response(&self, msg: RoutedMessage);
    fn on_ack(&self, msg: RoutedMessage);
}

pub struct Dispatcher {
    local_id: PeerId,
    registry: Arc<PeerRegistry>,
    routing: Arc<RoutingTable>,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn Transport>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PeerRegistry>,
        routing: Arc<RoutingTable>,
        limiter: Arc<RateLimiter>,
        transport: Arc<dyn Transport>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            local_id: registry.local_id(),
            registry,
            routing,
            limiter,
            transport,
            counters,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Route and enqueue a message. Returns as soon as the frame is handed
    /// to the transport.
    pub fn send(&self, msg: RoutedMessage) -> Result<SendAck, DispatchError> {
        self.send_via(msg).map(|(_, ack)| ack)
    }

    fn send_via(&self, mut msg: RoutedMessage) -> Result<(PeerId, SendAck), DispatchError> {
        let destination = msg.destination;
        if msg.ttl == 0 {
            Counters::inc(&self.counters.no_route);
            return Err(DispatchError::NoRoute(destination));
        }

        let hop = match self.routing.resolve(&destination) {
            Route::NextHop(hop) => hop,
            Route::Local | Route::Unreachable => {
                Counters::inc(&self.counters.no_route);
                return Err(DispatchError::NoRoute(destination));
            }
        };

        msg.hop_sent_at_ms = unix_millis();
        let frame = encode_frame(&WireMessage::Routed(msg))?;
        let max = self.limiter.config().max_message_size;
        if frame.len() > max {
            Counters::inc(&self.counters.oversized);
            return Err(DispatchError::Oversized(frame.len(), max));
        }

        trace!("Sending {} bytes to {} via {}", frame.len(), destination, hop);
        Counters::inc(&self.counters.frames_sent);
        Ok((hop, self.transport.send_frame(&hop, frame)))
    }

    /// Handle one frame read from the connection to `via`.
    pub fn on_receive(
        &self,
        via: &PeerId,
        frame: &[u8],
        handler: &dyn InboundHandler,
    ) -> Result<Delivery, DispatchError> {
        Counters::inc(&self.counters.frames_received);

        // Budgets are only ever created for live links
        if !self.registry.is_connected(via) {
            Counters::inc(&self.counters.unregistered_frames);
            trace!("Dropping frame from unregistered peer {}", via);
            return Err(DispatchError::NotConnected(*via));
        }

        if let Admission::Rejected { reason, ban } = self.limiter.admit(via, frame.len()) {
            if ban {
                Counters::inc(&self.counters.peers_banned);
                self.registry
                    .ban(via, self.limiter.config().ban_window(), "rate limit violations");
            }
            return Err(match reason {
                Rejection::Oversized => {
                    Counters::inc(&self.counters.oversized);
                    debug!("Dropping oversized frame ({} bytes) from {}", frame.len(), via);
                    DispatchError::Oversized(frame.len(), self.limiter.config().max_message_size)
                }
                Rejection::RateLimited => {
                    Counters::inc(&self.counters.rate_limited);
                    debug!("Rate limited frame from {}", via);
                    DispatchError::RateLimited
                }
            });
        }

        let mut msg = match decode_frame(frame) {
            Ok(WireMessage::Routed(msg)) => msg,
            Ok(other) => {
                Counters::inc(&self.counters.malformed_frames);
                debug!("Unexpected {} from {}", other.command(), via);
                return Err(DispatchError::Unexpected(other.command()));
            }
            Err(e) => {
                Counters::inc(&self.counters.malformed_frames);
                debug!("Malformed frame from {}: {}", via, e);
                return Err(e.into());
            }
        };

        msg.record_arrival(unix_millis());
        self.registry.touch(via);
        self.routing.record_route_back(msg.source, *via);

        if msg.destination == self.local_id {
            let kind = msg.kind;
            match kind {
                MessageKind::Request => handler.on_request(*via, msg),
                MessageKind::Response => handler.on_response(msg),
                MessageKind::Ack => handler.on_ack(msg),
            }
            return Ok(Delivery::Local(kind));
        }

        self.forward(msg)
    }

    fn forward(&self, mut msg: RoutedMessage) -> Result<Delivery, DispatchError> {
        if !msg.decrement_ttl() {
            Counters::inc(&self.counters.ttl_expired);
            debug!("TTL expired for message {} -> {}", msg.source, msg.destination);
            return Ok(Delivery::TtlExpired);
        }

        msg.path.push(self.local_id);
        let (hop, ack) = self.send_via(msg)?;
        Counters::inc(&self.counters.forwarded);
        self.watch_forward_ack(hop, ack);
        Ok(Delivery::Forwarded(hop))
    }

    fn watch_forward_ack(&self, hop: PeerId, ack: SendAck) {
        let counters = self.counters.clone();
        tokio::spawn(async move {
            if let Ok(Err(e)) = ack.await {
                Counters::inc(&counters.send_failures);
                debug!("Forward to {} not sent: {}", hop, e);
            }
        });
    }
}
