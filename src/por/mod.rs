//! Proof-of-Response: a liveness check between peers.
//!
//! The initiator sends a Request carrying a nonce and an opaque payload;
//! the responder echoes both back in a Response. A matching Response within
//! the deadline completes the session and is acknowledged with an Ack.
//! Missing Responses are retried with the same nonce up to `max_retries`
//! times before the session times out.
//!
//! Completed checks mark the peer healthy; timeouts mark it unhealthy, which
//! takes it out of the registry's safe set until a later check succeeds.
//!
//! "PoR" here is a responsiveness check, not a cryptographic proof.

pub mod manager;
pub mod session;

pub use manager::SessionManager;
pub use session::{FailureReason, PorSession, SessionSnapshot, SessionState};

use crate::types::{Nonce, PeerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PorError {
    #[error("peer {0} is not connected")]
    NoSuchPeer(PeerId),
    #[error("nonce {0} already in use")]
    DuplicateNonce(Nonce),
    #[error("PoR is disabled")]
    Disabled,
}

/// Returned by [`SessionManager::initiate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    pub nonce: Nonce,
    pub peer: PeerId,
}

/// One observable protocol transition.
///
/// Log lines under target `por` are a projection of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PorEvent {
    RequestSent { peer: PeerId, nonce: Nonce, attempt: u32, at: DateTime<Utc> },
    /// `path` lists the forwarders the request crossed; `latency_ms` sums
    /// the link latencies they observed.
    RequestReceived { peer: PeerId, nonce: Nonce, path: Vec<PeerId>, latency_ms: u64, at: DateTime<Utc> },
    ResponseSent { peer: PeerId, nonce: Nonce, at: DateTime<Utc> },
    ResponseReceived { peer: PeerId, nonce: Nonce, path: Vec<PeerId>, latency_ms: u64, at: DateTime<Utc> },
    /// The initiator confirmed our echo
    AckReceived { peer: PeerId, nonce: Nonce, at: DateTime<Utc> },
    Completed { peer: PeerId, nonce: Nonce, rtt: Duration, at: DateTime<Utc> },
    TimedOut { peer: PeerId, nonce: Nonce, attempts: u32, at: DateTime<Utc> },
    Failed { peer: PeerId, nonce: Nonce, reason: FailureReason, at: DateTime<Utc> },
}

impl PorEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            PorEvent::RequestSent { peer, .. }
            | PorEvent::RequestReceived { peer, .. }
            | PorEvent::ResponseSent { peer, .. }
            | PorEvent::ResponseReceived { peer, .. }
            | PorEvent::AckReceived { peer, .. }
            | PorEvent::Completed { peer, .. }
            | PorEvent::TimedOut { peer, .. }
            | PorEvent::Failed { peer, .. } => *peer,
        }
    }

    pub fn nonce(&self) -> Nonce {
        match self {
            PorEvent::RequestSent { nonce, .. }
            | PorEvent::RequestReceived { nonce, .. }
            | PorEvent::ResponseSent { nonce, .. }
            | PorEvent::ResponseReceived { nonce, .. }
            | PorEvent::AckReceived { nonce, .. }
            | PorEvent::Completed { nonce, .. }
            | PorEvent::TimedOut { nonce, .. }
            | PorEvent::Failed { nonce, .. } => *nonce,
        }
    }

    /// True for `Completed`, `TimedOut` and `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PorEvent::Completed { .. } | PorEvent::TimedOut { .. } | PorEvent::Failed { .. }
        )
    }
}
