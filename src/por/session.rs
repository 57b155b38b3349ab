//! One liveness exchange.
//!
//! ```text
//!            ┌──────────► Completed
//!            │
//! Pending ───┼──────────► TimedOut
//!  │  ▲      │
//!  └──┘      └──────────► Failed
//! retry
//! ```
//!
//! Every transition method checks the current state first and returns
//! whether it applied, so callers emit events only for the transition that
//! actually happened.

use crate::types::{Nonce, PeerId};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Pending,
    Completed,
    TimedOut,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Pending)
    }
}

/// Why a session went to `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    PeerDisconnected,
    NoRoute,
    Oversized,
    /// Asynchronous send failure reported by the transport
    Transport(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PeerDisconnected => write!(f, "peer disconnected"),
            FailureReason::NoRoute => write!(f, "no route"),
            FailureReason::Oversized => write!(f, "request too large"),
            FailureReason::Transport(e) => write!(f, "transport: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PorSession {
    pub nonce: Nonce,
    pub target: PeerId,
    pub state: SessionState,
    pub payload: Vec<u8>,
    pub created_at: Instant,
    /// Send time of each attempt, first attempt at index 0
    pub sent_at: Vec<Instant>,
    pub deadline: Instant,
    pub retries: u32,
    pub max_retries: u32,
    pub finished_at: Option<Instant>,
    pub rtt: Option<Duration>,
    pub failure: Option<FailureReason>,
}

impl PorSession {
    pub fn new(
        nonce: Nonce,
        target: PeerId,
        payload: Vec<u8>,
        timeout: Duration,
        max_retries: u32,
        now: Instant,
    ) -> Self {
        Self {
            nonce,
            target,
            state: SessionState::Pending,
            payload,
            created_at: now,
            sent_at: vec![now],
            deadline: now + timeout,
            retries: 0,
            max_retries,
            finished_at: None,
            rtt: None,
            failure: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == SessionState::Pending
    }

    /// Total requests sent so far
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn can_retry(&self) -> bool {
        self.is_pending() && self.retries < self.max_retries
    }

    /// Start the next attempt. Same nonce, fresh deadline.
    pub fn retry(&mut self, timeout: Duration, now: Instant) -> bool {
        if !self.can_retry() {
            return false;
        }
        self.retries += 1;
        self.sent_at.push(now);
        self.deadline = now + timeout;
        true
    }

    /// Send time of `attempt` (1-based). Unknown attempts map to the most
    /// recent send.
    pub fn attempt_sent_at(&self, attempt: u32) -> Instant {
        let latest = self.sent_at.last().copied().unwrap_or(self.created_at);
        (attempt as usize)
            .checked_sub(1)
            .and_then(|i| self.sent_at.get(i).copied())
            .unwrap_or(latest)
    }

    /// Complete with a response echoing `attempt`. Returns the round-trip
    /// time measured from that attempt's send, if this call completed the
    /// session.
    pub fn complete(&mut self, attempt: u32, now: Instant) -> Option<Duration> {
        if !self.is_pending() {
            return None;
        }
        let rtt = now.saturating_duration_since(self.attempt_sent_at(attempt));
        self.state = SessionState::Completed;
        self.finished_at = Some(now);
        self.rtt = Some(rtt);
        Some(rtt)
    }

    pub fn time_out(&mut self, now: Instant) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.state = SessionState::TimedOut;
        self.finished_at = Some(now);
        true
    }

    pub fn fail(&mut self, reason: FailureReason, now: Instant) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.state = SessionState::Failed;
        self.finished_at = Some(now);
        self.failure = Some(reason);
        true
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            nonce: self.nonce,
            target: self.target,
            state: self.state,
            retries: self.retries,
            age: self.created_at.elapsed(),
            rtt: self.rtt,
            failure: self.failure.clone(),
        }
    }
}

/// Read-only view handed out by the session manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub nonce: Nonce,
    pub target: PeerId,
    pub state: SessionState,
    pub retries: u32,
    pub age: Duration,
    pub rtt: Option<Duration>,
    pub failure: Option<FailureReason>,
}
