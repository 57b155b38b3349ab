//! Observability counters shared by the dispatcher and the session manager.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Monotonic event counters. Cheap to bump from any task.
        #[derive(Debug, Default)]
        pub struct Counters {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`Counters`].
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct CounterSnapshot {
            $(pub $name: u64,)*
        }

        impl Counters {
            pub fn snapshot(&self) -> CounterSnapshot {
                CounterSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    frames_received,
    frames_sent,
    /// Frames that failed to parse
    malformed_frames,
    /// Frames from a link the registry no longer knows
    unregistered_frames,
    /// Frames rejected by an exhausted budget
    rate_limited,
    oversized,
    forwarded,
    /// Messages dropped because their hop budget ran out
    ttl_expired,
    no_route,
    send_failures,
    requests_sent,
    requests_received,
    responses_sent,
    responses_received,
    acks_sent,
    acks_received,
    /// Requests left unanswered by the responder-side limiter
    responses_suppressed,
    retries,
    sessions_completed,
    sessions_timed_out,
    sessions_failed,
    /// Late or duplicate responses for unknown or terminal sessions
    duplicate_responses,
    /// Responses from the wrong peer or with a wrong echo
    anomalous_responses,
    peers_banned,
    /// PoR-capable peers dropped after staying silent past `idle_timeout`
    idle_disconnects,
}

impl Counters {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
