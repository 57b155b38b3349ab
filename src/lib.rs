//! Proof-of-Response (PoR): a peer liveness protocol over a routed,
//! rate-limited peer network.
//!
//! A node asks a peer to echo a nonce and payload back. The exchange may
//! cross intermediate peers using learned route-back paths, bounded by a
//! per-message hop budget. Completed, timed-out and failed checks are
//! published as [`PorEvent`]s.

pub mod config;
pub mod identity;
pub mod net;
pub mod node;
pub mod por;
pub mod scheduler;
pub mod types;

pub use config::{Config, ConfigError, NetConfig, PorConfig, RateLimitConfig};
pub use net::{spawn_node, MemoryHub, TcpNode};
pub use node::PorNode;
pub use por::{FailureReason, PorError, PorEvent, SessionHandle, SessionManager, SessionState};
pub use types::{Direction, Nonce, PeerId};
