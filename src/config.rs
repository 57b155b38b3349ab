//! Node configuration.
//!
//! Loaded from a JSON file shaped like the cluster tests write it:
//!
//! ```json
//! { "network": { "por_enabled": true, "por": { "request_timeout_ms": 1000 } } }
//! ```
//!
//! Every field has a default, so a partial file is always valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default listen port
pub const DEFAULT_PORT: u16 = 24567;

/// Default hop budget for routed messages
pub const DEFAULT_ROUTED_MESSAGE_TTL: u8 = 100;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.network.validate()?;
        Ok(config)
    }
}

/// Peer networking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub listen_port: u16,
    pub data_dir: PathBuf,
    /// `ip:port` addresses dialed on startup and whenever we fall below the ideal peer count
    pub boot_nodes: Vec<String>,
    /// Run the Proof-of-Response protocol
    pub por_enabled: bool,
    pub por: PorConfig,
    /// Hop budget stamped on every routed message we originate
    pub routed_message_ttl: u8,
    /// How long a learned route-back path stays usable
    pub route_back_ttl_ms: u64,
    pub route_back_cache_size: usize,
    pub rate_limit: RateLimitConfig,
    pub ideal_connections_lo: usize,
    pub ideal_connections_hi: usize,
    pub minimum_outbound_peers: usize,
    pub max_num_peers: usize,
    pub safe_set_size: usize,
    pub handshake_timeout_ms: u64,
    pub peer_states_cache_size: usize,
    pub peer_states_ttl_ms: u64,
    /// Dialer wake-up period for reconnecting to boot nodes and known peers
    pub reconnect_interval_ms: u64,
    /// A PoR-capable peer silent this long is disconnected. 0 disables.
    pub idle_timeout_ms: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            data_dir: PathBuf::from("data"),
            boot_nodes: vec![],
            por_enabled: false,
            por: PorConfig::default(),
            routed_message_ttl: DEFAULT_ROUTED_MESSAGE_TTL,
            route_back_ttl_ms: 300_000,
            route_back_cache_size: 10_000,
            rate_limit: RateLimitConfig::default(),
            ideal_connections_lo: 30,
            ideal_connections_hi: 35,
            minimum_outbound_peers: 5,
            max_num_peers: 40,
            safe_set_size: 20,
            handshake_timeout_ms: 20_000,
            peer_states_cache_size: 1_000,
            peer_states_ttl_ms: 3_600_000,
            reconnect_interval_ms: 5_000,
            idle_timeout_ms: 300_000,
        }
    }
}

impl NetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routed_message_ttl == 0 {
            return Err(ConfigError::Invalid("routed_message_ttl must be positive".into()));
        }
        if self.por.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("por.request_timeout_ms must be positive".into()));
        }
        if self.por.check_interval_ms == 0 {
            return Err(ConfigError::Invalid("por.check_interval_ms must be positive".into()));
        }
        if self.route_back_cache_size == 0 || self.peer_states_cache_size == 0 {
            return Err(ConfigError::Invalid("cache sizes must be positive".into()));
        }
        if self.ideal_connections_lo > self.ideal_connections_hi {
            return Err(ConfigError::Invalid(format!(
                "ideal_connections_lo ({}) exceeds ideal_connections_hi ({})",
                self.ideal_connections_lo, self.ideal_connections_hi
            )));
        }
        if self.idle_timeout_ms != 0 && self.idle_timeout_ms <= self.por.check_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "idle_timeout_ms ({}) must exceed por.check_interval_ms ({})",
                self.idle_timeout_ms, self.por.check_interval_ms
            )));
        }
        if self.rate_limit.max_message_size == 0 {
            return Err(ConfigError::Invalid("rate_limit.max_message_size must be positive".into()));
        }
        Ok(())
    }

    pub fn route_back_ttl(&self) -> Duration {
        Duration::from_millis(self.route_back_ttl_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn peer_states_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_states_ttl_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// Proof-of-Response session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PorConfig {
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    /// A peer with a completed check younger than this is not checked again
    pub check_interval_ms: u64,
    /// Opaque bytes carried in requests and echoed back
    pub check_payload: String,
    /// Terminal sessions kept for diagnostics
    pub session_retention: usize,
    pub session_retention_ms: u64,
}

impl Default for PorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 1_000,
            max_retries: 2,
            check_interval_ms: 10_000,
            check_payload: "hello".into(),
            session_retention: 256,
            session_retention_ms: 60_000,
        }
    }
}

impl PorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn session_retention_window(&self) -> Duration {
        Duration::from_millis(self.session_retention_ms)
    }
}

/// Admission ceilings for inbound and outbound protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub messages_per_second: u32,
    pub messages_per_minute: u32,
    pub global_messages_per_second: u32,
    pub global_messages_per_minute: u32,
    pub max_message_size: usize,
    /// Rejections per minute before a peer is flagged for a ban
    pub violation_threshold: u32,
    pub ban_window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_per_second: 50,
            messages_per_minute: 1_200,
            global_messages_per_second: 1_000,
            global_messages_per_minute: 30_000,
            max_message_size: 512 * 1024,
            violation_threshold: 100,
            ban_window_ms: 600_000,
        }
    }
}

impl RateLimitConfig {
    pub fn ban_window(&self) -> Duration {
        Duration::from_millis(self.ban_window_ms)
    }
}
