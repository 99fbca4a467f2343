//! Process configuration. Loaded once at startup from a JSON file; every
//! recognized option is a field here and unknown keys fail the load.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Per-bucket admission limits for the rate limiter, in requests per minute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitConfig {
    pub action_per_minute: u32,
    pub chat_per_minute: u32,
    pub dm_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            action_per_minute: 30,
            chat_per_minute: 20,
            dm_per_minute: 60,
        }
    }
}

/// All startup options of the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    /// Listen address for the WebSocket endpoint.
    pub bind_addr: String,
    /// Hard cap on concurrently live (non-ended) sessions.
    pub max_sessions: usize,
    /// Turn deadline applied when the host does not choose one.
    pub default_turn_deadline_seconds: u64,
    pub rate_limits: RateLimitConfig,
    /// How long a dropped participant may rejoin seamlessly.
    pub reconnect_window_seconds: u64,
    pub ping_interval_seconds: u64,
    pub pong_timeout_seconds: u64,
    /// Budget for the first (auth) frame of a connection.
    pub auth_handshake_seconds: u64,
    /// Extra time granted when the acting player drops mid-turn.
    pub disconnect_grace_seconds: u64,
    /// Snapshot cadence: persist after this many accepted mutations.
    pub snapshot_every_mutations: u32,
    pub actor_inbox_capacity: usize,
    pub connection_queue_capacity: usize,
    /// Sessions with zero participants get disposed after this window.
    pub idle_session_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "127.0.0.1:8080".into(),
            max_sessions: 256,
            default_turn_deadline_seconds: 60,
            rate_limits: RateLimitConfig::default(),
            reconnect_window_seconds: 60,
            ping_interval_seconds: 30,
            pong_timeout_seconds: 10,
            auth_handshake_seconds: 5,
            disconnect_grace_seconds: 10,
            snapshot_every_mutations: 25,
            actor_inbox_capacity: 1024,
            connection_queue_capacity: 256,
            idle_session_seconds: 1200,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Loads the configuration from a JSON file. Missing fields fall back to
/// their defaults, unrecognized keys are a startup error.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let config = serde_json::from_str(&raw)?;
    Ok(config)
}
