use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a sync session.
///
/// Every section has serde defaults, so a partial document (or none at all)
/// deserializes into a usable config.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Who the current agent is (lives under `[agent]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent identity used as the conversation owner and as the author id of drafts.
    #[serde(default = "default_owner_id")]
    pub owner_id: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_market_id")]
    pub market_id: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            owner_id: default_owner_id(),
            display_name: default_display_name(),
            market_id: default_market_id(),
        }
    }
}

/// Persistence service settings (lives under `[gateway]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token sent with every request.
    #[serde(default)]
    pub token: Option<String>,
    /// Bounds connection establishment only; requests themselves have no timeout.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Real-time connection settings (lives under `[transport]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_transport_url")]
    pub url: String,
    /// Bounds the WebSocket handshake of each connection attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Give up after this many consecutive failed attempts (None = never).
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    /// Capacity of the inbound event and command channels.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: default_transport_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: None,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

fn default_owner_id() -> String {
    "agent".to_string()
}
fn default_display_name() -> String {
    "Support".to_string()
}
fn default_market_id() -> String {
    "default".to_string()
}
fn default_base_url() -> String {
    "http://127.0.0.1:8080/api".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_transport_url() -> String {
    "ws://127.0.0.1:8080/chat".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_reconnect_initial_ms() -> u64 {
    1000
}
fn default_reconnect_max_ms() -> u64 {
    60_000
}
fn default_channel_capacity() -> usize {
    256
}
