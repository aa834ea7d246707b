/// Config schema types for the gateway and per-channel overrides.
use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsgateConfig {
    pub gateway: GatewaySection,
    /// Partial overrides applied to bootstrap channels by name.
    pub channels: Vec<ChannelOverride>,
}

/// Gateway server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub bind: String,
    pub port: u16,

    /// Gateway-wide cap on concurrent connections.
    pub max_connections: usize,

    /// Liveness heartbeat cadence.
    pub heartbeat_interval_secs: u64,

    /// Total entries retained across all channel histories.
    pub history_max_entries: usize,

    /// Total entries retained in the lifecycle event log.
    pub event_log_max_entries: usize,

    /// Inbound frames larger than this are rejected without dispatch.
    pub max_frame_bytes: usize,

    /// Shared connect token. When set, clients must present it; env var
    /// `OPSGATE_TOKEN` takes precedence if both are set.
    pub token: Option<String>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18790,
            max_connections: 500,
            heartbeat_interval_secs: 30,
            history_max_entries: 1_000,
            event_log_max_entries: 10_000,
            max_frame_bytes: 256 * 1024,
            token: None,
        }
    }
}

/// Partial override for a bootstrap channel, matched by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOverride {
    pub name: String,
    pub messages_per_minute: Option<u32>,
    pub messages_per_hour: Option<u32>,
    pub max_subscribers: Option<usize>,
    pub permissions: Option<Vec<String>>,
    pub active: Option<bool>,
}
