//! Wire protocol for the opsgate real-time gateway.
//!
//! Frames are JSON objects with camelCase fields. Every inbound text payload
//! must decode into exactly one [`Frame`]; anything else is a protocol error
//! and must not mutate gateway state.

use std::collections::HashMap;

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

pub const PROTOCOL_VERSION: u32 = 1;

/// Liveness heartbeat cadence.
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Default number of entries returned by `get_history`.
pub const HISTORY_DEFAULT_LIMIT: usize = 50;

/// Inbound frames larger than this are rejected without dispatch.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

// ── Close codes ──────────────────────────────────────────────────────────────

/// WebSocket close codes clients can branch on.
pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const AUTH_FAILED: u16 = 4001;
    pub const CAPACITY_EXCEEDED: u16 = 4002;
}

// ── Error codes ──────────────────────────────────────────────────────────────

/// Stable error codes carried in `error` frames.
pub mod error_codes {
    pub const PROTOCOL_ERROR: &str = "protocol_error";
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const CAPACITY_EXCEEDED: &str = "capacity_exceeded";
    pub const PERMISSION_DENIED: &str = "permission_denied";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const NOT_FOUND: &str = "not_found";
    pub const TRANSPORT_ERROR: &str = "transport_error";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Error payload carried in the `data` field of an `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ── Message types ────────────────────────────────────────────────────────────

/// The closed set of frame types.
///
/// `message` is the delivery shape for user publishes; the system-category
/// types (`system`, `log`, `metrics`, `backup`) are the delivery shapes for
/// gateway-originated publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Subscribe,
    Unsubscribe,
    Publish,
    Request,
    Response,
    Ping,
    Pong,
    Error,
    Notification,
    Message,
    Log,
    Metrics,
    Backup,
    System,
    GetChannels,
    GetSubscriptions,
    GetHistory,
}

impl MessageType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscribe" => Some(Self::Subscribe),
            "unsubscribe" => Some(Self::Unsubscribe),
            "publish" => Some(Self::Publish),
            "request" => Some(Self::Request),
            "response" => Some(Self::Response),
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            "error" => Some(Self::Error),
            "notification" => Some(Self::Notification),
            "message" => Some(Self::Message),
            "log" => Some(Self::Log),
            "metrics" => Some(Self::Metrics),
            "backup" => Some(Self::Backup),
            "system" => Some(Self::System),
            "get_channels" => Some(Self::GetChannels),
            "get_subscriptions" => Some(Self::GetSubscriptions),
            "get_history" => Some(Self::GetHistory),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Publish => "publish",
            Self::Request => "request",
            Self::Response => "response",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
            Self::Notification => "notification",
            Self::Message => "message",
            Self::Log => "log",
            Self::Metrics => "metrics",
            Self::Backup => "backup",
            Self::System => "system",
            Self::GetChannels => "get_channels",
            Self::GetSubscriptions => "get_subscriptions",
            Self::GetHistory => "get_history",
        }
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A single protocol frame, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to: Option<String>,
}

impl Frame {
    pub fn new(kind: MessageType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            channel: None,
            data: None,
            timestamp: now_ms(),
            from: None,
            to: None,
            filters: None,
            request_id: None,
            response_to: None,
        }
    }

    /// Success reply to the frame with id `response_to`.
    pub fn response(response_to: &str, data: Value) -> Self {
        let mut f = Self::new(MessageType::Response);
        f.response_to = Some(response_to.to_string());
        f.data = Some(data);
        f
    }

    /// Error reply. `response_to` is absent for frames that never parsed.
    pub fn error(response_to: Option<&str>, err: ErrorShape) -> Self {
        let mut f = Self::new(MessageType::Error);
        f.response_to = response_to.map(str::to_string);
        f.data = serde_json::to_value(err).ok();
        f
    }

    /// Server-originated notification (no channel attached).
    pub fn notification(data: Value) -> Self {
        let mut f = Self::new(MessageType::Notification);
        f.data = Some(data);
        f
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping)
    }

    pub fn pong(ping_id: &str) -> Self {
        let mut f = Self::new(MessageType::Pong);
        f.response_to = Some(ping_id.to_string());
        f
    }

    /// A message delivered to (and retained for) a channel's subscribers.
    pub fn channel_message(
        kind: MessageType,
        channel: &str,
        data: Value,
        from: Option<&str>,
    ) -> Self {
        let mut f = Self::new(kind);
        f.channel = Some(channel.to_string());
        f.data = Some(data);
        f.from = from.map(str::to_string);
        f
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Decode one inbound frame.
///
/// A payload decodes only if it is a JSON object carrying a recognized
/// `type` and a numeric `timestamp`. Unknown types are reported by name so
/// the caller can echo them back to the client.
pub fn decode(raw: &str) -> Result<Frame, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| DecodeError::Malformed("frame must be a JSON object".into()))?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing frame type".into()))?;
    if MessageType::parse(kind).is_none() {
        return Err(DecodeError::UnknownType(kind.to_string()));
    }
    if !obj.get("timestamp").map(Value::is_number).unwrap_or(false) {
        return Err(DecodeError::Malformed("missing timestamp".into()));
    }
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

// ── Connect handshake ────────────────────────────────────────────────────────

/// Identity parameters presented at connect time, from the query string.
///
/// Absence of both `token` and `userId` is an authentication failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl ConnectParams {
    pub fn has_identity(&self) -> bool {
        self.token.is_some() || self.user_id.is_some()
    }
}
