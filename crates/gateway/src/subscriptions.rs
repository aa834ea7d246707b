use std::collections::{HashMap, HashSet};

use serde_json::Value;

use {
    opsgate_channels::{Channel, ChannelRegistry},
    opsgate_protocol::{ErrorShape, error_codes, now_ms},
};

use crate::{events::EventKind, state::GatewayState};

// ── Subscription ─────────────────────────────────────────────────────────────

/// One connection's registered interest in one channel.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub conn_id: String,
    pub channel: String,
    /// Flat key → expected-value predicates over message payload fields.
    pub filters: Option<HashMap<String, Value>>,
    pub created_at: u64,
    pub last_message: Option<u64>,
    pub delivered: u64,
}

impl Subscription {
    fn new(conn_id: &str, channel: &str, filters: Option<HashMap<String, Value>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conn_id: conn_id.to_string(),
            channel: channel.to_string(),
            filters,
            created_at: now_ms(),
            last_message: None,
            delivered: 0,
        }
    }

    /// Exact-equality match of every filter predicate against the payload.
    /// A subscription without filters matches everything.
    pub fn matches(&self, payload: Option<&Value>) -> bool {
        let Some(filters) = &self.filters else {
            return true;
        };
        if filters.is_empty() {
            return true;
        }
        let Some(payload) = payload.and_then(Value::as_object) else {
            return false;
        };
        filters
            .iter()
            .all(|(key, expected)| payload.get(key) == Some(expected))
    }
}

// ── Access errors ────────────────────────────────────────────────────────────

/// Why a subscribe/publish/history request was denied.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("channel inactive: {0}")]
    ChannelInactive(String),
    #[error("Permission denied for channel: {0}")]
    PermissionDenied(String),
    #[error("rate limit exceeded for channel: {0}")]
    RateLimited(String),
    #[error("channel full: {0}")]
    ChannelFull(String),
}

impl AccessError {
    pub fn to_shape(&self) -> ErrorShape {
        let code = match self {
            Self::ChannelNotFound(_) | Self::ChannelInactive(_) => error_codes::NOT_FOUND,
            Self::PermissionDenied(_) => error_codes::PERMISSION_DENIED,
            Self::RateLimited(_) => error_codes::RATE_LIMITED,
            Self::ChannelFull(_) => error_codes::CAPACITY_EXCEEDED,
        };
        ErrorShape::new(code, self.to_string())
    }

    /// The event kind to record for this denial, if any.
    pub fn event_kind(&self) -> Option<EventKind> {
        match self {
            Self::PermissionDenied(_) => Some(EventKind::PermissionDenied),
            Self::RateLimited(_) => Some(EventKind::RateLimited),
            _ => None,
        }
    }
}

/// Steps shared by subscribe, publish, and history access: the channel must
/// exist, be active, and permit the caller's role.
pub fn check_channel_access(
    registry: &ChannelRegistry,
    name: &str,
    role: &str,
) -> Result<Channel, AccessError> {
    let channel = lookup_active(registry, name)?;
    if !channel.allows_role(role) {
        return Err(AccessError::PermissionDenied(name.to_string()));
    }
    Ok(channel)
}

/// Existence and activity checks only (system-originated publishes).
pub fn lookup_active(registry: &ChannelRegistry, name: &str) -> Result<Channel, AccessError> {
    let channel = registry
        .get(name)
        .ok_or_else(|| AccessError::ChannelNotFound(name.to_string()))?;
    if !channel.active {
        return Err(AccessError::ChannelInactive(name.to_string()));
    }
    Ok(channel)
}

// ── Index ────────────────────────────────────────────────────────────────────

/// Maps channel → subscriptions and connection → subscribed channels.
pub struct SubscriptionIndex {
    /// channel name → conn_id → Subscription
    by_channel: HashMap<String, HashMap<String, Subscription>>,
    /// conn_id → channel names (reverse lookup for disconnect cleanup)
    by_conn: HashMap<String, HashSet<String>>,
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self {
            by_channel: HashMap::new(),
            by_conn: HashMap::new(),
        }
    }

    /// Insert a subscription, replacing any existing one for the same
    /// (connection, channel) pair — last write wins for the filter.
    pub fn insert(&mut self, sub: Subscription) {
        self.by_conn
            .entry(sub.conn_id.clone())
            .or_default()
            .insert(sub.channel.clone());
        self.by_channel
            .entry(sub.channel.clone())
            .or_default()
            .insert(sub.conn_id.clone(), sub);
    }

    /// Remove one subscription. Returns it if it existed.
    pub fn remove(&mut self, conn_id: &str, channel: &str) -> Option<Subscription> {
        let subs = self.by_channel.get_mut(channel)?;
        let removed = subs.remove(conn_id);
        if subs.is_empty() {
            self.by_channel.remove(channel);
        }
        if let Some(channels) = self.by_conn.get_mut(conn_id) {
            channels.remove(channel);
            if channels.is_empty() {
                self.by_conn.remove(conn_id);
            }
        }
        removed
    }

    /// Remove every subscription belonging to a connection. Returns how many
    /// were dropped.
    pub fn remove_connection(&mut self, conn_id: &str) -> usize {
        let Some(channels) = self.by_conn.remove(conn_id) else {
            return 0;
        };
        let mut dropped = 0;
        for channel in channels {
            if let Some(subs) = self.by_channel.get_mut(&channel) {
                if subs.remove(conn_id).is_some() {
                    dropped += 1;
                }
                if subs.is_empty() {
                    self.by_channel.remove(&channel);
                }
            }
        }
        dropped
    }

    pub fn get(&self, conn_id: &str, channel: &str) -> Option<&Subscription> {
        self.by_channel.get(channel)?.get(conn_id)
    }

    /// Mutable view of a channel's subscriptions, for delivery bookkeeping.
    pub fn channel_mut(&mut self, channel: &str) -> Option<&mut HashMap<String, Subscription>> {
        self.by_channel.get_mut(channel)
    }

    pub fn subscribers_of(&self, channel: &str) -> Vec<&Subscription> {
        self.by_channel
            .get(channel)
            .map(|subs| subs.values().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.by_channel.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    pub fn for_conn(&self, conn_id: &str) -> Vec<&Subscription> {
        let Some(channels) = self.by_conn.get(conn_id) else {
            return Vec::new();
        };
        let mut subs: Vec<_> = channels
            .iter()
            .filter_map(|c| self.get(conn_id, c))
            .collect();
        subs.sort_by(|a, b| a.channel.cmp(&b.channel));
        subs
    }

    pub fn len(&self) -> usize {
        self.by_channel.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }
}

// ── Subscribe flow ───────────────────────────────────────────────────────────

/// Validate-then-mutate subscribe. Checks run in a fixed order: existence,
/// activity, permission, rate budget, capacity. The capacity check and the
/// insert happen under one write lock so concurrent subscribers can never
/// overshoot a channel's cap.
pub async fn subscribe(
    state: &GatewayState,
    conn_id: &str,
    role: &str,
    channel_name: &str,
    filters: Option<HashMap<String, Value>>,
) -> Result<Subscription, AccessError> {
    let channel = check_channel_access(&state.channels, channel_name, role)?;

    if !state.rate_limiter.check_and_consume(
        conn_id,
        channel_name,
        channel.messages_per_minute,
        channel.messages_per_hour,
    ) {
        return Err(AccessError::RateLimited(channel_name.to_string()));
    }

    let mut index = state.subscriptions.write().await;
    let already_subscribed = index.get(conn_id, channel_name).is_some();
    if !already_subscribed && index.subscriber_count(channel_name) >= channel.max_subscribers {
        return Err(AccessError::ChannelFull(channel_name.to_string()));
    }
    let sub = Subscription::new(conn_id, channel_name, filters);
    index.insert(sub.clone());
    Ok(sub)
}
