use std::{collections::HashMap, sync::Arc, time::Instant};

use {
    tokio::sync::{RwLock, mpsc},
    tracing::debug,
};

use {
    opsgate_channels::ChannelRegistry,
    opsgate_config::GatewaySection,
    opsgate_protocol::{ConnectParams, Frame},
};

use crate::{
    auth::Authenticator,
    events::{Event, EventKind, EventLog},
    history::HistoryRing,
    rate_limit::RateLimiter,
    stats::GatewayStats,
    subscriptions::SubscriptionIndex,
};

// ── Outbound queue ───────────────────────────────────────────────────────────

/// One item on a client's outbound queue.
#[derive(Debug)]
pub enum Outbound {
    /// A serialized frame to write as a text message.
    Frame(String),
    /// Close the socket with a status code, then stop writing.
    Close { code: u16, reason: String },
}

// ── Connected client ─────────────────────────────────────────────────────────

/// A WebSocket client currently connected to the gateway.
#[derive(Debug)]
pub struct ConnectedClient {
    pub conn_id: String,
    pub params: ConnectParams,
    pub remote_addr: String,
    /// Channel feeding this client's write loop.
    pub sender: mpsc::UnboundedSender<Outbound>,
    pub connected_at: Instant,
    pub last_activity: Instant,
    /// Set when a heartbeat ping has been sent and no pong has arrived yet.
    pub awaiting_pong: bool,
}

impl ConnectedClient {
    pub fn new(
        conn_id: &str,
        params: ConnectParams,
        remote_addr: String,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            conn_id: conn_id.to_string(),
            params,
            remote_addr,
            sender,
            connected_at: Instant::now(),
            last_activity: Instant::now(),
            awaiting_pong: false,
        }
    }

    pub fn role(&self) -> &str {
        self.params.role.as_deref().unwrap_or("user")
    }

    pub fn user_id(&self) -> Option<&str> {
        self.params.user_id.as_deref()
    }

    /// Queue a frame for this client. Returns false if the write loop is gone.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        self.sender.send(Outbound::Frame(frame.encode())).is_ok()
    }

    /// Ask the write loop to close the socket with a status code.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.sender
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .is_ok()
    }

    /// Touch the activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
///
/// All registries hang off this one value; nothing is ambient. Lock order:
/// `clients` → `subscriptions` → (`history` | `events`). The rate limiter
/// and channel registry use internal std locks and are never held across an
/// await.
pub struct GatewayState {
    /// All connected clients, keyed by conn_id.
    pub clients: RwLock<HashMap<String, ConnectedClient>>,
    /// Channel definitions, bootstrapped at startup.
    pub channels: ChannelRegistry,
    /// channel → subscriptions and connection → channels.
    pub subscriptions: RwLock<SubscriptionIndex>,
    /// Per-(connection, channel) sliding-window budgets.
    pub rate_limiter: RateLimiter,
    /// Recently published messages, for backfill.
    pub history: RwLock<HistoryRing>,
    /// Lifecycle event log.
    pub events: RwLock<EventLog>,
    pub stats: GatewayStats,
    pub authenticator: Arc<dyn Authenticator>,
    pub config: GatewaySection,
    pub version: String,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(config: GatewaySection, authenticator: Arc<dyn Authenticator>) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            channels: ChannelRegistry::bootstrap(),
            subscriptions: RwLock::new(SubscriptionIndex::new()),
            rate_limiter: RateLimiter::new(),
            history: RwLock::new(HistoryRing::new(config.history_max_entries)),
            events: RwLock::new(EventLog::new(config.event_log_max_entries)),
            stats: GatewayStats::default(),
            authenticator,
            config,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
        })
    }

    /// Register a new client. Returns false when the gateway is at capacity;
    /// the caller must close the transport with the capacity status code.
    pub async fn register_client(&self, client: ConnectedClient) -> bool {
        let mut clients = self.clients.write().await;
        if clients.len() >= self.config.max_connections {
            return false;
        }
        clients.insert(client.conn_id.clone(), client);
        true
    }

    /// Remove a client and all of its subscriptions.
    ///
    /// Safe to call more than once; only the first call does anything.
    pub async fn remove_client(&self, conn_id: &str, reason: &str) -> bool {
        let removed = self.clients.write().await.remove(conn_id);
        let Some(_client) = removed else {
            return false;
        };
        let dropped = self.subscriptions.write().await.remove_connection(conn_id);
        self.rate_limiter.forget_connection(conn_id);
        self.record_event(
            Event::new(EventKind::Disconnection)
                .conn(conn_id)
                .detail(reason),
        )
        .await;
        debug!(conn_id, reason, subscriptions = dropped, "client removed");
        true
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn client_role(&self, conn_id: &str) -> Option<String> {
        self.clients
            .read()
            .await
            .get(conn_id)
            .map(|c| c.role().to_string())
    }

    /// Best-effort event recording; never fails the calling operation.
    pub async fn record_event(&self, event: Event) {
        self.events.write().await.record(event);
    }
}
