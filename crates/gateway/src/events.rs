use std::collections::VecDeque;

use serde::Serialize;

use opsgate_protocol::now_ms;

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connection,
    Disconnection,
    Subscription,
    Unsubscription,
    Error,
    RateLimited,
    PermissionDenied,
}

/// An immutable audit record of one lifecycle transition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: u64,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            conn_id: None,
            channel: None,
            detail: None,
            timestamp: now_ms(),
        }
    }

    pub fn conn(mut self, conn_id: &str) -> Self {
        self.conn_id = Some(conn_id.to_string());
        self
    }

    pub fn channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ── Event log ────────────────────────────────────────────────────────────────

/// Append-only, size-bounded log of lifecycle events.
///
/// Recording always succeeds; once the cap is reached the oldest entries are
/// evicted. Logging must never fail or block the operation being logged.
pub struct EventLog {
    entries: VecDeque<Event>,
    max_entries: usize,
}

impl EventLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
        }
    }

    pub fn record(&mut self, event: Event) {
        while self.entries.len() >= self.max_entries && self.entries.pop_front().is_some() {}
        self.entries.push_back(event);
    }

    /// The newest `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }
}
