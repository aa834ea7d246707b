use std::{collections::HashMap, sync::RwLock};

use {serde::Serialize, tracing::debug};

use opsgate_protocol::now_ms;

// ── Channel definition ───────────────────────────────────────────────────────

/// A named broadcast topic.
///
/// `name` is the unique key and immutable once created. `permissions` lists
/// the roles allowed to subscribe and publish. `retention_days` is advisory;
/// the history ring's entry cap is what bounds retention in practice.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub name: String,
    pub description: String,
    pub category: String,
    pub permissions: Vec<String>,
    pub messages_per_minute: u32,
    pub messages_per_hour: u32,
    pub max_subscribers: usize,
    pub retention_days: u32,
    pub active: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Channel {
    #[allow(clippy::too_many_arguments)]
    fn bootstrap(
        name: &str,
        description: &str,
        category: &str,
        permissions: &[&str],
        messages_per_minute: u32,
        messages_per_hour: u32,
        max_subscribers: usize,
        retention_days: u32,
    ) -> Self {
        let now = now_ms();
        Self {
            name: name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            messages_per_minute,
            messages_per_hour,
            max_subscribers,
            retention_days,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn allows_role(&self, role: &str) -> bool {
        self.permissions.iter().any(|p| p == role)
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("channel name already taken: {0}")]
    NameTaken(String),
}

/// In-process registry of channel definitions.
///
/// Read-mostly after bootstrap, so a single `RwLock` around the map is
/// sufficient. Accessors hand out clones; definitions are small.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Channel>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::bootstrap()
    }
}

impl ChannelRegistry {
    /// Empty registry, no bootstrap channels.
    pub fn empty() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Registry seeded with the five default channels.
    pub fn bootstrap() -> Self {
        let defaults = [
            Channel::bootstrap(
                "system",
                "Platform lifecycle and administrative announcements",
                "system",
                &["admin", "user"],
                60,
                1_000,
                100,
                7,
            ),
            Channel::bootstrap(
                "notifications",
                "User-facing notifications",
                "user",
                &["admin", "user"],
                30,
                500,
                200,
                7,
            ),
            Channel::bootstrap(
                "logs",
                "Service and provisioning log stream",
                "ops",
                &["admin"],
                120,
                5_000,
                50,
                3,
            ),
            Channel::bootstrap(
                "metrics",
                "Host and service metric samples",
                "ops",
                &["admin", "user"],
                60,
                2_000,
                100,
                1,
            ),
            Channel::bootstrap(
                "backups",
                "Backup job status updates",
                "ops",
                &["admin"],
                20,
                200,
                50,
                14,
            ),
        ];

        let mut map = HashMap::new();
        for channel in defaults {
            map.insert(channel.name.clone(), channel);
        }
        debug!(channels = map.len(), "bootstrapped channel registry");
        Self {
            channels: RwLock::new(map),
        }
    }

    pub fn get(&self, name: &str) -> Option<Channel> {
        self.read().get(name).cloned()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.read().get(name).map(|c| c.active).unwrap_or(false)
    }

    /// All channels, sorted by name for stable listings.
    pub fn list(&self) -> Vec<Channel> {
        let mut channels: Vec<_> = self.read().values().cloned().collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        channels
    }

    /// Add a channel administratively. Names are immutable and unique.
    pub fn insert(&self, channel: Channel) -> Result<(), RegistryError> {
        let mut channels = self.write();
        if channels.contains_key(&channel.name) {
            return Err(RegistryError::NameTaken(channel.name));
        }
        channels.insert(channel.name.clone(), channel);
        Ok(())
    }

    /// Mark a channel inactive. Returns false if the name is unknown.
    pub fn deactivate(&self, name: &str) -> bool {
        let mut channels = self.write();
        match channels.get_mut(name) {
            Some(c) => {
                c.active = false;
                c.updated_at = now_ms();
                true
            },
            None => false,
        }
    }

    /// Apply a partial override to an existing channel (from config).
    pub fn apply_override(
        &self,
        name: &str,
        f: impl FnOnce(&mut Channel),
    ) -> bool {
        let mut channels = self.write();
        match channels.get_mut(name) {
            Some(c) => {
                f(c);
                c.updated_at = now_ms();
                true
            },
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Channel>> {
        self.channels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Channel>> {
        self.channels
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
