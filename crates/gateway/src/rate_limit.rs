use std::{
    collections::{HashMap, VecDeque},
    sync::RwLock,
    time::{Duration, Instant},
};

use tracing::debug;

const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const HOUR_WINDOW: Duration = Duration::from_secs(3600);

/// Per-(connection, channel) sliding-window rate limiter.
///
/// Two independent budgets are enforced over rolling windows: messages per
/// minute and messages per hour. An action is allowed only if both are
/// satisfied; an allowed action consumes from both windows at once. Denied
/// actions consume nothing, so a denial is never retroactively converted
/// into an allowance.
pub struct RateLimiter {
    state: RwLock<HashMap<(String, String), VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Check both budgets for `(conn_id, channel)` and consume one slot if
    /// allowed. Callers may only proceed with the throttled action on `true`.
    pub fn check_and_consume(
        &self,
        conn_id: &str,
        channel: &str,
        per_minute: u32,
        per_hour: u32,
    ) -> bool {
        self.check_and_consume_at(Instant::now(), conn_id, channel, per_minute, per_hour)
    }

    fn check_and_consume_at(
        &self,
        now: Instant,
        conn_id: &str,
        channel: &str,
        per_minute: u32,
        per_hour: u32,
    ) -> bool {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let stamps = state
            .entry((conn_id.to_string(), channel.to_string()))
            .or_default();

        // Timestamps are pushed in order, so expired entries sit at the front.
        while stamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= HOUR_WINDOW)
        {
            stamps.pop_front();
        }

        if stamps.len() >= per_hour as usize {
            debug!(conn_id, channel, per_hour, "hourly budget exhausted");
            return false;
        }

        let minute_count = stamps
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) < MINUTE_WINDOW)
            .count();
        if minute_count >= per_minute as usize {
            debug!(conn_id, channel, per_minute, "minute budget exhausted");
            return false;
        }

        stamps.push_back(now);
        true
    }

    /// Drop all windows belonging to a disconnected connection.
    pub fn forget_connection(&self, conn_id: &str) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.retain(|(conn, _), _| conn != conn_id);
    }

    pub fn tracked_keys(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_within_minute_budget() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..20 {
            assert!(limiter.check_and_consume_at(now, "c1", "backups", 20, 200));
        }
        assert!(!limiter.check_and_consume_at(now, "c1", "backups", 20, 200));
    }

    #[test]
    fn minute_window_slides() {
        let limiter = RateLimiter::new();
        let base = Instant::now();
        for _ in 0..5 {
            assert!(limiter.check_and_consume_at(base, "c1", "logs", 5, 100));
        }
        assert!(!limiter.check_and_consume_at(base, "c1", "logs", 5, 100));
        // Just past the minute window the budget frees up again.
        let later = base + Duration::from_secs(61);
        assert!(limiter.check_and_consume_at(later, "c1", "logs", 5, 100));
    }

    #[test]
    fn hourly_budget_is_independent() {
        let limiter = RateLimiter::new();
        let base = Instant::now();
        // 3 per hour, generous minute budget: the hour cap is what trips.
        assert!(limiter.check_and_consume_at(base, "c1", "m", 100, 3));
        assert!(limiter.check_and_consume_at(base + Duration::from_secs(120), "c1", "m", 100, 3));
        assert!(limiter.check_and_consume_at(base + Duration::from_secs(240), "c1", "m", 100, 3));
        assert!(!limiter.check_and_consume_at(base + Duration::from_secs(360), "c1", "m", 100, 3));
        // After the first stamp leaves the hour window, one slot frees.
        assert!(limiter.check_and_consume_at(base + Duration::from_secs(3601), "c1", "m", 100, 3));
    }

    #[test]
    fn budgets_are_per_connection_and_channel() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        assert!(limiter.check_and_consume_at(now, "c1", "logs", 1, 10));
        assert!(!limiter.check_and_consume_at(now, "c1", "logs", 1, 10));
        // Different connection, same channel.
        assert!(limiter.check_and_consume_at(now, "c2", "logs", 1, 10));
        // Same connection, different channel.
        assert!(limiter.check_and_consume_at(now, "c1", "metrics", 1, 10));
    }

    #[test]
    fn denied_actions_consume_nothing() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        assert!(limiter.check_and_consume_at(now, "c1", "m", 1, 1));
        // Repeated denials leave the single recorded stamp in place.
        for _ in 0..10 {
            assert!(!limiter.check_and_consume_at(now, "c1", "m", 1, 1));
        }
        assert!(limiter.check_and_consume_at(now + Duration::from_secs(3601), "c1", "m", 1, 1));
    }

    #[test]
    fn forget_connection_drops_all_channels() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        limiter.check_and_consume_at(now, "c1", "logs", 10, 10);
        limiter.check_and_consume_at(now, "c1", "metrics", 10, 10);
        limiter.check_and_consume_at(now, "c2", "logs", 10, 10);
        assert_eq!(limiter.tracked_keys(), 3);
        limiter.forget_connection("c1");
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
