use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};

/// Gateway-wide counters, surfaced via `/health` and the `request` handler.
#[derive(Debug, Default)]
pub struct GatewayStats {
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    broadcasts: AtomicU64,
    delivery_failures: AtomicU64,
    avg_dispatch_us: AtomicU64,
}

impl GatewayStats {
    pub fn record_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Exponential moving average (alpha = 0.2) of dispatch latency.
    pub fn record_dispatch_latency(&self, micros: u64) {
        let old = self.avg_dispatch_us.load(Ordering::Relaxed);
        let next = if old == 0 {
            micros
        } else {
            (old * 4 + micros) / 5
        };
        self.avg_dispatch_us.store(next, Ordering::Relaxed);
    }

    pub fn messages_out(&self) -> u64 {
        self.messages_out.load(Ordering::Relaxed)
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "messagesIn": self.messages_in.load(Ordering::Relaxed),
            "messagesOut": self.messages_out.load(Ordering::Relaxed),
            "broadcasts": self.broadcasts.load(Ordering::Relaxed),
            "deliveryFailures": self.delivery_failures.load(Ordering::Relaxed),
            "avgDispatchMicros": self.avg_dispatch_us.load(Ordering::Relaxed),
        })
    }
}
