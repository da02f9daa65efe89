//! Aggregate routing counters (no PII, no per-UAID data).

use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

/// Counter names, statsd style
pub mod names {
    /// Delivered straight to a connected client
    pub const BROADCAST_HIT: &str = "router.broadcast.hit";
    /// Delivered by the re-check after the notification was stored
    pub const BROADCAST_SAVE_HIT: &str = "router.broadcast.save_hit";
    /// Stored for later delivery
    pub const BROADCAST_MISS: &str = "router.broadcast.miss";
    /// Connection node did not answer
    pub const CLIENT_HOST_GONE: &str = "updates.client.host_gone";
    /// UAID vanished between save and re-check
    pub const CLIENT_DELETED: &str = "updates.client.deleted";
    pub const APNS_SENT: &str = "router.apns.sent";
    pub const APNS_RETRY: &str = "router.apns.retry";
    pub const GCM_SENT: &str = "router.gcm.sent";
}

/// Shared counter registry
#[derive(Clone, Default)]
pub struct Metrics {
    counters: Arc<DashMap<&'static str, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &'static str) {
        *self.counters.entry(name).or_insert(0) += 1;
        trace!(metric = name, "increment");
    }

    /// Current value of a counter (zero if never incremented)
    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }
}
