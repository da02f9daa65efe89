//! Short-lived record of connection nodes that recently failed.
//!
//! Advisory only: a missing entry means "assume reachable", never
//! "confirmed reachable". Entries expire on their own; the cleanup task only
//! keeps memory tidy.

use dashmap::DashMap;
use reqwest::Url;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Normalize a node address into a cache key.
///
/// `http://Node:80/` and `http://node` map to the same key.
pub fn node_key(node_id: &str) -> String {
    match Url::parse(node_id) {
        Ok(url) if url.has_host() => {
            let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
            match url.port_or_known_default() {
                Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
                None => format!("{}://{}", url.scheme(), host),
            }
        }
        _ => node_id.trim().trim_end_matches('/').to_ascii_lowercase(),
    }
}

/// Process-wide dead-node cache, cheap to clone
#[derive(Clone)]
pub struct DeadNodeCache {
    /// node key -> expiry
    entries: Arc<DashMap<String, Instant>>,
    ttl: Duration,
    capacity: usize,
}

impl DeadNodeCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Mark a node as recently failed
    pub fn mark_dead(&self, node_id: &str) {
        let key = node_key(node_id);
        self.entries.insert(key, Instant::now() + self.ttl);

        if self.entries.len() > self.capacity {
            self.purge_expired();
        }
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| *entry.value())
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Whether a node failed within the TTL
    pub fn is_dead(&self, node_id: &str) -> bool {
        let key = node_key(node_id);
        let now = Instant::now();
        let dead = self
            .entries
            .get(&key)
            .map(|expires_at| *expires_at > now)
            .unwrap_or(false);
        if !dead {
            self.entries.remove_if(&key, |_, expires_at| *expires_at <= now);
        }
        dead
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start background sweep of expired entries
    pub fn start_cleanup_task(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();

        info!(
            interval_secs = interval.as_secs(),
            ttl_secs = self.ttl.as_secs(),
            "Started dead-node cleanup task"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!(removed, "Purged expired dead-node entries");
                }
            }
        })
    }
}
