//! Storage collaborator contract and an in-memory reference backend.
//!
//! Routers only depend on [`Storage`]. The contract distinguishes two failure
//! kinds callers must classify: `CapacityExceeded` (transient, retry later)
//! and `NotFound` (the UAID no longer exists).

use crate::models::{keys, Notification, RouterData, RouterType, Uaid};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tracing::debug;

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("provisioned capacity exceeded")]
    CapacityExceeded,

    #[error("item not found")]
    NotFound,

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Durable per-UAID records and pending-notification queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    /// Queue a notification for later delivery.
    ///
    /// Returns `false` when an equal or newer version is already stored.
    async fn save_notification(
        &self,
        uaid: &str,
        notification: &Notification,
    ) -> Result<bool, StorageError>;

    /// Look up the complete record for a UAID.
    async fn get_uaid(&self, uaid: &str) -> Result<RouterData, StorageError>;

    /// Record that a client connected to `node_id`, replacing the record
    /// with a simplepush one.
    ///
    /// Only succeeds if no node is recorded or this connection is newer.
    async fn register_node(
        &self,
        uaid: &str,
        node_id: &str,
        connected_at: u64,
    ) -> Result<bool, StorageError>;

    /// Remove `node_id` from a record, only if it still names the same
    /// connection. Returns whether anything was cleared.
    async fn clear_node(&self, record: &RouterData) -> Result<bool, StorageError>;

    /// Persist a complete router record for a UAID.
    async fn update_router(
        &self,
        uaid: &str,
        router_type: RouterType,
        router_data: &RouterData,
    ) -> Result<(), StorageError>;
}

/// Thread-safe in-memory store
#[derive(Clone)]
pub struct MemoryStorage {
    /// UAID records (router type, node, bridged token)
    records: Arc<DashMap<Uaid, RouterData>>,

    /// Pending notifications per UAID, at most one per channel
    notifications: Arc<DashMap<Uaid, Vec<Notification>>>,

    /// Maximum pending channels per UAID before saves are refused
    max_pending_per_uaid: usize,
}

impl MemoryStorage {
    /// Create a new empty store
    pub fn new(max_pending_per_uaid: usize) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            notifications: Arc::new(DashMap::new()),
            max_pending_per_uaid,
        }
    }

    /// All pending notifications for a UAID
    pub fn fetch_notifications(&self, uaid: &str) -> Vec<Notification> {
        self.notifications
            .get(uaid)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_notification(
        &self,
        uaid: &str,
        notification: &Notification,
    ) -> Result<bool, StorageError> {
        let mut entry = self.notifications.entry(uaid.to_string()).or_default();
        let pending = entry.value_mut();

        if let Some(existing) = pending
            .iter_mut()
            .find(|n| n.channel_id == notification.channel_id)
        {
            // Integer versions only move forward
            if let (Some(stored), Some(incoming)) =
                (existing.version.as_int(), notification.version.as_int())
            {
                if stored >= incoming {
                    debug!(stored, incoming, "Newer version already stored");
                    return Ok(false);
                }
            }
            *existing = notification.clone();
            return Ok(true);
        }

        if pending.len() >= self.max_pending_per_uaid {
            return Err(StorageError::CapacityExceeded);
        }

        pending.push(notification.clone());
        Ok(true)
    }

    async fn get_uaid(&self, uaid: &str) -> Result<RouterData, StorageError> {
        self.records
            .get(uaid)
            .map(|entry| entry.value().clone())
            .ok_or(StorageError::NotFound)
    }

    async fn register_node(
        &self,
        uaid: &str,
        node_id: &str,
        connected_at: u64,
    ) -> Result<bool, StorageError> {
        let record = RouterData::new()
            .with(keys::UAID, uaid)
            .with(keys::ROUTER_TYPE, RouterType::SimplePush.as_str())
            .with(keys::NODE_ID, node_id)
            .with(keys::CONNECTED_AT, connected_at);

        match self.records.entry(uaid.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(record);
            }
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                let newer = match (existing.node_id(), existing.get_u64(keys::CONNECTED_AT)) {
                    (Some(_), Some(previous)) => previous < connected_at,
                    (Some(_), None) => false,
                    (None, _) => true,
                };
                if !newer {
                    return Ok(false);
                }
                entry.insert(record);
            }
        }
        Ok(true)
    }

    async fn clear_node(&self, record: &RouterData) -> Result<bool, StorageError> {
        let uaid = record
            .uaid()
            .ok_or_else(|| StorageError::Backend("record has no uaid".to_string()))?;

        let Some(mut entry) = self.records.get_mut(uaid) else {
            return Ok(false);
        };
        let stored = entry.value_mut();

        let same_connection = stored.node_id().is_some()
            && stored.node_id() == record.node_id()
            && stored.get_u64(keys::CONNECTED_AT) == record.get_u64(keys::CONNECTED_AT);
        if !same_connection {
            return Ok(false);
        }

        stored.remove(keys::NODE_ID);
        debug!("Cleared node from record");
        Ok(true)
    }

    async fn update_router(
        &self,
        uaid: &str,
        router_type: RouterType,
        router_data: &RouterData,
    ) -> Result<(), StorageError> {
        let mut record = router_data
            .clone()
            .with(keys::UAID, uaid)
            .with(keys::ROUTER_TYPE, router_type.as_str());

        // A simplepush record keeps whatever connection is live
        if router_type == RouterType::SimplePush {
            if let Some(existing) = self.records.get(uaid) {
                for key in [keys::NODE_ID, keys::CONNECTED_AT] {
                    if let Some(value) = existing.get(key) {
                        record.insert(key, value.clone());
                    }
                }
            }
        }

        self.records.insert(uaid.to_string(), record);
        Ok(())
    }
}
