//! Routing to clients held open by connection nodes.
//!
//! Delivery is attempted directly when the record names a node. Unless that
//! attempt delivers (200), the notification is stored first and the UAID is
//! looked up again, so a client that connected in the meantime is told to
//! pull it. A notification is never lost once we answer anything but 200.

use super::{Router, RouterError, RouterResponse};
use crate::dead_cache::DeadNodeCache;
use crate::metrics::{names, Metrics};
use crate::models::{Notification, RouterData};
use crate::node::NodeClient;
use crate::storage::{Storage, StorageError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one attempt against a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    /// Client got it (200)
    Delivered,
    /// Node accepted but client is not live (2xx)
    Accepted,
    /// Node did not answer or answered with an error
    Unreachable,
    /// Skipped, node failed recently
    KnownDead,
}

pub struct SimpleRouter {
    node: Arc<dyn NodeClient>,
    storage: Arc<dyn Storage>,
    dead_cache: DeadNodeCache,
    metrics: Metrics,
}

impl SimpleRouter {
    pub fn new(
        node: Arc<dyn NodeClient>,
        storage: Arc<dyn Storage>,
        dead_cache: DeadNodeCache,
        metrics: Metrics,
    ) -> Self {
        Self {
            node,
            storage,
            dead_cache,
            metrics,
        }
    }

    /// Push the notification itself, or with `None` ask the node to check storage.
    async fn attempt(&self, node_id: &str, uaid: &str, notification: Option<&Notification>) -> Attempt {
        if self.dead_cache.is_dead(node_id) {
            debug!(node_id, "Skipping node marked dead");
            return Attempt::KnownDead;
        }

        let result = match notification {
            Some(notification) => self.node.push(node_id, uaid, notification).await,
            None => self.node.check(node_id, uaid).await,
        };

        match result {
            Ok(200) => Attempt::Delivered,
            Ok(status) if (200..300).contains(&status) => Attempt::Accepted,
            Ok(status) => {
                warn!(node_id, status, "Node answered with an error");
                Attempt::Unreachable
            }
            Err(e) => {
                warn!(node_id, error = %e, "Could not route to node");
                Attempt::Unreachable
            }
        }
    }

    /// Forget a node that cannot take the notification.
    ///
    /// Best-effort: neither the cache write nor the clear can change the
    /// outcome of the routing call.
    async fn node_gone(&self, node_id: &str, record: &RouterData, attempt: Attempt) {
        if attempt == Attempt::Unreachable {
            self.metrics.increment(names::CLIENT_HOST_GONE);
            self.dead_cache.mark_dead(node_id);
        }
        match self.storage.clear_node(record).await {
            Ok(cleared) => debug!(cleared, "Cleared node after failed delivery"),
            Err(e) => debug!(error = %e, "Ignoring clear_node failure"),
        }
    }

    fn stored(&self) -> RouterResponse {
        self.metrics.increment(names::BROADCAST_MISS);
        RouterResponse::stored()
    }
}

#[async_trait]
impl Router for SimpleRouter {
    /// Connection nodes register clients themselves; nothing to validate.
    fn register(&self, _uaid: &str, _router_input: &RouterData) -> Result<RouterData, RouterError> {
        Ok(RouterData::new())
    }

    async fn route_notification(
        &self,
        notification: &Notification,
        router_data: &RouterData,
    ) -> Result<RouterResponse, RouterError> {
        let uaid = router_data
            .uaid()
            .ok_or_else(|| RouterError::internal("router data has no uaid"))?;

        if let Some(node_id) = router_data.node_id() {
            match self.attempt(node_id, uaid, Some(notification)).await {
                Attempt::Delivered => {
                    self.metrics.increment(names::BROADCAST_HIT);
                    return Ok(RouterResponse::delivered());
                }
                Attempt::Accepted => debug!(node_id, "Client not live, storing"),
                gone => self.node_gone(node_id, router_data, gone).await,
            }
        }

        match self.storage.save_notification(uaid, notification).await {
            Ok(true) => {}
            Ok(false) => debug!("Newer version already stored"),
            Err(StorageError::CapacityExceeded) => {
                return Err(RouterError::unavailable("Provisioned throughput error"));
            }
            Err(e) => return Err(e.into()),
        }

        // Stored; see whether the client turned up somewhere meanwhile
        let record = match self.storage.get_uaid(uaid).await {
            Ok(record) => record,
            Err(StorageError::CapacityExceeded) => return Ok(self.stored()),
            Err(StorageError::NotFound) => {
                self.metrics.increment(names::CLIENT_DELETED);
                return Err(RouterError::not_found("User was deleted"));
            }
            Err(e) => return Err(e.into()),
        };

        let Some(node_id) = record.node_id() else {
            return Ok(self.stored());
        };

        match self.attempt(node_id, uaid, None).await {
            Attempt::Delivered => {
                self.metrics.increment(names::BROADCAST_SAVE_HIT);
                Ok(RouterResponse::delivered())
            }
            Attempt::Accepted => Ok(self.stored()),
            gone => {
                self.node_gone(node_id, &record, gone).await;
                Ok(self.stored())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{keys, Version};
    use crate::node::{MockNodeClient, NodeError};
    use crate::storage::MockStorage;
    use std::time::Duration;

    const UAID: &str = "deadbeef00000000decafbad00000000";
    const NODE: &str = "http://somewhere";

    fn notif() -> Notification {
        Notification::new("chid", Version::Int(10), Some("data".into()))
    }

    fn with_node() -> RouterData {
        RouterData::new()
            .with(keys::UAID, UAID)
            .with(keys::NODE_ID, NODE)
            .with(keys::CONNECTED_AT, 1000)
    }

    fn without_node() -> RouterData {
        RouterData::new().with(keys::UAID, UAID)
    }

    fn connect_error() -> NodeError {
        NodeError::Connect("connection refused".into())
    }

    struct Harness {
        router: SimpleRouter,
        dead_cache: DeadNodeCache,
        metrics: Metrics,
    }

    fn harness(node: MockNodeClient, storage: MockStorage) -> Harness {
        let dead_cache = DeadNodeCache::new(Duration::from_secs(60), 10);
        let metrics = Metrics::new();
        Harness {
            router: SimpleRouter::new(
                Arc::new(node),
                Arc::new(storage),
                dead_cache.clone(),
                metrics.clone(),
            ),
            dead_cache,
            metrics,
        }
    }

    #[test]
    fn register_returns_empty_record() {
        let h = harness(MockNodeClient::new(), MockStorage::new());
        assert_eq!(h.router.register("uaid", &RouterData::new()), Ok(RouterData::new()));
        assert_eq!(
            h.router.register("uaid", &RouterData::new()),
            h.router.register("uaid", &RouterData::new())
        );
    }

    #[tokio::test]
    async fn route_to_connected_client() {
        let mut node = MockNodeClient::new();
        node.expect_push()
            .withf(|node_id, uaid, _| node_id == NODE && uaid == UAID)
            .times(1)
            .returning(|_, _, _| Ok(200));
        // No storage expectations: any storage call fails the test
        let h = harness(node, MockStorage::new());

        let response = h.router.route_notification(&notif(), &with_node()).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.router_data, None);
        assert_eq!(h.metrics.get(names::BROADCAST_HIT), 1);
    }

    #[tokio::test]
    async fn route_to_busy_node_saves_before_answering() {
        let mut node = MockNodeClient::new();
        node.expect_push().times(1).returning(|_, _, _| Ok(202));
        let mut storage = MockStorage::new();
        storage
            .expect_save_notification()
            .withf(|uaid, n| uaid == UAID && n.channel_id == "chid")
            .times(1)
            .returning(|_, _| Ok(true));
        storage
            .expect_get_uaid()
            .times(1)
            .returning(|_| Ok(without_node()));
        let h = harness(node, storage);

        let response = h.router.route_notification(&notif(), &with_node()).await.unwrap();
        assert_eq!(response.status_code, 202);
        assert_eq!(h.metrics.get(names::BROADCAST_MISS), 1);
    }

    #[tokio::test]
    async fn route_to_busy_node_with_old_version_still_stored() {
        let mut node = MockNodeClient::new();
        node.expect_push().returning(|_, _, _| Ok(202));
        let mut storage = MockStorage::new();
        storage.expect_save_notification().returning(|_, _| Ok(false));
        storage.expect_get_uaid().returning(|_| Ok(without_node()));
        let h = harness(node, storage);

        let response = h.router.route_notification(&notif(), &with_node()).await.unwrap();
        assert_eq!(response.status_code, 202);
    }

    #[tokio::test]
    async fn route_to_busy_node_save_capacity_exceeded() {
        let mut node = MockNodeClient::new();
        node.expect_push().returning(|_, _, _| Ok(202));
        let mut storage = MockStorage::new();
        storage
            .expect_save_notification()
            .times(1)
            .returning(|_, _| Err(StorageError::CapacityExceeded));
        storage.expect_get_uaid().never();
        let h = harness(node, storage);

        let err = h.router.route_notification(&notif(), &with_node()).await.unwrap_err();
        assert_eq!(err.status_code, 503);
    }

    #[tokio::test]
    async fn route_connect_error_falls_back_to_storage() {
        let mut node = MockNodeClient::new();
        node.expect_push().times(1).returning(|_, _, _| Err(connect_error()));
        let mut storage = MockStorage::new();
        storage
            .expect_clear_node()
            .withf(|record| record.node_id() == Some(NODE))
            .times(1)
            .returning(|_| Ok(true));
        storage.expect_save_notification().times(1).returning(|_, _| Ok(true));
        storage.expect_get_uaid().times(1).returning(|_| Ok(without_node()));
        let h = harness(node, storage);

        let response = h.router.route_notification(&notif(), &with_node()).await.unwrap();
        assert_eq!(response.status_code, 202);
        assert!(h.dead_cache.is_dead(NODE));
        assert_eq!(h.metrics.get(names::CLIENT_HOST_GONE), 1);
    }

    #[tokio::test]
    async fn route_error_status_treated_as_dead_node() {
        let mut node = MockNodeClient::new();
        node.expect_push().times(1).returning(|_, _, _| Ok(500));
        let mut storage = MockStorage::new();
        storage
            .expect_clear_node()
            .times(1)
            .returning(|_| Err(StorageError::CapacityExceeded));
        storage.expect_save_notification().returning(|_, _| Ok(true));
        storage.expect_get_uaid().returning(|_| Ok(without_node()));
        let h = harness(node, storage);

        let response = h.router.route_notification(&notif(), &with_node()).await.unwrap();
        assert_eq!(response.status_code, 202);
        assert!(h.dead_cache.is_dead(NODE));
    }

    #[tokio::test]
    async fn route_skips_node_already_marked_dead() {
        let mut node = MockNodeClient::new();
        node.expect_push().never();
        let mut storage = MockStorage::new();
        storage.expect_clear_node().times(1).returning(|_| Ok(true));
        storage.expect_save_notification().times(1).returning(|_, _| Ok(true));
        storage.expect_get_uaid().returning(|_| Ok(without_node()));
        let h = harness(node, storage);
        h.dead_cache.mark_dead(NODE);

        let response = h.router.route_notification(&notif(), &with_node()).await.unwrap();
        assert_eq!(response.status_code, 202);
        assert_eq!(h.metrics.get(names::CLIENT_HOST_GONE), 0);
    }

    #[tokio::test]
    async fn route_with_no_node_saves_and_lookup_capacity_exceeded() {
        let mut storage = MockStorage::new();
        storage.expect_save_notification().times(1).returning(|_, _| Ok(true));
        storage
            .expect_get_uaid()
            .times(1)
            .returning(|_| Err(StorageError::CapacityExceeded));
        let h = harness(MockNodeClient::new(), storage);

        let response = h.router.route_notification(&notif(), &without_node()).await.unwrap();
        assert_eq!(response.status_code, 202);
    }

    #[tokio::test]
    async fn route_with_no_node_saves_and_lookup_not_found() {
        let mut storage = MockStorage::new();
        storage.expect_save_notification().times(1).returning(|_, _| Ok(true));
        storage
            .expect_get_uaid()
            .times(1)
            .returning(|_| Err(StorageError::NotFound));
        let h = harness(MockNodeClient::new(), storage);

        let err = h.router.route_notification(&notif(), &without_node()).await.unwrap_err();
        assert_eq!(err.status_code, 404);
        assert_eq!(h.metrics.get(names::CLIENT_DELETED), 1);
    }

    #[tokio::test]
    async fn route_with_no_node_recheck_fails_marks_dead_and_clears() {
        let mut node = MockNodeClient::new();
        node.expect_push().never();
        node.expect_check()
            .withf(|node_id, uaid| node_id == NODE && uaid == UAID)
            .times(1)
            .returning(|_, _| Err(connect_error()));
        let mut storage = MockStorage::new();
        storage.expect_save_notification().times(1).returning(|_, _| Ok(true));
        storage.expect_get_uaid().times(1).returning(|_| Ok(with_node()));
        storage.expect_clear_node().times(1).returning(|_| Ok(true));
        let h = harness(node, storage);

        let response = h.router.route_notification(&notif(), &without_node()).await.unwrap();
        assert_eq!(response.status_code, 202);
        assert!(h.dead_cache.is_dead(NODE));
    }

    #[tokio::test]
    async fn route_recheck_clear_failure_is_ignored() {
        let mut node = MockNodeClient::new();
        node.expect_push().times(1).returning(|_, _, _| Ok(202));
        node.expect_check().times(1).returning(|_, _| Err(connect_error()));
        let mut storage = MockStorage::new();
        storage.expect_save_notification().returning(|_, _| Ok(true));
        storage.expect_get_uaid().returning(|_| Ok(with_node()));
        storage
            .expect_clear_node()
            .times(1)
            .returning(|_| Err(StorageError::CapacityExceeded));
        let h = harness(node, storage);

        let response = h.router.route_notification(&notif(), &with_node()).await.unwrap();
        assert_eq!(response.status_code, 202);
        assert!(h.dead_cache.is_dead(NODE));
    }

    #[tokio::test]
    async fn route_recheck_accepted_is_stored() {
        let mut node = MockNodeClient::new();
        node.expect_push().times(1).returning(|_, _, _| Ok(202));
        node.expect_check().times(1).returning(|_, _| Ok(202));
        let mut storage = MockStorage::new();
        storage.expect_save_notification().returning(|_, _| Ok(true));
        storage.expect_get_uaid().times(1).returning(|_| Ok(with_node()));
        let h = harness(node, storage);

        let response = h.router.route_notification(&notif(), &with_node()).await.unwrap();
        assert_eq!(response.status_code, 202);
        assert_eq!(h.metrics.get(names::BROADCAST_SAVE_HIT), 0);
    }

    #[tokio::test]
    async fn route_recheck_delivers_counts_one_save_hit() {
        let mut node = MockNodeClient::new();
        node.expect_push().times(1).returning(|_, _, _| Ok(202));
        node.expect_check().times(1).returning(|_, _| Ok(200));
        let mut storage = MockStorage::new();
        storage.expect_save_notification().times(1).returning(|_, _| Ok(true));
        storage.expect_get_uaid().times(1).returning(|_| Ok(with_node()));
        let h = harness(node, storage);

        let response = h.router.route_notification(&notif(), &with_node()).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(h.metrics.get(names::BROADCAST_SAVE_HIT), 1);
        assert_eq!(h.metrics.get(names::BROADCAST_HIT), 0);
    }

    #[tokio::test]
    async fn route_without_uaid_is_internal_error() {
        let h = harness(MockNodeClient::new(), MockStorage::new());
        let err = h
            .router
            .route_notification(&notif(), &RouterData::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code, 500);
    }

    #[tokio::test]
    async fn unclassified_storage_failure_is_wrapped() {
        let mut storage = MockStorage::new();
        storage
            .expect_save_notification()
            .returning(|_, _| Err(StorageError::Backend("disk on fire".into())));
        let h = harness(MockNodeClient::new(), storage);

        let err = h.router.route_notification(&notif(), &without_node()).await.unwrap_err();
        assert_eq!(err.status_code, 500);
    }
}
