//! SimpleRouter against real HTTP connection nodes.
//!
//! A fake node is served by axum on an ephemeral port; a closed port stands
//! in for a node that went away.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::put,
    Json,
};
use parking_lot::Mutex;
use push_relay::{
    dead_cache::DeadNodeCache,
    metrics::{names, Metrics},
    models::{Notification, Version},
    node::HttpNodeClient,
    router::{Router, SimpleRouter},
    MemoryStorage, Storage,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const UAID: &str = "deadbeef00000000decafbad00000000";

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Push(String, Value),
    Check(String),
}

struct FakeNode {
    push_status: StatusCode,
    check_status: StatusCode,
    calls: Mutex<Vec<Call>>,
}

async fn node_push(
    State(node): State<Arc<FakeNode>>,
    Path(uaid): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    node.calls.lock().push(Call::Push(uaid, body));
    node.push_status
}

async fn node_check(State(node): State<Arc<FakeNode>>, Path(uaid): Path<String>) -> StatusCode {
    node.calls.lock().push(Call::Check(uaid));
    node.check_status
}

/// Serve a fake node, returning its node id and call log
async fn spawn_node(push_status: StatusCode, check_status: StatusCode) -> (String, Arc<FakeNode>) {
    let node = Arc::new(FakeNode {
        push_status,
        check_status,
        calls: Mutex::new(Vec::new()),
    });
    let app = axum::Router::new()
        .route("/push/:uaid", put(node_push))
        .route("/notif/:uaid", put(node_check))
        .with_state(node.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), node)
}

/// Node id for a port nothing listens on
async fn closed_node() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

struct Harness {
    router: SimpleRouter,
    storage: MemoryStorage,
    dead_cache: DeadNodeCache,
    metrics: Metrics,
}

fn harness() -> Harness {
    let storage = MemoryStorage::new(10);
    let dead_cache = DeadNodeCache::new(Duration::from_secs(60), 10);
    let metrics = Metrics::new();
    let router = SimpleRouter::new(
        Arc::new(HttpNodeClient::new(Duration::from_secs(2)).unwrap()),
        Arc::new(storage.clone()),
        dead_cache.clone(),
        metrics.clone(),
    );
    Harness {
        router,
        storage,
        dead_cache,
        metrics,
    }
}

fn notif() -> Notification {
    Notification::new("chid", Version::Int(10), Some("data".into()))
}

#[tokio::test]
async fn live_client_is_delivered_directly() {
    let (node_id, node) = spawn_node(StatusCode::OK, StatusCode::OK).await;
    let h = harness();
    assert!(h.storage.register_node(UAID, &node_id, 1).await.unwrap());
    let record = h.storage.get_uaid(UAID).await.unwrap();

    let response = h.router.route_notification(&notif(), &record).await.unwrap();

    assert_eq!(response.status_code, 200);
    assert!(h.storage.fetch_notifications(UAID).is_empty());
    assert_eq!(h.metrics.get(names::BROADCAST_HIT), 1);
    assert_eq!(
        *node.calls.lock(),
        vec![Call::Push(
            UAID.to_string(),
            json!([{"channelID": "chid", "version": 10, "data": "data"}])
        )]
    );
}

#[tokio::test]
async fn busy_node_pulls_from_storage() {
    let (node_id, node) = spawn_node(StatusCode::ACCEPTED, StatusCode::OK).await;
    let h = harness();
    h.storage.register_node(UAID, &node_id, 1).await.unwrap();
    let record = h.storage.get_uaid(UAID).await.unwrap();

    let response = h.router.route_notification(&notif(), &record).await.unwrap();

    assert_eq!(response.status_code, 200);
    assert_eq!(h.storage.fetch_notifications(UAID).len(), 1);
    assert_eq!(h.metrics.get(names::BROADCAST_SAVE_HIT), 1);
    assert_eq!(h.metrics.get(names::BROADCAST_HIT), 0);

    let calls = node.calls.lock().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1], Call::Check(UAID.to_string()));
}

#[tokio::test]
async fn busy_node_without_client_stores() {
    let (node_id, _node) = spawn_node(StatusCode::ACCEPTED, StatusCode::ACCEPTED).await;
    let h = harness();
    h.storage.register_node(UAID, &node_id, 1).await.unwrap();
    let record = h.storage.get_uaid(UAID).await.unwrap();

    let response = h.router.route_notification(&notif(), &record).await.unwrap();

    assert_eq!(response.status_code, 202);
    assert_eq!(h.metrics.get(names::BROADCAST_MISS), 1);
    assert!(!h.dead_cache.is_dead(&node_id));
}

#[tokio::test]
async fn failing_node_is_marked_dead() {
    let (node_id, _node) = spawn_node(StatusCode::INTERNAL_SERVER_ERROR, StatusCode::OK).await;
    let h = harness();
    h.storage.register_node(UAID, &node_id, 1).await.unwrap();
    let record = h.storage.get_uaid(UAID).await.unwrap();

    let response = h.router.route_notification(&notif(), &record).await.unwrap();

    assert_eq!(response.status_code, 202);
    assert!(h.dead_cache.is_dead(&node_id));
    assert_eq!(h.metrics.get(names::CLIENT_HOST_GONE), 1);
    let record = h.storage.get_uaid(UAID).await.unwrap();
    assert_eq!(record.node_id(), None);
}

#[tokio::test]
async fn unreachable_node_falls_back_to_storage() {
    let node_id = closed_node().await;
    let h = harness();
    h.storage.register_node(UAID, &node_id, 1).await.unwrap();
    let record = h.storage.get_uaid(UAID).await.unwrap();

    let response = h.router.route_notification(&notif(), &record).await.unwrap();

    assert_eq!(response.status_code, 202);
    assert_eq!(h.storage.fetch_notifications(UAID).len(), 1);
    assert!(h.dead_cache.is_dead(&node_id));
    assert_eq!(h.metrics.get(names::CLIENT_HOST_GONE), 1);

    let record = h.storage.get_uaid(UAID).await.unwrap();
    assert_eq!(record.node_id(), None);
}

#[tokio::test]
async fn dead_node_is_not_contacted_again() {
    let (node_id, node) = spawn_node(StatusCode::OK, StatusCode::OK).await;
    let h = harness();
    h.dead_cache.mark_dead(&node_id);
    h.storage.register_node(UAID, &node_id, 1).await.unwrap();
    let record = h.storage.get_uaid(UAID).await.unwrap();

    let response = h.router.route_notification(&notif(), &record).await.unwrap();

    assert_eq!(response.status_code, 202);
    assert!(node.calls.lock().is_empty());
    assert_eq!(h.metrics.get(names::CLIENT_HOST_GONE), 0);
}

#[tokio::test]
async fn newer_connection_survives_stale_clear() {
    let node_id = closed_node().await;
    let h = harness();
    h.storage.register_node(UAID, &node_id, 1).await.unwrap();
    let stale = h.storage.get_uaid(UAID).await.unwrap();

    // Client reconnects elsewhere before the stale route finishes
    let (live_id, _node) = spawn_node(StatusCode::ACCEPTED, StatusCode::ACCEPTED).await;
    assert!(h.storage.register_node(UAID, &live_id, 2).await.unwrap());

    h.router.route_notification(&notif(), &stale).await.unwrap();

    let record = h.storage.get_uaid(UAID).await.unwrap();
    assert_eq!(record.node_id(), Some(live_id.as_str()));
}
