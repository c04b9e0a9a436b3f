//! Integration tests for the HTTP surface over a running pool.

#![allow(clippy::unwrap_used)]

use crate::mock_infrastructure::{mock_pool, wait_for_active, wait_until, TEST_CHAIN};
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use meridian_core::pool::PoolConfig;
use serde_json::Value;
use server::router::{create_router, AppState};
use tower::ServiceExt;

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_endpoints_over_running_pool() {
    let (pool, clients) =
        mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100), ("b", 1, 100)]).unwrap();
    pool.start().unwrap();
    assert!(wait_for_active(&pool, Some("a")).await);
    assert!(wait_until(|| pool.live_node_count() == 2).await);
    let router = create_router(AppState { pool: pool.clone(), metrics: None });

    let (status, body) = get(&router, "/health?full").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["checks"].as_array().unwrap().iter().all(|check| check["status"] == "passing"));

    let (status, body) = get(&router, "/readyz?full").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"][0]["output"], "active node a");

    clients[1].set_syncing(true);
    assert!(wait_until(|| pool.live_node_count() == 1).await);

    let (status, body) = get(&router, "/health?full").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let failing: Vec<&str> = body["checks"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|check| check["status"] == "failing")
        .map(|check| check["name"].as_str().unwrap())
        .collect();
    assert_eq!(failing, vec!["node.b"]);

    // Routing still works with one node down.
    let (status, _) = get(&router, "/readyz").await;
    assert_eq!(status, StatusCode::OK);

    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_chain_view_reports_history_and_watermarks() {
    let (pool, _clients) =
        mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100), ("b", 1, 102)]).unwrap();
    pool.start().unwrap();
    assert!(wait_until(|| pool.live_node_count() == 2).await);
    assert!(wait_until(|| pool.active_node_name().is_some()).await);
    pool.chain_info().unwrap();
    let router = create_router(AppState { pool: pool.clone(), metrics: None });

    let (status, body) = get(&router, "/chain").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["chain_id"], 1);
    assert_eq!(body["live_nodes"], 2);
    assert_eq!(body["highest_alive"]["block_number"], 102);
    assert_eq!(
        body["highest_user_observations"],
        serde_json::to_value(pool.highest_user_observations()).unwrap()
    );

    let nodes = body["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0]["name"], "a");
    assert_eq!(nodes[0]["state"], "alive");
    let history = nodes[0]["history"].as_array().unwrap();
    assert_eq!(history[0]["to"], "alive");
    assert_eq!(history.last().unwrap()["from"], "undialed");

    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_readiness_after_close() {
    let (pool, _clients) = mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100)]).unwrap();
    pool.start().unwrap();
    assert!(wait_for_active(&pool, Some("a")).await);
    pool.close().await.unwrap();
    let router = create_router(AppState { pool, metrics: None });

    let (status, body) = get(&router, "/readyz?full").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["checks"][0]["output"], "pool closed");
}
