//! Integration tests for call dispatch, retry across nodes and in-flight failover.

#![allow(clippy::unwrap_used)]

use crate::mock_infrastructure::{
    fast_node_config, mock_pool, wait_for_active, wait_until, MockNodeClient, TEST_CHAIN,
};
use meridian_core::{
    client::ClientError,
    metrics::init_metrics,
    pool::{Pool, PoolBuilder, PoolConfig, PoolError},
};
use serde_json::json;
use std::{sync::Arc, time::Duration};

async fn started_pool(config: PoolConfig) -> (Arc<Pool<MockNodeClient>>, Vec<Arc<MockNodeClient>>) {
    let (pool, clients) = mock_pool(config, &[("a", 0, 100), ("b", 1, 100), ("c", 2, 100)]).unwrap();
    pool.start().unwrap();
    assert!(wait_for_active(&pool, Some("a")).await);
    assert!(wait_until(|| pool.live_node_count() == 3).await);
    (pool, clients)
}

#[tokio::test]
async fn test_call_goes_to_active_node() {
    let (pool, clients) = started_pool(PoolConfig::new(TEST_CHAIN)).await;

    let result = pool.call("eth_blockNumber", json!([])).await.unwrap();
    assert_eq!(result["node"], "a");
    assert_eq!(clients[0].call_count(), 1);
    assert_eq!(clients[1].call_count(), 0);
    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_retryable_error_moves_to_next_node() {
    let (pool, clients) = started_pool(PoolConfig::new(TEST_CHAIN)).await;
    clients[0].push_call_result(Err(ClientError::HttpError(503, "overloaded".to_string())));

    let result = pool.call("eth_call", json!([{}, "latest"])).await.unwrap();
    assert_eq!(result["node"], "b");
    assert_eq!(clients[0].call_count(), 1);
    assert_eq!(clients[1].call_count(), 1);
    // A failed call does not demote the node.
    assert_eq!(pool.active_node_name().as_deref(), Some("a"));
    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_non_retryable_error_is_returned_immediately() {
    let (pool, clients) = started_pool(PoolConfig::new(TEST_CHAIN)).await;
    clients[0].push_call_result(Err(ClientError::Rpc(-32602, "invalid params".to_string())));

    let err = pool.call("eth_getBalance", json!(["0x0"])).await.unwrap_err();
    assert_eq!(err, PoolError::Rpc(ClientError::Rpc(-32602, "invalid params".to_string())));
    assert_eq!(clients[1].call_count(), 0);
    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_attempts_are_bounded() {
    let (pool, clients) =
        started_pool(PoolConfig::new(TEST_CHAIN).with_max_call_attempts(2)).await;
    for client in &clients {
        client.push_call_result(Err(ClientError::Timeout));
    }

    let err = pool.call("eth_blockNumber", json!([])).await.unwrap_err();
    assert_eq!(err, PoolError::RetriesExhausted { attempts: 2, source: ClientError::Timeout });
    assert!(!err.is_pool_exhausted());
    assert_eq!(clients[2].call_count(), 0);
    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_slow_call_times_out_and_retries() {
    let config = PoolConfig::new(TEST_CHAIN).with_call_timeout(Duration::from_millis(50));
    let (pool, clients) = started_pool(config).await;
    clients[0].set_call_delay(Some(Duration::from_millis(500)));

    let result = pool.call("eth_blockNumber", json!([])).await.unwrap();
    assert_eq!(result["node"], "b");
    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_result_is_discarded_when_node_leaves_alive_mid_call() {
    let metrics = init_metrics();
    let clients: Vec<Arc<MockNodeClient>> =
        ["a", "b"].iter().map(|name| Arc::new(MockNodeClient::new(name, TEST_CHAIN, 100))).collect();
    let pool = Arc::new(
        PoolBuilder::new(PoolConfig::new(TEST_CHAIN))
            .node(fast_node_config("a", 0), Arc::clone(&clients[0]))
            .node(fast_node_config("b", 1), Arc::clone(&clients[1]))
            .metrics(Arc::clone(&metrics))
            .build()
            .unwrap(),
    );
    pool.start().unwrap();
    assert!(wait_for_active(&pool, Some("a")).await);
    assert!(wait_until(|| pool.live_node_count() == 2).await);

    clients[0].set_call_delay(Some(Duration::from_millis(200)));
    let call = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.call("eth_blockNumber", json!([])).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    clients[0].set_syncing(true);

    let result = call.await.unwrap().unwrap();
    assert_eq!(result["node"], "b");
    assert!(metrics.summary().calls_discarded >= 1);
    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_call_fails_fast_without_eligible_node() {
    let (pool, clients) = mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100)]).unwrap();
    clients[0].set_reachable(false);
    pool.start().unwrap();

    let err = pool.call("eth_blockNumber", json!([])).await.unwrap_err();
    assert!(err.is_pool_exhausted());
    assert_eq!(clients[0].call_count(), 0);
    pool.close().await.unwrap();
}
