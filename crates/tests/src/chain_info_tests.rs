//! Integration tests for chain-info aggregation and the user observation watermark.
//!
//! Whatever the pool hands out is folded into the watermark; a node that has not
//! caught up with it must never serve, even if it is the only one left alive.

#![allow(clippy::unwrap_used)]

use crate::mock_infrastructure::{mock_pool, wait_for_active, wait_until, TEST_CHAIN};
use meridian_core::{
    chain::ChainInfo,
    pool::{PoolConfig, PoolError},
};
use serde_json::json;

#[tokio::test]
async fn test_highest_alive_tracks_alive_nodes_only() {
    let (pool, clients) =
        mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100), ("b", 1, 102)]).unwrap();
    pool.start().unwrap();
    assert!(wait_until(|| pool.live_node_count() == 2).await);
    assert_eq!(pool.latest_chain_info(), (2, ChainInfo::new(102, 92)));

    clients[1].set_reachable(false);
    assert!(wait_until(|| pool.live_node_count() == 1).await);
    assert_eq!(pool.latest_chain_info().1, ChainInfo::new(100, 90));
    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_watermark_follows_served_values() {
    let (pool, clients) = mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100)]).unwrap();
    assert_eq!(pool.highest_user_observations(), ChainInfo::default());

    pool.start().unwrap();
    assert!(wait_for_active(&pool, Some("a")).await);
    assert_eq!(pool.chain_info().unwrap(), ChainInfo::new(100, 90));
    assert_eq!(pool.highest_user_observations(), ChainInfo::new(100, 90));

    clients[0].push_head(103);
    assert!(wait_until(|| pool.latest_chain_info().1.block_number == 103).await);
    // Not served yet.
    assert_eq!(pool.highest_user_observations().block_number, 100);

    pool.call("eth_blockNumber", json!([])).await.unwrap();
    assert_eq!(pool.highest_user_observations(), ChainInfo::new(103, 90));
    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_node_behind_watermark_is_not_selected() {
    let (pool, clients) =
        mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100), ("b", 1, 100)]).unwrap();
    pool.start().unwrap();
    assert!(wait_for_active(&pool, Some("a")).await);
    assert!(wait_until(|| pool.live_node_count() == 2).await);

    // Within b's lag threshold, so b stays alive.
    clients[0].push_head(104);
    assert!(wait_until(|| pool.latest_chain_info().1.block_number == 104).await);
    assert_eq!(pool.chain_info().unwrap().block_number, 104);

    clients[0].set_reachable(false);
    assert!(wait_for_active(&pool, None).await);
    assert_eq!(pool.live_node_count(), 1);
    assert!(matches!(pool.chain_info(), Err(PoolError::NoHealthyNode { .. })));
    assert!(matches!(
        pool.call("eth_blockNumber", json!([])).await,
        Err(PoolError::NoHealthyNode { .. })
    ));
    assert_eq!(clients[1].call_count(), 0);

    clients[1].push_head(104);
    assert!(wait_for_active(&pool, Some("b")).await);
    assert_eq!(pool.chain_info().unwrap().block_number, 104);
    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_watermark_survives_node_loss() {
    let (pool, clients) = mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100)]).unwrap();
    pool.start().unwrap();
    assert!(wait_for_active(&pool, Some("a")).await);
    pool.chain_info().unwrap();

    clients[0].set_reachable(false);
    assert!(wait_until(|| pool.live_node_count() == 0).await);
    assert_eq!(pool.latest_chain_info(), (0, ChainInfo::default()));
    assert_eq!(pool.highest_user_observations(), ChainInfo::new(100, 90));

    // Recovered at a lower height: alive but not eligible.
    clients[0].set_head(95);
    clients[0].set_reachable(true);
    assert!(wait_until(|| pool.live_node_count() == 1).await);
    assert!(pool.active_node().is_none());
    assert_eq!(pool.highest_user_observations(), ChainInfo::new(100, 90));
    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_node_sees_pool_watermark() {
    let (pool, _clients) = mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100)]).unwrap();
    pool.start().unwrap();
    assert!(wait_for_active(&pool, Some("a")).await);
    pool.chain_info().unwrap();

    let node = pool.node("a").unwrap();
    assert_eq!(node.highest_user_observations(), pool.highest_user_observations());
    pool.close().await.unwrap();
}
