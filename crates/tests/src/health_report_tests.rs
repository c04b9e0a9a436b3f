//! Integration tests for pool and node health reporting.

#![allow(clippy::unwrap_used)]

use crate::mock_infrastructure::{mock_pool, wait_for_state, wait_until, TEST_CHAIN};
use meridian_core::{
    chain::ChainId,
    node::NodeState,
    pool::{HealthError, PoolConfig},
};

#[tokio::test]
async fn test_report_before_start() {
    let (pool, _clients) =
        mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100), ("b", 1, 100)]).unwrap();

    let report = pool.health_report();
    let keys: Vec<&str> = report.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["node.a", "node.b", "pool"]);
    assert!(report.values().all(|entry| *entry == Some(HealthError::NotStarted)));
    assert!(!pool.is_healthy());
    assert!(!pool.is_ready());
}

#[tokio::test]
async fn test_report_tracks_node_states() {
    let (pool, clients) =
        mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100), ("b", 1, 100), ("c", 2, 100)])
            .unwrap();
    clients[2].set_chain_id(ChainId(5));
    pool.start().unwrap();
    assert!(wait_until(|| pool.live_node_count() == 2).await);
    assert!(wait_for_state(pool.node("c").unwrap(), NodeState::InvalidChainId).await);

    clients[1].set_syncing(true);
    assert!(wait_for_state(pool.node("b").unwrap(), NodeState::Syncing).await);

    let report = pool.health_report();
    assert_eq!(report["pool"], None);
    assert_eq!(report["node.a"], None);
    assert_eq!(report["node.b"], Some(HealthError::NotAlive(NodeState::Syncing)));
    assert_eq!(report["node.c"], Some(HealthError::Fatal(NodeState::InvalidChainId)));
    assert_eq!(
        report["node.c"].unwrap().to_string(),
        "node is permanently excluded (invalid_chain_id)"
    );
    assert!(pool.is_healthy());
    assert!(pool.is_ready());

    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_report_without_alive_nodes() {
    let (pool, clients) = mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100)]).unwrap();
    clients[0].set_reachable(false);
    pool.start().unwrap();
    assert!(wait_for_state(pool.node("a").unwrap(), NodeState::Unreachable).await);

    let report = pool.health_report();
    assert_eq!(report["pool"], Some(HealthError::NoAliveNodes(TEST_CHAIN)));
    assert_eq!(report["node.a"], Some(HealthError::NotAlive(NodeState::Unreachable)));
    assert_eq!(report["pool"].unwrap().to_string(), "no alive nodes for chain 1");
    assert!(!pool.is_healthy());
    assert!(!pool.is_ready());

    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_report_after_close() {
    let (pool, _clients) = mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100)]).unwrap();
    pool.start().unwrap();
    assert!(wait_until(|| pool.live_node_count() == 1).await);
    pool.close().await.unwrap();

    let report = pool.health_report();
    assert!(report.values().all(|entry| *entry == Some(HealthError::Closed)));
    assert!(!pool.is_healthy());
}

#[tokio::test]
async fn test_nodes_status_snapshot() {
    let (pool, _clients) =
        mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100), ("b", 1, 103)]).unwrap();
    pool.start().unwrap();
    assert!(wait_until(|| pool.live_node_count() == 2).await);

    let statuses = pool.nodes_status();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].name, "a");
    assert_eq!(statuses[1].order, 1);
    assert_eq!(statuses[1].chain_info.block_number, 103);
    assert!(statuses.iter().all(|status| status.state == NodeState::Alive));
    assert!(statuses.iter().all(|status| status.chain_id == TEST_CHAIN));

    pool.close().await.unwrap();
}
