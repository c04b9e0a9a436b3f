//! Integration tests for the node health state machine.
//!
//! Nodes run standalone over `MockNodeClient`, so lag is never measured here; lag
//! against other nodes is covered by the pool suites.

#![allow(clippy::unwrap_used)]

use crate::mock_infrastructure::{
    fast_node_config, wait_for_state, wait_until, MockNodeClient, TEST_CHAIN,
};
use meridian_core::{
    chain::ChainId,
    client::ClientError,
    node::{BackoffPolicy, Node, NodeConfig, NodeError, NodeState},
};
use std::{sync::Arc, time::Duration};

fn node_with(config: NodeConfig, client: &Arc<MockNodeClient>) -> Arc<Node<MockNodeClient>> {
    Arc::new(Node::new(config, Arc::clone(client)))
}

fn node(name: &str, head: u64) -> (Arc<Node<MockNodeClient>>, Arc<MockNodeClient>) {
    let client = Arc::new(MockNodeClient::new(name, TEST_CHAIN, head));
    (node_with(fast_node_config(name, 0), &client), client)
}

#[tokio::test]
async fn test_node_becomes_alive_and_follows_heads() {
    let (node, client) = node("a", 100);
    assert_eq!(node.state(), NodeState::Undialed);

    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Alive).await);
    assert_eq!(node.state_and_latest().1.block_number, 100);
    assert_eq!(node.state_and_latest().1.finalized_block_number, 90);

    client.push_head(101);
    client.push_head(102);
    assert!(wait_until(|| node.state_and_latest().1.block_number == 102).await);

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_older_heads_are_ignored() {
    let (node, client) = node("a", 100);
    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Alive).await);

    client.push_head(105);
    assert!(wait_until(|| node.state_and_latest().1.block_number == 105).await);
    client.push_head(103);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(node.state_and_latest().1.block_number, 105);

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let (node, client) = node("a", 100);
    node.start().unwrap();
    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Alive).await);
    assert_eq!(client.dial_count(), 1);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_node_redials_and_recovers() {
    let (node, client) = node("a", 100);
    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Alive).await);

    client.set_reachable(false);
    assert!(wait_for_state(&node, NodeState::Unreachable).await);
    assert!(wait_until(|| client.dial_count() >= 3).await);

    client.set_head(120);
    client.set_reachable(true);
    assert!(wait_for_state(&node, NodeState::Alive).await);
    assert_eq!(node.state_and_latest().1.block_number, 120);

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_head_stream_makes_node_unreachable() {
    let (node, client) = node("a", 100);
    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Alive).await);

    client.fail_subscriptions(ClientError::ConnectionFailed("reset by peer".to_string()));
    assert!(
        wait_until(|| node.state_history(10).iter().any(|t| t.to == NodeState::Unreachable)).await
    );
    // Still reachable, so the redial brings it back.
    assert!(wait_for_state(&node, NodeState::Alive).await);

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_redial_attempts_are_bounded() {
    let client = Arc::new(MockNodeClient::new("a", TEST_CHAIN, 100));
    client.set_reachable(false);
    let backoff = BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(10))
        .with_max_attempts(Some(2));
    let config = NodeConfig { backoff, ..fast_node_config("a", 0) };
    let node = node_with(config, &client);

    node.start().unwrap();
    assert!(wait_until(|| client.dial_count() == 3).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(client.dial_count(), 3);
    assert_eq!(node.state(), NodeState::Unreachable);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_wrong_chain_is_fatal() {
    let (node, client) = node("a", 100);
    client.set_chain_id(ChainId(5));

    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::InvalidChainId).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(client.dial_count(), 1);
    assert_eq!(node.state(), NodeState::InvalidChainId);
    assert!(client.close_count() >= 1);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_missing_subscription_support_without_polling_is_unusable() {
    let client = Arc::new(MockNodeClient::new("a", TEST_CHAIN, 100).without_subscriptions());
    let node = node_with(fast_node_config("a", 0), &client);

    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Unusable).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.dial_count(), 1);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_polling_fallback_follows_heads() {
    let client = Arc::new(MockNodeClient::new("a", TEST_CHAIN, 100).without_subscriptions());
    let config = fast_node_config("a", 0).with_poll_interval(Some(Duration::from_millis(10)));
    let node = node_with(config, &client);

    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Alive).await);

    client.set_head(130);
    assert!(wait_until(|| node.state_and_latest().1.block_number == 130).await);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_isolated_poll_failures_do_not_accumulate() {
    let client = Arc::new(MockNodeClient::new("a", TEST_CHAIN, 100).without_subscriptions());
    let config = NodeConfig {
        probe_interval: Duration::from_secs(10),
        ..fast_node_config("a", 0).with_poll_interval(Some(Duration::from_millis(10)))
    };
    let node = node_with(config, &client);
    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Alive).await);

    client.fail_head_reads(1);
    assert!(wait_until(|| client.pending_head_read_failures() == 0).await);
    client.set_head(101);
    assert!(wait_until(|| node.state_and_latest().1.block_number == 101).await);

    client.fail_head_reads(1);
    assert!(wait_until(|| client.pending_head_read_failures() == 0).await);
    client.set_head(102);
    assert!(wait_until(|| node.state_and_latest().1.block_number == 102).await);

    assert_eq!(node.state(), NodeState::Alive);
    assert!(node.state_history(10).iter().all(|t| t.to != NodeState::Unreachable));

    // Back-to-back failures still take the node down.
    client.fail_head_reads(2);
    assert!(
        wait_until(|| node.state_history(10).iter().any(|t| t.to == NodeState::Unreachable)).await
    );
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_syncing_endpoint_leaves_and_rejoins_alive() {
    let (node, client) = node("a", 100);
    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Alive).await);

    client.set_syncing(true);
    assert!(wait_for_state(&node, NodeState::Syncing).await);

    client.set_syncing(false);
    assert!(wait_for_state(&node, NodeState::Alive).await);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_stalled_heads_mark_node_out_of_sync() {
    let client = Arc::new(MockNodeClient::new("a", TEST_CHAIN, 100));
    let config =
        fast_node_config("a", 0).with_no_new_heads_threshold(Some(Duration::from_millis(60)));
    let node = node_with(config, &client);

    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Alive).await);
    assert!(wait_for_state(&node, NodeState::OutOfSync).await);

    client.push_head(101);
    assert!(wait_for_state(&node, NodeState::Alive).await);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_finality_refreshes_on_probe() {
    let (node, client) = node("a", 100);
    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Alive).await);

    client.set_finalized(98);
    assert!(wait_until(|| node.state_and_latest().1.finalized_block_number == 98).await);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_subscription_requires_alive_and_ends_when_node_degrades() {
    let (node, client) = node("a", 100);
    assert!(matches!(node.subscribe_new_heads(), Err(NodeError::NotAlive(NodeState::Undialed))));

    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Alive).await);

    let mut subscription = node.subscribe_new_heads().unwrap();
    assert_eq!(node.subscribers_count(), 1);

    client.push_head(101);
    let head = tokio::time::timeout(Duration::from_secs(2), subscription.recv()).await.unwrap();
    assert_eq!(head.map(|h| h.number), Some(101));

    client.set_reachable(false);
    let end = tokio::time::timeout(Duration::from_secs(2), subscription.recv()).await.unwrap();
    assert!(end.is_none());
    assert_eq!(node.subscribers_count(), 0);

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_all_keeps_monitoring() {
    let (node, client) = node("a", 100);
    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Alive).await);

    let mut first = node.subscribe_new_heads().unwrap();
    let _second = node.subscribe_new_heads().unwrap();
    assert_eq!(node.subscribers_count(), 2);

    node.unsubscribe_all_except_alive_loop();
    assert_eq!(node.subscribers_count(), 0);
    assert!(first.recv().await.is_none());

    client.push_head(150);
    assert!(wait_until(|| node.state_and_latest().1.block_number == 150).await);
    assert_eq!(node.state(), NodeState::Alive);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_terminal_and_idempotent() {
    let (node, client) = node("a", 100);
    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Alive).await);
    let _subscription = node.subscribe_new_heads().unwrap();

    node.close().await.unwrap();
    node.close().await.unwrap();

    assert_eq!(node.state(), NodeState::Closed);
    assert_eq!(node.subscribers_count(), 0);
    assert!(client.close_count() >= 1);
    assert!(matches!(node.start(), Err(NodeError::Closed)));
    assert!(matches!(node.subscribe_new_heads(), Err(NodeError::Closed)));

    // Heads after close change nothing.
    client.push_head(200);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(node.state(), NodeState::Closed);
}

#[tokio::test]
async fn test_close_before_start() {
    let (node, _client) = node("a", 100);
    node.close().await.unwrap();
    assert_eq!(node.state(), NodeState::Closed);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_on_start() {
    let client = Arc::new(MockNodeClient::new("a", TEST_CHAIN, 100));
    let config = NodeConfig { probe_interval: Duration::ZERO, ..fast_node_config("a", 0) };
    let node = node_with(config, &client);

    assert!(matches!(node.start(), Err(NodeError::InvalidConfig(_))));
    assert_eq!(node.state(), NodeState::Undialed);
}

#[tokio::test]
async fn test_state_history_is_newest_first() {
    let (node, client) = node("a", 100);
    node.start().unwrap();
    assert!(wait_for_state(&node, NodeState::Alive).await);
    client.set_syncing(true);
    assert!(wait_for_state(&node, NodeState::Syncing).await);

    let history = node.state_history(10);
    let path: Vec<(NodeState, NodeState)> = history.iter().map(|t| (t.from, t.to)).collect();
    assert_eq!(
        path,
        vec![
            (NodeState::Alive, NodeState::Syncing),
            (NodeState::Dialing, NodeState::Alive),
            (NodeState::Undialed, NodeState::Dialing),
        ]
    );
    assert_eq!(node.state_history(1).len(), 1);
    node.close().await.unwrap();
}
