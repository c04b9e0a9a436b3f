//! Mock Infrastructure for Testing Meridian
//!
//! Reusable endpoints for driving nodes and pools without real chains.
//!
//! ## Components
//!
//! - `MockNodeClient`: scripted `NodeClient` whose reachability, heads, finality and
//!   call results change while a node runs
//! - `RpcMockBuilder`: wraps mockito with Ethereum JSON-RPC responders for `EvmClient`
//! - `MockWebSocketServer`: `newHeads` subscription endpoint for `EvmClient`
//! - Test helpers for fast configurations and polling waits
//!
//! ## Usage
//!
//! ```ignore
//! use tests::mock_infrastructure::{mock_pool, wait_for_active, TEST_CHAIN};
//!
//! let (pool, clients) = mock_pool(PoolConfig::new(TEST_CHAIN), &[("a", 0, 100), ("b", 1, 100)])?;
//! pool.start()?;
//! assert!(wait_for_active(&pool, Some("a")).await);
//! clients[0].set_reachable(false);
//! assert!(wait_for_active(&pool, Some("b")).await);
//! ```

pub mod mock_client;

pub use mock_client::MockNodeClient;
pub use rpc_mock::RpcMockBuilder;
pub use test_helpers::*;
pub use websocket_mock::MockWebSocketServer;
