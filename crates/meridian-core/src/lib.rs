//! # Meridian Core
//!
//! Health-tracked pool of blockchain RPC endpoints with failover.
//!
//! - **[`node`]**: per-endpoint health state machine. Dials the endpoint, verifies the
//!   chain id, follows new heads (subscription or polling) and probes liveness, moving
//!   between `Alive`, `OutOfSync`, `Syncing`, `Unreachable` and the fatal states.
//!
//! - **[`pool`]**: selects one active node per chain and fails over when it degrades.
//!   Calls retry on other eligible nodes; pool subscriptions re-home transparently.
//!
//! - **[`chain`]**: chain-info aggregation. Tracks the highest chain info among alive
//!   nodes and the monotonic watermark of everything callers have observed, so a
//!   failover never serves data older than what a caller has already seen.
//!
//! - **[`evm`]**: [`client::NodeClient`] binding for Ethereum JSON-RPC over HTTP and
//!   WebSocket.
//!
//! - **[`config`]**: layered TOML and environment configuration.
//!
//! - **[`metrics`]**: Prometheus metrics for node states, failovers and calls.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                           Pool                            │
//! │  ┌──────────┐  ┌─────────────────────┐  ┌──────────────┐  │
//! │  │ Selector │  │ ChainInfoAggregator │  │   Metrics    │  │
//! │  └────┬─────┘  └──────────▲──────────┘  └──────────────┘  │
//! │       │                   │ report / observe              │
//! │  ┌────▼───────────────────┴──────────────────────────┐    │
//! │  │  Node ── Node ── Node   (state machine + monitor) │    │
//! │  └────┬──────────────────────────────────────────────┘    │
//! └───────┼───────────────────────────────────────────────────┘
//!         ▼
//!    NodeClient (EvmClient: HTTP + WebSocket)
//! ```

pub mod chain;
pub mod client;
pub mod config;
pub mod evm;
pub mod metrics;
pub mod node;
pub mod pool;
pub mod types;

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<pool::Pool<evm::EvmClient>>();
    assert_send_sync::<node::Node<evm::EvmClient>>();
    assert_send_sync::<chain::ChainInfoAggregator>();
};
