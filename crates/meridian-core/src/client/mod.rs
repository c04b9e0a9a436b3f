//! Transport boundary between a [`Node`](crate::node::Node) and its endpoint.
//!
//! The node state machine never speaks a wire protocol itself. Everything it needs
//! from an endpoint goes through [`NodeClient`], so the health logic is identical for
//! the bundled EVM JSON-RPC binding ([`crate::evm::EvmClient`]) and for scripted test
//! clients.

pub mod errors;

pub use errors::{ClientError, RpcErrorCategory};

use crate::chain::{ChainId, Head};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

/// Stream of head notifications. Ends when the underlying subscription is gone.
pub type HeadStream = BoxStream<'static, Result<Head, ClientError>>;

/// Capabilities a node requires from one RPC endpoint.
///
/// Implementations must be cheap to call concurrently: the monitoring loop probes
/// while callers dispatch through [`NodeClient::call`].
#[async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Opens (or re-opens) the transport and checks that the endpoint answers.
    async fn dial(&self) -> Result<(), ClientError>;

    /// Releases the transport. Must be safe to call repeatedly.
    async fn close(&self) -> Result<(), ClientError>;

    /// Chain identity reported by the endpoint.
    async fn chain_id(&self) -> Result<ChainId, ClientError>;

    /// Most recent head known to the endpoint.
    async fn latest_head(&self) -> Result<Head, ClientError>;

    /// Most recent finalized block height known to the endpoint.
    async fn latest_finalized_block(&self) -> Result<u64, ClientError>;

    /// Subscribes to new heads.
    ///
    /// Returns [`ClientError::Unsupported`] when the endpoint cannot push heads; the
    /// node then falls back to polling if a poll interval is configured.
    async fn subscribe_new_heads(&self) -> Result<HeadStream, ClientError>;

    /// Whether the endpoint reports that it is still synchronising.
    async fn is_syncing(&self) -> Result<bool, ClientError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), ClientError>;

    /// Executes an arbitrary RPC method.
    async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError>;
}
