use crate::{chain::ChainId, client::ClientError, node::NodeState};
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Errors returned by [`Pool`](super::Pool).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolError {
    /// No node is currently eligible to serve the chain.
    #[error("no healthy node available for chain {chain_id}")]
    NoHealthyNode { chain_id: ChainId },

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("pool has no nodes configured")]
    NoNodes,

    #[error("duplicate node name: {0}")]
    DuplicateNodeName(String),

    /// Every configured node is excluded or failed to start.
    #[error("no node could be started")]
    NoStartableNodes,

    #[error("pool is closed")]
    Closed,

    /// Every attempted node failed with a retryable error.
    #[error("call failed on {attempts} node(s): {source}")]
    RetriesExhausted { attempts: usize, source: ClientError },

    /// Non-retryable error returned by the serving node.
    #[error("rpc error: {0}")]
    Rpc(ClientError),
}

impl PoolError {
    /// Returns `true` when the pool had nothing to route to, as opposed to a failure
    /// reported by a node.
    #[must_use]
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::NoHealthyNode { .. })
    }

    /// Underlying client error, if a node produced this error.
    #[must_use]
    pub fn client_error(&self) -> Option<&ClientError> {
        match self {
            Self::RetriesExhausted { source, .. } | Self::Rpc(source) => Some(source),
            _ => None,
        }
    }
}

/// Failure entry of a health report.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HealthError {
    /// No node of the pool is alive.
    #[error("no alive nodes for chain {0}")]
    NoAliveNodes(ChainId),

    /// The node is temporarily not serving.
    #[error("node is {0}")]
    NotAlive(NodeState),

    /// The node is permanently excluded until reconfigured.
    #[error("node is permanently excluded ({0})")]
    Fatal(NodeState),

    #[error("not started")]
    NotStarted,

    #[error("closed")]
    Closed,
}

impl Serialize for HealthError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
