use super::NodeState;
use crate::client::ClientError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a [`Node`](super::Node).
///
/// Transient endpoint failures never appear here; they are absorbed into the
/// node's state. Only local configuration problems and teardown failures do.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NodeError {
    /// Local configuration cannot be used to start the node.
    #[error("invalid node configuration: {0}")]
    InvalidConfig(String),

    /// The node has been closed.
    #[error("node is closed")]
    Closed,

    /// The operation requires an alive node.
    #[error("node is not alive (state: {0})")]
    NotAlive(NodeState),

    /// The transport reported an error during teardown.
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// The monitoring task did not stop within the close timeout and was aborted.
    #[error("monitoring task did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    /// The monitoring task panicked.
    #[error("monitoring task failed: {0}")]
    TaskFailed(String),
}
