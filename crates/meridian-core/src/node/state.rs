use serde::{Deserialize, Serialize};
use std::fmt;

/// Health state of a single node.
///
/// ```text
///  Undialed ──start──► Dialing ──┬──► Alive ◄──────┐
///                        ▲       ├──► Unreachable  │
///                        │       ├──► InvalidChainId (fatal)
///                        │       └──► Unusable       (fatal)
///                        │                         │
///   Alive ──► OutOfSync ◄──► Syncing ──────────────┘
///     │           │             │
///     └───────────┴─────────────┴──► Unreachable ──redial──► Dialing
///
///  any non-closed state ──close──► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Constructed, not yet started.
    Undialed,
    /// Connecting and validating chain identity.
    Dialing,
    /// Healthy and eligible for traffic.
    Alive,
    /// Head trails the pool beyond the lag threshold, or stopped advancing.
    OutOfSync,
    /// Endpoint reports that it is synchronising.
    Syncing,
    /// Transport failed; redialling with backoff.
    Unreachable,
    /// Endpoint serves a different chain than configured.
    InvalidChainId,
    /// Endpoint lacks a capability the node requires.
    Unusable,
    /// Shut down.
    Closed,
}

impl NodeState {
    /// Returns `true` if the transition `self -> next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::{
            Alive, Closed, Dialing, InvalidChainId, OutOfSync, Syncing, Undialed, Unreachable,
            Unusable,
        };

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Undialed, Dialing | InvalidChainId) |
            (Dialing, Alive | Unreachable | InvalidChainId | Unusable) |
            (Alive, OutOfSync | Syncing | Unreachable) |
            (OutOfSync, Syncing | Alive | Unreachable) |
            (Syncing, OutOfSync | Alive | Unreachable) |
            (Unreachable, Dialing) => true,
            _ => false,
        }
    }

    /// Fatal states exclude a node until it is reconfigured.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::InvalidChainId | Self::Unusable)
    }

    /// States in which the monitoring loop keeps observing heads.
    #[must_use]
    pub fn is_monitored(self) -> bool {
        matches!(self, Self::Alive | Self::OutOfSync | Self::Syncing)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Undialed => "undialed",
            Self::Dialing => "dialing",
            Self::Alive => "alive",
            Self::OutOfSync => "out_of_sync",
            Self::Syncing => "syncing",
            Self::Unreachable => "unreachable",
            Self::InvalidChainId => "invalid_chain_id",
            Self::Unusable => "unusable",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
