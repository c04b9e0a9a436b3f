//! Per-endpoint health state machine.
//!
//! A [`Node`] owns one [`NodeClient`] and runs a background monitoring loop that
//! dials the endpoint, validates its chain identity, follows its heads, probes its
//! liveness and redials it with backoff when it becomes unreachable. Every
//! observation is reported to the pool's [`PoolChainInfoProvider`].
//!
//! # State Snapshot
//!
//! The `(state, ChainInfo)` pair lives in one `ArcSwap<NodeSnapshot>`. Writers take
//! the per-node transition lock, so transitions for a node are strictly sequential;
//! readers load the snapshot without locking and never see a new state paired with
//! a stale `ChainInfo`.
//!
//! # Caller Subscriptions
//!
//! [`Node::subscribe_new_heads`] hands out forwarding subscriptions fed by the
//! monitoring loop. They are detached when the node leaves `Alive`, which is the
//! failover boundary callers observe.

mod backoff;
mod config;
mod errors;
mod lifecycle;
mod state;
mod subscription;

pub use backoff::{BackoffPolicy, DEFAULT_JITTER_FACTOR};
pub use config::{
    NodeConfig, DEFAULT_CLOSE_TIMEOUT, DEFAULT_DIAL_TIMEOUT, DEFAULT_PROBE_FAILURE_THRESHOLD,
    DEFAULT_PROBE_TIMEOUT,
};
pub use errors::NodeError;
pub use state::NodeState;
pub use subscription::NodeSubscription;

pub(crate) use lifecycle::shutdown_requested;

use crate::{
    chain::{ChainId, ChainInfo, Head, PoolChainInfoProvider},
    client::NodeClient,
};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{
    collections::VecDeque,
    sync::{atomic::AtomicBool, Arc, Weak},
    time::Instant,
};
use subscription::SubscriptionRegistry;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Number of state transitions retained per node.
pub const STATE_HISTORY_SIZE: usize = 100;

const HEAD_BROADCAST_CAPACITY: usize = 64;
const SUBSCRIBER_BUFFER: usize = 64;

/// Consistent view of a node's state and freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub state: NodeState,
    pub chain_info: ChainInfo,
    /// When the node entered `state`.
    pub state_since: DateTime<Utc>,
    /// Last promotion to `Alive`. Used to break priority ties.
    pub promoted_at: Option<Instant>,
}

/// Entry in the state history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub timestamp: DateTime<Utc>,
    pub from: NodeState,
    pub to: NodeState,
    pub chain_info: ChainInfo,
}

/// Serializable status of a node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub order: i32,
    pub chain_id: ChainId,
    pub state: NodeState,
    pub chain_info: ChainInfo,
    pub state_since: DateTime<Utc>,
    pub subscribers: usize,
}

/// One managed connection to a single RPC endpoint.
pub struct Node<C: NodeClient> {
    config: NodeConfig,
    name: Arc<str>,
    client: Arc<C>,
    snapshot: ArcSwap<NodeSnapshot>,
    transition_lock: Mutex<()>,
    history: Mutex<VecDeque<StateTransition>>,
    provider: RwLock<Option<Weak<dyn PoolChainInfoProvider>>>,
    subscriptions: Arc<SubscriptionRegistry>,
    heads: broadcast::Sender<Head>,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: NodeClient> Node<C> {
    /// Creates an undialed node. Nothing touches the endpoint until [`Node::start`].
    #[must_use]
    pub fn new(config: NodeConfig, client: Arc<C>) -> Self {
        let (heads, _) = broadcast::channel(HEAD_BROADCAST_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let name = Arc::from(config.name.as_str());

        Self {
            config,
            name,
            client,
            snapshot: ArcSwap::from_pointee(NodeSnapshot {
                state: NodeState::Undialed,
                chain_info: ChainInfo::default(),
                state_since: Utc::now(),
                promoted_at: None,
            }),
            transition_lock: Mutex::new(()),
            history: Mutex::new(VecDeque::with_capacity(STATE_HISTORY_SIZE)),
            provider: RwLock::new(None),
            subscriptions: Arc::new(SubscriptionRegistry::default()),
            heads,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
            task: Mutex::new(None),
        }
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn order(&self) -> i32 {
        self.config.order
    }

    #[inline]
    #[must_use]
    pub fn configured_chain_id(&self) -> ChainId {
        self.config.chain_id
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The underlying client.
    ///
    /// Only trustworthy while [`Node::state`] is `Alive`; go through the pool to get
    /// that guarantee enforced.
    #[must_use]
    pub fn rpc(&self) -> &Arc<C> {
        &self.client
    }

    /// Cached state. Never touches the network.
    #[inline]
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.snapshot.load().state
    }

    /// Cached state and chain info, read as one unit.
    #[inline]
    #[must_use]
    pub fn state_and_latest(&self) -> (NodeState, ChainInfo) {
        let snapshot = self.snapshot.load();
        (snapshot.state, snapshot.chain_info)
    }

    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> NodeSnapshot {
        **self.snapshot.load()
    }

    /// Pool-level monotonic watermark, or the default when detached from a pool.
    #[must_use]
    pub fn highest_user_observations(&self) -> ChainInfo {
        self.provider().map(|p| p.highest_user_observations()).unwrap_or_default()
    }

    /// Wires the node to the aggregator it reports into.
    ///
    /// The reference is weak: the node reports through it but never keeps the pool
    /// alive. The current snapshot is reported immediately.
    pub fn set_pool_chain_info_provider(&self, provider: Weak<dyn PoolChainInfoProvider>) {
        let _guard = self.transition_lock.lock();
        *self.provider.write() = Some(provider);
        let snapshot = self.snapshot.load();
        self.report(snapshot.state, snapshot.chain_info);
    }

    /// Subscribes to new heads observed by the monitoring loop.
    ///
    /// The subscription ends when the node leaves `Alive`.
    pub fn subscribe_new_heads(&self) -> Result<NodeSubscription, NodeError> {
        let _guard = self.transition_lock.lock();
        match self.state() {
            NodeState::Alive => {
                Ok(self.subscriptions.subscribe(Arc::clone(&self.name), &self.heads, SUBSCRIBER_BUFFER))
            }
            NodeState::Closed => Err(NodeError::Closed),
            state => Err(NodeError::NotAlive(state)),
        }
    }

    /// Number of caller subscriptions currently forwarded through this node.
    #[must_use]
    pub fn subscribers_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Detaches every caller subscription. The monitoring loop keeps its own
    /// head subscription.
    pub fn unsubscribe_all_except_alive_loop(&self) {
        let detached = self.subscriptions.detach_all();
        if detached > 0 {
            debug!(node = %self.name, detached, "detached caller subscriptions");
        }
    }

    /// Most recent state transitions, newest first.
    #[must_use]
    pub fn state_history(&self, limit: usize) -> Vec<StateTransition> {
        self.history.lock().iter().rev().take(limit).copied().collect()
    }

    #[must_use]
    pub fn status(&self) -> NodeStatus {
        let snapshot = self.snapshot();
        NodeStatus {
            name: self.name.to_string(),
            order: self.config.order,
            chain_id: self.config.chain_id,
            state: snapshot.state,
            chain_info: snapshot.chain_info,
            state_since: snapshot.state_since,
            subscribers: self.subscribers_count(),
        }
    }

    /// Marks the node as serving the wrong chain without dialing it.
    ///
    /// Used by the pool when the configured chain differs from the pool's chain.
    pub(crate) fn mark_invalid_chain_id(&self) -> bool {
        self.transition(NodeState::InvalidChainId, None)
    }

    /// Asks the monitoring loop to stop without tearing the transport down.
    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn provider(&self) -> Option<Arc<dyn PoolChainInfoProvider>> {
        self.provider.read().as_ref().and_then(Weak::upgrade)
    }

    fn report(&self, state: NodeState, chain_info: ChainInfo) {
        if let Some(provider) = self.provider() {
            provider.report(&self.name, state, chain_info);
        }
    }

    /// Highest chain info over the pool's alive nodes.
    fn highest_alive(&self) -> Option<ChainInfo> {
        self.provider().map(|p| p.latest_chain_info().1)
    }

    /// Applies a state transition, optionally replacing the chain info.
    ///
    /// Returns `false` if the transition is not allowed from the current state.
    fn transition(&self, to: NodeState, chain_info: Option<ChainInfo>) -> bool {
        let guard = self.transition_lock.lock();
        let current = self.snapshot();

        if current.state == to {
            if let Some(chain_info) = chain_info {
                self.snapshot.store(Arc::new(NodeSnapshot { chain_info, ..current }));
                self.report(to, chain_info);
            }
            return true;
        }

        if current.state == NodeState::Closed {
            debug!(node = %self.name, to = %to, "ignoring transition of a closed node");
            return false;
        }
        if !current.state.can_transition_to(to) {
            error!(node = %self.name, from = %current.state, to = %to, "invalid state transition");
            return false;
        }

        let now = Utc::now();
        let next = NodeSnapshot {
            state: to,
            chain_info: chain_info.unwrap_or(current.chain_info),
            state_since: now,
            promoted_at: if to == NodeState::Alive { Some(Instant::now()) } else { current.promoted_at },
        };
        self.snapshot.store(Arc::new(next));

        {
            let mut history = self.history.lock();
            if history.len() >= STATE_HISTORY_SIZE {
                history.pop_front();
            }
            history.push_back(StateTransition {
                timestamp: now,
                from: current.state,
                to,
                chain_info: next.chain_info,
            });
        }

        self.report(to, next.chain_info);
        drop(guard);

        match to {
            NodeState::Alive => {
                info!(node = %self.name, from = %current.state, chain_info = %next.chain_info, "node is alive");
            }
            NodeState::InvalidChainId | NodeState::Unusable => {
                error!(node = %self.name, from = %current.state, to = %to, "node permanently excluded");
            }
            NodeState::Closed => info!(node = %self.name, from = %current.state, "node closed"),
            _ if current.state == NodeState::Alive => {
                warn!(node = %self.name, to = %to, chain_info = %next.chain_info, "node is no longer alive");
            }
            _ => debug!(node = %self.name, from = %current.state, to = %to, "node state changed"),
        }

        if current.state == NodeState::Alive {
            self.unsubscribe_all_except_alive_loop();
        }
        true
    }

    /// Records a newly observed head. Heads at or below the known height are ignored.
    fn record_head(&self, head: &Head) -> Option<ChainInfo> {
        let guard = self.transition_lock.lock();
        let current = self.snapshot();
        if head.number <= current.chain_info.block_number {
            return None;
        }

        let chain_info = ChainInfo { block_number: head.number, ..current.chain_info };
        self.snapshot.store(Arc::new(NodeSnapshot { chain_info, ..current }));
        self.report(current.state, chain_info);
        drop(guard);

        // No receivers is the common case outside `Alive`.
        let _ = self.heads.send(*head);
        Some(chain_info)
    }

    /// Records a finalized height. Lower values than already known are ignored.
    fn record_finalized(&self, finalized_block_number: u64) {
        let _guard = self.transition_lock.lock();
        let current = self.snapshot();
        if finalized_block_number <= current.chain_info.finalized_block_number {
            return;
        }

        let chain_info = ChainInfo { finalized_block_number, ..current.chain_info };
        self.snapshot.store(Arc::new(NodeSnapshot { chain_info, ..current }));
        self.report(current.state, chain_info);
    }
}

impl<C: NodeClient> std::fmt::Debug for Node<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("order", &self.config.order)
            .field("chain_id", &self.config.chain_id)
            .field("state", &snapshot.state)
            .field("chain_info", &snapshot.chain_info)
            .finish_non_exhaustive()
    }
}
