//! Node pool with failover.
//!
//! A [`Pool`] owns every [`Node`] configured for one chain together with the
//! [`ChainInfoAggregator`] they report into. It keeps at most one node *active*,
//! routes calls and head subscriptions through it and fails over when that node
//! stops being eligible.
//!
//! # Failover
//!
//! A background task re-runs selection on every node state change and whenever an
//! alive node catches up with or falls behind the user observation watermark. The
//! active pointer is swapped atomically under the selection lock and a generation
//! counter is bumped; [`PoolSubscription`]s watch that counter and move to the new
//! node. Calls also re-run selection lazily when the active node is no longer
//! eligible, so a failover never waits for the background task.
//!
//! # Consistency
//!
//! Everything handed to a caller is folded into the pool's user observation
//! watermark. Nodes that do not dominate it are never selected and heads below it
//! are never delivered, so callers never see the chain move backward.

mod builder;
mod errors;
pub mod selector;
mod subscription;

pub use builder::PoolBuilder;
pub use errors::{HealthError, PoolError};
pub use selector::{CandidateView, SelectionMode, Selector};
pub use subscription::PoolSubscription;

use crate::{
    chain::{ChainId, ChainInfo, ChainInfoAggregator, PoolChainInfoProvider},
    client::{ClientError, NodeClient},
    metrics::{CallOutcome, MetricsCollector},
    node::{shutdown_requested, Node, NodeError, NodeState, NodeStatus},
};
use arc_swap::ArcSwapOption;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_CALL_ATTEMPTS: usize = 3;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 64;

/// How often selection is retried while no node is eligible.
const DEGRADED_RESELECT_INTERVAL: Duration = Duration::from_millis(100);

/// Component health keyed by name: `"pool"` and `"node.<name>"`. `None` is healthy.
pub type HealthReport = BTreeMap<String, Option<HealthError>>;

/// Pool-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub chain_id: ChainId,
    pub selection_mode: SelectionMode,
    /// Maximum number of distinct nodes tried by a single call.
    pub max_call_attempts: usize,
    /// Bound on a single attempt of a call.
    pub call_timeout: Duration,
    /// Heads buffered per pool subscription.
    pub subscription_buffer: usize,
}

impl PoolConfig {
    #[must_use]
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            selection_mode: SelectionMode::default(),
            max_call_attempts: DEFAULT_MAX_CALL_ATTEMPTS,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
        }
    }

    #[must_use]
    pub fn with_selection_mode(mut self, mode: SelectionMode) -> Self {
        self.selection_mode = mode;
        self
    }

    #[must_use]
    pub fn with_max_call_attempts(mut self, attempts: usize) -> Self {
        self.max_call_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_call_attempts == 0 {
            return Err("max_call_attempts must be greater than 0".to_string());
        }
        if self.call_timeout.is_zero() {
            return Err("call_timeout must be greater than 0".to_string());
        }
        if self.subscription_buffer == 0 {
            return Err("subscription_buffer must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Managed set of nodes serving one chain.
pub struct Pool<C: NodeClient> {
    config: PoolConfig,
    nodes: Vec<Arc<Node<C>>>,
    aggregator: Arc<ChainInfoAggregator>,
    active: ArcSwapOption<Node<C>>,
    selector: Mutex<Selector>,
    /// Bumped on every change of the active node.
    active_generation: watch::Sender<u64>,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown: watch::Sender<bool>,
    failover_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl<C: NodeClient> Pool<C> {
    /// Creates a pool over already constructed nodes.
    ///
    /// Equivalent to [`PoolBuilder`] without metrics.
    pub fn new(config: PoolConfig, nodes: Vec<Arc<Node<C>>>) -> Result<Self, PoolError> {
        PoolBuilder::new(config).nodes(nodes).build()
    }

    /// Starts every non-excluded node and the failover task.
    ///
    /// Idempotent. Fails if the pool is closed or no node could be started.
    pub fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut started_nodes = 0;
        for node in &self.nodes {
            let state = node.state();
            if state.is_fatal() {
                warn!(node = %node.name(), state = %state, "node excluded, not starting");
                continue;
            }
            match node.start() {
                Ok(()) => started_nodes += 1,
                Err(e) => warn!(node = %node.name(), error = %e, "failed to start node"),
            }
        }

        if started_nodes == 0 {
            self.started.store(false, Ordering::Release);
            return Err(PoolError::NoStartableNodes);
        }

        *self.failover_task.lock() = Some(self.spawn_failover_task());
        self.reselect();

        info!(
            chain_id = %self.config.chain_id,
            nodes = self.nodes.len(),
            started = started_nodes,
            selection_mode = %self.config.selection_mode,
            "pool started"
        );
        Ok(())
    }

    /// Closes every node and stops failover. Returns the first node teardown error.
    ///
    /// Only the first call does any work.
    pub async fn close(&self) -> Result<(), NodeError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        if let Some(task) = self.failover_task.lock().take() {
            task.abort();
        }

        {
            let _selection = self.selector.lock();
            self.active.store(None);
            self.active_generation.send_modify(|generation| *generation = generation.wrapping_add(1));
        }

        let results = join_all(self.nodes.iter().map(|node| node.close())).await;
        let first_error = results.into_iter().find_map(Result::err);

        info!(chain_id = %self.config.chain_id, clean = first_error.is_none(), "pool closed");
        first_error.map_or(Ok(()), Err)
    }

    /// Executes a call on the active node, failing over on retryable errors.
    ///
    /// At most `max_call_attempts` distinct nodes are tried. A node that leaves
    /// `Alive` while the call is in flight has its result discarded. Fails fast
    /// with [`PoolError::NoHealthyNode`] when no node is eligible.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let mut tried: Vec<usize> = Vec::with_capacity(self.config.max_call_attempts);
        let mut last_error: Option<ClientError> = None;

        while tried.len() < self.config.max_call_attempts {
            let Some((index, node)) = self.next_call_target(&tried) else { break };
            tried.push(index);

            let dispatched = node.state_and_latest().1;
            let started = Instant::now();
            let result = tokio::time::timeout(self.config.call_timeout, node.rpc().call(method, params.clone()))
                .await
                .unwrap_or(Err(ClientError::Timeout));
            let latency = started.elapsed();

            if node.state() != NodeState::Alive {
                debug!(node = %node.name(), method, "node left alive during call, discarding result");
                self.record_call(&node, CallOutcome::Discarded, latency);
                last_error = Some(result.err().unwrap_or_else(|| {
                    ClientError::ConnectionFailed(format!("{} stopped serving during the call", node.name()))
                }));
                continue;
            }

            match result {
                Ok(value) => {
                    self.aggregator.observe(dispatched);
                    self.record_call(&node, CallOutcome::Success, latency);
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    debug!(node = %node.name(), method, error = %e, "call failed, trying next node");
                    self.record_call(&node, CallOutcome::Retried, latency);
                    self.record_call_error(&node, &e);
                    last_error = Some(e);
                }
                Err(e) => {
                    self.record_call(&node, CallOutcome::Failed, latency);
                    self.record_call_error(&node, &e);
                    return Err(PoolError::Rpc(e));
                }
            }
        }

        match last_error {
            Some(source) => {
                warn!(method, attempts = tried.len(), error = %source, "call failed on every attempted node");
                Err(PoolError::RetriesExhausted { attempts: tried.len(), source })
            }
            None => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_no_healthy_node();
                }
                Err(PoolError::NoHealthyNode { chain_id: self.config.chain_id })
            }
        }
    }

    /// Subscribes to new heads of whichever node is active.
    pub fn subscribe_new_heads(self: &Arc<Self>) -> Result<PoolSubscription, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        Ok(PoolSubscription::spawn(self))
    }

    /// Chain info of the active node, served to the caller.
    ///
    /// The returned value is folded into the user observation watermark.
    pub fn chain_info(&self) -> Result<ChainInfo, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let node = self
            .current_or_reselect()
            .ok_or(PoolError::NoHealthyNode { chain_id: self.config.chain_id })?;
        Ok(self.aggregator.observe(node.state_and_latest().1))
    }

    /// Monotonic watermark of everything served to callers.
    #[must_use]
    pub fn highest_user_observations(&self) -> ChainInfo {
        self.aggregator.highest_user_observations()
    }

    /// Number of alive nodes and the join of their chain info.
    #[must_use]
    pub fn latest_chain_info(&self) -> (usize, ChainInfo) {
        self.aggregator.latest_chain_info()
    }

    #[must_use]
    pub fn live_node_count(&self) -> usize {
        self.aggregator.latest_chain_info().0
    }

    #[must_use]
    pub fn nodes_status(&self) -> Vec<NodeStatus> {
        self.nodes.iter().map(|node| node.status()).collect()
    }

    /// Per-component health. Recomputed on every call.
    #[must_use]
    pub fn health_report(&self) -> HealthReport {
        let mut report = HealthReport::new();

        let pool_health = if self.is_closed() {
            Some(HealthError::Closed)
        } else if !self.started.load(Ordering::Acquire) {
            Some(HealthError::NotStarted)
        } else if self.live_node_count() == 0 {
            Some(HealthError::NoAliveNodes(self.config.chain_id))
        } else {
            None
        };
        report.insert("pool".to_string(), pool_health);

        for node in &self.nodes {
            let state = node.state();
            let health = match state {
                NodeState::Alive => None,
                NodeState::Undialed => Some(HealthError::NotStarted),
                NodeState::Closed => Some(HealthError::Closed),
                state if state.is_fatal() => Some(HealthError::Fatal(state)),
                state => Some(HealthError::NotAlive(state)),
            };
            report.insert(format!("node.{}", node.name()), health);
        }
        report
    }

    /// At least one node is alive.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        !self.is_closed() && self.live_node_count() > 0
    }

    /// Started, not closed and able to route a call right now.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.is_closed() && self.current_or_reselect().is_some()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        self.config.chain_id
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[must_use]
    pub fn nodes(&self) -> &[Arc<Node<C>>] {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<&Arc<Node<C>>> {
        self.nodes.iter().find(|node| node.name() == name)
    }

    /// Currently active node, without re-running selection.
    #[must_use]
    pub fn active_node(&self) -> Option<Arc<Node<C>>> {
        self.active.load_full()
    }

    #[must_use]
    pub fn active_node_name(&self) -> Option<String> {
        self.active.load().as_ref().map(|node| node.name().to_string())
    }

    #[must_use]
    pub fn aggregator(&self) -> &Arc<ChainInfoAggregator> {
        &self.aggregator
    }

    /// Re-runs selection and swaps the active node if it changed.
    ///
    /// Returns the active node after selection.
    pub fn reselect(&self) -> Option<Arc<Node<C>>> {
        if self.is_closed() {
            return None;
        }

        let mut selector = self.selector.lock();
        let current = self.active.load_full();
        let current_index = current.as_ref().and_then(|node| self.index_of(node));

        let views = self.candidate_views();
        let (_, highest) = self.aggregator.latest_chain_info();
        let watermark = self.aggregator.highest_user_observations();
        let next = selector
            .select(&views, highest, watermark, current_index)
            .and_then(|index| self.nodes.get(index).cloned());

        let unchanged = match (&current, &next) {
            (Some(current), Some(next)) => Arc::ptr_eq(current, next),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return next;
        }

        if let Some(previous) = &current {
            if previous.state() != NodeState::Alive {
                previous.unsubscribe_all_except_alive_loop();
            }
        }
        self.active.store(next.clone());
        self.active_generation.send_modify(|generation| *generation = generation.wrapping_add(1));
        drop(selector);

        let from = current.as_ref().map(|node| node.name());
        let to = next.as_ref().map(|node| node.name());
        match to {
            Some(to) => info!(from = ?from, to, "active node changed"),
            None => warn!(from = ?from, chain_id = %self.config.chain_id, "no eligible node, pool degraded"),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_failover(from, to);
        }
        next
    }

    /// Active node if still eligible, otherwise the result of a fresh selection.
    fn current_or_reselect(&self) -> Option<Arc<Node<C>>> {
        if let Some(current) = self.active.load_full() {
            if self.is_eligible(&current) {
                return Some(current);
            }
        }
        self.reselect()
    }

    fn next_call_target(&self, tried: &[usize]) -> Option<(usize, Arc<Node<C>>)> {
        if tried.is_empty() {
            let node = self.current_or_reselect()?;
            return self.index_of(&node).map(|index| (index, node));
        }

        let views = self.candidate_views();
        let (_, highest) = self.aggregator.latest_chain_info();
        let watermark = self.aggregator.highest_user_observations();
        let ranked = self.selector.lock().ranked(&views, highest, watermark);
        ranked
            .into_iter()
            .find(|index| !tried.contains(index))
            .and_then(|index| self.nodes.get(index).map(|node| (index, Arc::clone(node))))
    }

    fn is_eligible(&self, node: &Arc<Node<C>>) -> bool {
        let Some(index) = self.index_of(node) else { return false };
        let (_, highest) = self.aggregator.latest_chain_info();
        candidate_view(index, node).is_eligible(highest, self.aggregator.highest_user_observations())
    }

    fn index_of(&self, node: &Arc<Node<C>>) -> Option<usize> {
        self.nodes.iter().position(|candidate| Arc::ptr_eq(candidate, node))
    }

    fn candidate_views(&self) -> Vec<CandidateView> {
        self.nodes.iter().enumerate().map(|(index, node)| candidate_view(index, node)).collect()
    }

    fn spawn_failover_task(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let mut changes = self.aggregator.subscribe_state_changes();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut degraded = false;
            loop {
                tokio::select! {
                    biased;
                    () = shutdown_requested(&mut shutdown) => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    // A node can catch up with the watermark without changing state.
                    () = tokio::time::sleep(DEGRADED_RESELECT_INTERVAL), if degraded => {}
                }
                let Some(pool) = pool.upgrade() else { break };
                degraded = pool.reselect().is_none();
            }
            debug!("failover task stopped");
        })
    }

    fn record_call(&self, node: &Node<C>, outcome: CallOutcome, latency: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.record_call(node.name(), outcome, latency);
        }
    }

    fn record_call_error(&self, node: &Node<C>, error: &ClientError) {
        if let Some(metrics) = &self.metrics {
            metrics.record_call_error(node.name(), error);
        }
    }
}

fn candidate_view<C: NodeClient>(index: usize, node: &Node<C>) -> CandidateView {
    let snapshot = node.snapshot();
    CandidateView {
        index,
        order: node.order(),
        state: snapshot.state,
        chain_info: snapshot.chain_info,
        lag_threshold: node.config().lag_threshold,
        promoted_at: snapshot.promoted_at,
    }
}

impl<C: NodeClient> Drop for Pool<C> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.failover_task.get_mut().take() {
            task.abort();
        }
        if !self.closed.load(Ordering::Acquire) {
            for node in &self.nodes {
                node.signal_shutdown();
            }
        }
    }
}

impl<C: NodeClient> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("chain_id", &self.config.chain_id)
            .field("nodes", &self.nodes.len())
            .field("active", &self.active_node_name())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
