//! Pool-wide chain state watermarks.
//!
//! Every node reports `(state, ChainInfo)` into one [`ChainInfoAggregator`] owned by
//! its pool. The aggregator publishes two values:
//!
//! - **highest alive**: the join over the latest reports of currently alive nodes.
//!   Recomputed from the report table on every report, so it drops back when the
//!   node that carried it leaves `Alive`.
//! - **highest user observations**: the join over everything the pool has handed to
//!   a caller. Never moves backward for the lifetime of the pool.
//!
//! # Thread Safety
//!
//! Reports are serialised by a mutex over the report table. Both watermarks are
//! published through `ArcSwap`, so readers get a consistent `ChainInfo` without
//! taking a lock.

use super::ChainInfo;
use crate::{metrics::MetricsCollector, node::NodeState};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::watch;
use tracing::trace;

/// Reporting channel from a node to the pool that owns it.
///
/// Nodes hold this as a `Weak` reference: they report into it but never control
/// selection through it.
pub trait PoolChainInfoProvider: Send + Sync {
    /// Records the latest state and chain info of a node.
    fn report(&self, node: &str, state: NodeState, chain_info: ChainInfo);

    /// Number of alive nodes and the join of their chain info.
    fn latest_chain_info(&self) -> (usize, ChainInfo);

    /// Monotonic watermark of chain state served to callers.
    fn highest_user_observations(&self) -> ChainInfo;
}

/// Published view over the alive nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AliveSummary {
    pub live_nodes: usize,
    pub highest: ChainInfo,
}

#[derive(Debug, Clone, Copy)]
struct NodeReport {
    state: NodeState,
    chain_info: ChainInfo,
}

/// Default [`PoolChainInfoProvider`] used by [`Pool`](crate::pool::Pool).
pub struct ChainInfoAggregator {
    reports: Mutex<HashMap<Arc<str>, NodeReport>>,
    alive: ArcSwap<AliveSummary>,
    user_observations: ArcSwap<ChainInfo>,
    /// Bumped whenever any node changes state, or an alive node starts or stops
    /// dominating the user observation watermark.
    state_changes: watch::Sender<u64>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ChainInfoAggregator {
    #[must_use]
    pub fn new() -> Self {
        let (state_changes, _) = watch::channel(0);
        Self {
            reports: Mutex::new(HashMap::new()),
            alive: ArcSwap::from_pointee(AliveSummary::default()),
            user_observations: ArcSwap::from_pointee(ChainInfo::default()),
            state_changes,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the current alive summary.
    #[inline]
    #[must_use]
    pub fn alive_summary(&self) -> AliveSummary {
        **self.alive.load()
    }

    /// Folds a value just served to a caller into the user watermark.
    ///
    /// Returns the watermark after the update, which dominates both the previous
    /// watermark and `served`.
    pub fn observe(&self, served: ChainInfo) -> ChainInfo {
        let current = **self.user_observations.load();
        if current.dominates(&served) {
            return current;
        }

        let previous = self.user_observations.rcu(|current| current.join(served));
        let updated = previous.join(served);
        trace!(
            block_number = updated.block_number,
            finalized_block_number = updated.finalized_block_number,
            "user observation watermark advanced"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_user_observations(updated);
        }
        updated
    }

    /// Subscribes to node state change notifications.
    ///
    /// The value is a generation counter; only changes matter.
    #[must_use]
    pub fn subscribe_state_changes(&self) -> watch::Receiver<u64> {
        self.state_changes.subscribe()
    }

    /// Last reported state and chain info of a node.
    #[must_use]
    pub fn node_report(&self, node: &str) -> Option<(NodeState, ChainInfo)> {
        self.reports.lock().get(node).map(|r| (r.state, r.chain_info))
    }
}

impl Default for ChainInfoAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolChainInfoProvider for ChainInfoAggregator {
    fn report(&self, node: &str, state: NodeState, chain_info: ChainInfo) {
        let watermark = self.highest_user_observations();
        let mut reports = self.reports.lock();

        let (state_changed, caught_up) = if let Some(report) = reports.get_mut(node) {
            let changed = report.state != state;
            let caught_up = state == NodeState::Alive &&
                report.chain_info.dominates(&watermark) != chain_info.dominates(&watermark);
            *report = NodeReport { state, chain_info };
            (changed, caught_up)
        } else {
            reports.insert(Arc::from(node), NodeReport { state, chain_info });
            (true, false)
        };

        let summary = reports
            .values()
            .filter(|r| r.state == NodeState::Alive)
            .fold(AliveSummary::default(), |acc, r| AliveSummary {
                live_nodes: acc.live_nodes + 1,
                highest: acc.highest.join(r.chain_info),
            });
        self.alive.store(Arc::new(summary));
        drop(reports);

        if let Some(metrics) = &self.metrics {
            metrics.record_node_chain_info(node, chain_info);
            if state_changed {
                metrics.record_node_state(node, state);
                metrics.record_live_nodes(summary.live_nodes);
            }
        }

        if state_changed || caught_up {
            self.state_changes.send_modify(|generation| *generation = generation.wrapping_add(1));
        }
    }

    fn latest_chain_info(&self) -> (usize, ChainInfo) {
        let summary = self.alive_summary();
        (summary.live_nodes, summary.highest)
    }

    fn highest_user_observations(&self) -> ChainInfo {
        **self.user_observations.load()
    }
}
