//! Builder for constructing a [`Pool`] with optional metrics.

use super::{Pool, PoolConfig, PoolError, Selector};
use crate::{
    chain::{ChainInfoAggregator, PoolChainInfoProvider},
    client::NodeClient,
    metrics::MetricsCollector,
    node::{Node, NodeConfig},
};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    sync::{atomic::AtomicBool, Arc, Weak},
};
use tokio::sync::watch;
use tracing::warn;

/// Builder for a [`Pool`].
///
/// # Examples
///
/// ```no_run
/// # use meridian_core::{
/// #     chain::ChainId,
/// #     evm::EvmClient,
/// #     node::{BackoffPolicy, NodeConfig},
/// #     pool::{PoolBuilder, PoolConfig},
/// # };
/// # use std::{sync::Arc, time::Duration};
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backoff = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
/// let node = NodeConfig::new("primary", 0, ChainId(1), 5, Duration::from_secs(5), backoff);
/// let client = Arc::new(EvmClient::new("primary", "http://localhost:8545", None, Duration::from_secs(10))?);
///
/// let pool = Arc::new(PoolBuilder::new(PoolConfig::new(ChainId(1))).node(node, client).build()?);
/// # Ok(())
/// # }
/// ```
pub struct PoolBuilder<C: NodeClient> {
    config: PoolConfig,
    nodes: Vec<Arc<Node<C>>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<C: NodeClient> PoolBuilder<C> {
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self { config, nodes: Vec::new(), metrics: None }
    }

    /// Adds a node built from its configuration and client.
    #[must_use]
    pub fn node(mut self, config: NodeConfig, client: Arc<C>) -> Self {
        self.nodes.push(Arc::new(Node::new(config, client)));
        self
    }

    /// Adds already constructed nodes.
    #[must_use]
    pub fn nodes(mut self, nodes: impl IntoIterator<Item = Arc<Node<C>>>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validates the node set and wires every node to the pool's aggregator.
    ///
    /// Nodes configured for another chain are marked `InvalidChainId` and kept so
    /// they show up in health reports; they are never started.
    pub fn build(self) -> Result<Pool<C>, PoolError> {
        let Self { config, nodes, metrics } = self;

        config.validate().map_err(PoolError::InvalidConfig)?;
        if nodes.is_empty() {
            return Err(PoolError::NoNodes);
        }
        let mut names = HashSet::with_capacity(nodes.len());
        for node in &nodes {
            if !names.insert(node.name()) {
                return Err(PoolError::DuplicateNodeName(node.name().to_string()));
            }
        }

        let aggregator = match &metrics {
            Some(metrics) => ChainInfoAggregator::new().with_metrics(Arc::clone(metrics)),
            None => ChainInfoAggregator::new(),
        };
        let aggregator = Arc::new(aggregator);
        let provider: Weak<ChainInfoAggregator> = Arc::downgrade(&aggregator);
        let provider: Weak<dyn PoolChainInfoProvider> = provider;

        for node in &nodes {
            node.set_pool_chain_info_provider(Weak::clone(&provider));
            if node.configured_chain_id() != config.chain_id {
                warn!(
                    node = %node.name(),
                    expected = %config.chain_id,
                    configured = %node.configured_chain_id(),
                    "node configured for another chain, excluding"
                );
                node.mark_invalid_chain_id();
            }
        }

        let (active_generation, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);

        Ok(Pool {
            selector: Mutex::new(Selector::new(config.selection_mode)),
            config,
            nodes,
            aggregator,
            active: ArcSwapOption::empty(),
            active_generation,
            metrics,
            shutdown,
            failover_task: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}
