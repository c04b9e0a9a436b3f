//! # Metrics
//!
//! Prometheus metrics for node health and pool failover.
//!
//! All recording goes through the global `metrics` recorder installed by
//! [`MetricsCollector::new`]; counters and gauges are lock-free. A few counters are
//! mirrored into atomics so [`MetricsCollector::summary`] can report them without
//! scraping the exporter.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `meridian_node_state` | gauge | `node` |
//! | `meridian_node_transitions_total` | counter | `node`, `to` |
//! | `meridian_node_block_number` | gauge | `node` |
//! | `meridian_node_finalized_block_number` | gauge | `node` |
//! | `meridian_pool_live_nodes` | gauge | |
//! | `meridian_pool_highest_user_block` | gauge | |
//! | `meridian_pool_failovers_total` | counter | `from`, `to` |
//! | `meridian_pool_calls_total` | counter | `node`, `outcome` |
//! | `meridian_pool_call_duration_seconds` | histogram | `node` |
//! | `meridian_pool_subscription_rehomes_total` | counter | |
//!
//! ## String Interning
//!
//! Node names are interned on first use so labels never allocate on the hot path.
//! Node names come from configuration, which bounds the leak.

use crate::{chain::ChainInfo, client::ClientError, node::NodeState};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

static NODE_NAME_POOL: OnceLock<dashmap::DashMap<String, &'static str>> = OnceLock::new();

#[inline]
fn node_to_static(node: &str) -> Cow<'static, str> {
    let pool = NODE_NAME_POOL.get_or_init(dashmap::DashMap::new);

    if let Some(interned) = pool.get(node) {
        return Cow::Borrowed(*interned);
    }

    let owned = node.to_string();
    let leaked: &'static str = Box::leak(owned.clone().into_boxed_str());
    pool.insert(owned, leaked);
    Cow::Borrowed(leaked)
}

/// Label and gauge encoding of a state-like value.
pub trait MetricsState {
    fn as_metric_str(&self) -> &'static str;
    fn as_gauge_value(&self) -> f64;
}

impl MetricsState for NodeState {
    fn as_metric_str(&self) -> &'static str {
        self.as_str()
    }

    /// 1.0 serving, 0.5 temporarily degraded, 0.0 not serving.
    fn as_gauge_value(&self) -> f64 {
        match self {
            Self::Alive => 1.0,
            Self::OutOfSync | Self::Syncing | Self::Dialing => 0.5,
            Self::Undialed |
            Self::Unreachable |
            Self::InvalidChainId |
            Self::Unusable |
            Self::Closed => 0.0,
        }
    }
}

impl MetricsState for ClientError {
    fn as_metric_str(&self) -> &'static str {
        ClientError::as_metric_str(self)
    }

    fn as_gauge_value(&self) -> f64 {
        if self.is_retryable() {
            0.5
        } else {
            1.0
        }
    }
}

fn try_init_prometheus_recorder(
) -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().install_recorder()
}

fn init_prometheus_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| match try_init_prometheus_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Failed to install primary Prometheus recorder, attempting fallback"
                );

                let recorder = PrometheusBuilder::new().build_recorder();
                tracing::warn!(
                    "Using fallback Prometheus recorder (install error: {e}) - metrics may not be globally visible"
                );
                recorder.handle()
            }
        })
        .clone()
}

/// Counters mirrored for in-process inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub calls_discarded: u64,
    pub failovers: u64,
    pub subscription_rehomes: u64,
}

pub struct MetricsCollector {
    prometheus_handle: PrometheusHandle,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
    calls_discarded: AtomicU64,
    failovers: AtomicU64,
    subscription_rehomes: AtomicU64,
}

impl MetricsCollector {
    /// Creates a collector, installing the global Prometheus recorder on first use.
    #[must_use]
    pub fn new() -> Self {
        Self {
            prometheus_handle: init_prometheus_recorder(),
            calls_succeeded: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            calls_discarded: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
            subscription_rehomes: AtomicU64::new(0),
        }
    }

    /// Record a node state change
    pub fn record_node_state(&self, node: &str, state: NodeState) {
        let node_cow = node_to_static(node);
        gauge!("meridian_node_state", "node" => node_cow.clone()).set(state.as_gauge_value());
        counter!("meridian_node_transitions_total", "node" => node_cow, "to" => state.as_metric_str())
            .increment(1);
    }

    /// Record the latest chain info reported by a node
    #[allow(clippy::cast_precision_loss)]
    pub fn record_node_chain_info(&self, node: &str, chain_info: ChainInfo) {
        let node_cow = node_to_static(node);
        gauge!("meridian_node_block_number", "node" => node_cow.clone())
            .set(chain_info.block_number as f64);
        gauge!("meridian_node_finalized_block_number", "node" => node_cow)
            .set(chain_info.finalized_block_number as f64);
    }

    pub fn record_live_nodes(&self, count: usize) {
        #[allow(clippy::cast_precision_loss)]
        gauge!("meridian_pool_live_nodes").set(count as f64);
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn record_user_observations(&self, watermark: ChainInfo) {
        gauge!("meridian_pool_highest_user_block").set(watermark.block_number as f64);
        gauge!("meridian_pool_highest_user_finalized_block")
            .set(watermark.finalized_block_number as f64);
    }

    /// Record an active node change. `None` means no node.
    pub fn record_failover(&self, from: Option<&str>, to: Option<&str>) {
        let from_cow = from.map_or(Cow::Borrowed("none"), node_to_static);
        let to_cow = to.map_or(Cow::Borrowed("none"), node_to_static);
        counter!("meridian_pool_failovers_total", "from" => from_cow, "to" => to_cow).increment(1);
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a call attempt against a node
    pub fn record_call(&self, node: &str, outcome: CallOutcome, latency: Duration) {
        let node_cow = node_to_static(node);
        counter!("meridian_pool_calls_total", "node" => node_cow.clone(), "outcome" => outcome.as_str())
            .increment(1);
        histogram!("meridian_pool_call_duration_seconds", "node" => node_cow)
            .record(latency.as_secs_f64());

        let mirror = match outcome {
            CallOutcome::Success => &self.calls_succeeded,
            CallOutcome::Retried | CallOutcome::Failed => &self.calls_failed,
            CallOutcome::Discarded => &self.calls_discarded,
        };
        mirror.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_error(&self, node: &str, error: &ClientError) {
        let node_cow = node_to_static(node);
        counter!(
            "meridian_pool_call_errors_total",
            "node" => node_cow,
            "error_type" => MetricsState::as_metric_str(error)
        )
        .increment(1);
    }

    pub fn record_no_healthy_node(&self) {
        counter!("meridian_pool_no_healthy_node_total").increment(1);
    }

    pub fn record_subscription_rehome(&self) {
        counter!("meridian_pool_subscription_rehomes_total").increment(1);
        self.subscription_rehomes.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            calls_succeeded: self.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            calls_discarded: self.calls_discarded.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            subscription_rehomes: self.subscription_rehomes.load(Ordering::Relaxed),
        }
    }

    /// Get current metrics as a string (for Prometheus endpoint)
    #[must_use]
    pub fn get_prometheus_metrics(&self) -> String {
        self.prometheus_handle.render()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// Failed with a retryable error; the call moved on to another node.
    Retried,
    /// Failed with an error returned to the caller.
    Failed,
    /// The node left `Alive` while the call was in flight.
    Discarded,
}

impl CallOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retried => "retried",
            Self::Failed => "failed",
            Self::Discarded => "discarded",
        }
    }
}

/// Initialize default metrics
#[must_use]
pub fn init_metrics() -> Arc<MetricsCollector> {
    Arc::new(MetricsCollector::new())
}
