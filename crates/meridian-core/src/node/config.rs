use super::{BackoffPolicy, NodeError};
use crate::chain::ChainId;
use std::time::Duration;

/// Default timeout for establishing the transport.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Default timeout for a single liveness or chain query.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default upper bound on how long `close` waits for the monitoring task.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default number of consecutive failed probes before a node is declared unreachable.
pub const DEFAULT_PROBE_FAILURE_THRESHOLD: u32 = 2;

/// Runtime configuration for a single node.
///
/// The freshness and redial parameters (`lag_threshold`, `probe_interval` and the
/// [`BackoffPolicy`]) have no compiled defaults; they must be supplied by the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Unique name within a pool.
    pub name: String,
    /// Priority; lower is preferred.
    pub order: i32,
    /// Chain the endpoint must report.
    pub chain_id: ChainId,
    /// Maximum number of blocks the node may trail the highest alive node.
    pub lag_threshold: u64,
    /// Interval between liveness probes.
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub probe_failure_threshold: u32,
    pub dial_timeout: Duration,
    pub close_timeout: Duration,
    /// Head polling interval used when the endpoint cannot push heads.
    /// Without it such an endpoint is unusable.
    pub poll_interval: Option<Duration>,
    /// Declare the node out of sync when no new head arrives for this long.
    pub no_new_heads_threshold: Option<Duration>,
    pub backoff: BackoffPolicy,
}

impl NodeConfig {
    /// Creates a configuration with the required operator values and default timeouts.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        order: i32,
        chain_id: ChainId,
        lag_threshold: u64,
        probe_interval: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            order,
            chain_id,
            lag_threshold,
            probe_interval,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe_failure_threshold: DEFAULT_PROBE_FAILURE_THRESHOLD,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            poll_interval: None,
            no_new_heads_threshold: None,
            backoff,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Option<Duration>) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn with_no_new_heads_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.no_new_heads_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, dial: Duration, probe: Duration, close: Duration) -> Self {
        self.dial_timeout = dial;
        self.probe_timeout = probe;
        self.close_timeout = close;
        self
    }

    #[must_use]
    pub fn with_probe_failure_threshold(mut self, threshold: u32) -> Self {
        self.probe_failure_threshold = threshold;
        self
    }

    /// Rejects configurations the monitoring loop cannot run with.
    pub fn validate(&self) -> Result<(), NodeError> {
        let invalid = |reason: String| Err(NodeError::InvalidConfig(reason));

        if self.name.trim().is_empty() {
            return invalid("node name must not be empty".to_string());
        }
        for (field, value) in [
            ("probe_interval", self.probe_interval),
            ("probe_timeout", self.probe_timeout),
            ("dial_timeout", self.dial_timeout),
            ("close_timeout", self.close_timeout),
        ] {
            if value.is_zero() {
                return invalid(format!("{}: {field} must be greater than 0", self.name));
            }
        }
        if self.poll_interval.is_some_and(|p| p.is_zero()) {
            return invalid(format!("{}: poll_interval must be greater than 0", self.name));
        }
        if self.no_new_heads_threshold.is_some_and(|t| t.is_zero()) {
            return invalid(format!("{}: no_new_heads_threshold must be greater than 0", self.name));
        }
        if self.probe_failure_threshold == 0 {
            return invalid(format!("{}: probe_failure_threshold must be greater than 0", self.name));
        }
        self.backoff.validate().map_err(|e| NodeError::InvalidConfig(format!("{}: {e}", self.name)))
    }
}
