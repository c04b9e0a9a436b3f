//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: set on the `config` builder in [`AppConfig::from_file`]
//! 2. **Config file**: TOML file specified by `MERIDIAN_CONFIG` env var
//! 3. **Environment variables**: `MERIDIAN__*` env vars override specific fields
//!
//! # Configuration Sections
//!
//! - [`ServerConfig`]: HTTP server settings
//! - [`PoolSettings`]: chain id, selection mode and call limits
//! - [`MonitoringConfig`]: node freshness, probing and redial settings
//! - [`NodeEndpointConfig`]: RPC endpoint definitions
//! - [`MetricsConfig`], [`LoggingConfig`]
//!
//! The freshness and redial values in `[monitoring]` (`lag_threshold`,
//! `probe_interval_ms`, `backoff_base_ms`, `backoff_max_ms`) have no compiled
//! defaults; loading fails when they are missing.
//!
//! # Example
//!
//! ```toml
//! [pool]
//! chain_id = 1
//!
//! [monitoring]
//! lag_threshold = 10
//! probe_interval_ms = 5000
//! backoff_base_ms = 1000
//! backoff_max_ms = 30000
//!
//! [[nodes]]
//! name = "primary"
//! order = 0
//! chain_id = 1
//! http_url = "https://rpc.example.com"
//! ws_url = "wss://rpc.example.com/ws"
//! ```

use crate::{
    chain::ChainId,
    node::{
        BackoffPolicy, NodeConfig, DEFAULT_CLOSE_TIMEOUT, DEFAULT_DIAL_TIMEOUT,
        DEFAULT_JITTER_FACTOR, DEFAULT_PROBE_FAILURE_THRESHOLD, DEFAULT_PROBE_TIMEOUT,
    },
    pool::{PoolConfig, SelectionMode},
};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, time::Duration};
use url::Url;

/// HTTP server configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind the server to. Defaults to `127.0.0.1`.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port number to listen on. Defaults to `3040`.
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    3040
}

/// Prometheus metrics configuration.
///
/// When enabled, metrics are exposed at `/metrics` on the server port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled. Defaults to `true`.
    pub enabled: bool,
}

/// Application logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "trace", "debug", "info", "warn", "error"). Defaults to `"info"`.
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    pub format: String,
}

/// Pool-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Chain served by the pool. Nodes configured for another chain are excluded.
    pub chain_id: u64,

    #[serde(default)]
    pub selection_mode: SelectionMode,

    /// Maximum number of distinct nodes tried per call. Defaults to `3`.
    #[serde(default = "default_max_call_attempts")]
    pub max_call_attempts: usize,

    /// Per-attempt call timeout in milliseconds. Defaults to `10000`.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Heads buffered per pool subscription. Defaults to `64`.
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
}

fn default_max_call_attempts() -> usize {
    crate::pool::DEFAULT_MAX_CALL_ATTEMPTS
}

#[allow(clippy::cast_possible_truncation)]
fn default_call_timeout_ms() -> u64 {
    crate::pool::DEFAULT_CALL_TIMEOUT.as_millis() as u64
}

fn default_subscription_buffer() -> usize {
    crate::pool::DEFAULT_SUBSCRIPTION_BUFFER
}

/// Node health monitoring settings shared by every node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Blocks a node may trail the highest alive node before it is out of sync.
    pub lag_threshold: u64,

    /// Interval between liveness probes in milliseconds.
    pub probe_interval_ms: u64,

    /// First redial delay in milliseconds.
    pub backoff_base_ms: u64,

    /// Upper bound on the redial delay in milliseconds.
    pub backoff_max_ms: u64,

    /// Redial attempts before a node stays unreachable. Unbounded when absent.
    #[serde(default)]
    pub max_redial_attempts: Option<u32>,

    /// Head polling interval for endpoints without push subscriptions.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    /// Declare a node out of sync when no head arrives for this long.
    #[serde(default)]
    pub no_new_heads_threshold_ms: Option<u64>,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_probe_failure_threshold")]
    pub probe_failure_threshold: u32,

    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

#[allow(clippy::cast_possible_truncation)]
fn default_probe_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT.as_millis() as u64
}

fn default_probe_failure_threshold() -> u32 {
    DEFAULT_PROBE_FAILURE_THRESHOLD
}

#[allow(clippy::cast_possible_truncation)]
fn default_dial_timeout_ms() -> u64 {
    DEFAULT_DIAL_TIMEOUT.as_millis() as u64
}

#[allow(clippy::cast_possible_truncation)]
fn default_close_timeout_ms() -> u64 {
    DEFAULT_CLOSE_TIMEOUT.as_millis() as u64
}

fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

/// One RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEndpointConfig {
    /// Unique name, used in logs, metrics and health reports.
    pub name: String,

    /// Priority; lower is preferred. Defaults to `0`.
    #[serde(default)]
    pub order: i32,

    /// Chain the endpoint is expected to serve.
    pub chain_id: u64,

    pub http_url: String,

    /// WebSocket URL for head subscriptions. Without it the node polls for heads.
    #[serde(default)]
    pub ws_url: Option<String>,

    /// Per-node override of `monitoring.lag_threshold`.
    #[serde(default)]
    pub lag_threshold: Option<u64>,

    /// Per-node override of `monitoring.probe_interval_ms`.
    #[serde(default)]
    pub probe_interval_ms: Option<u64>,
}

/// Complete application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Deployment environment name. Defaults to `"development"`.
    #[serde(default = "default_environment")]
    pub environment: String,

    pub server: ServerConfig,

    pub logging: LoggingConfig,

    pub metrics: MetricsConfig,

    pub pool: PoolSettings,

    /// Required; absent values make [`AppConfig::validate`] fail.
    #[serde(default)]
    pub monitoring: Option<MonitoringConfig>,

    #[serde(default)]
    pub nodes: Vec<NodeEndpointConfig>,
}

fn default_environment() -> String {
    "development".to_string()
}

impl AppConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// Environment variables with the `MERIDIAN__` prefix can override any configuration
    /// value. Use `__` as a separator for nested fields
    /// (e.g., `MERIDIAN__SERVER__BIND_PORT=8080`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .set_default("environment", "development")?
            .set_default("server.bind_address", "127.0.0.1")?
            .set_default("server.bind_port", 3040)?
            .set_default("metrics.enabled", true)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("MERIDIAN").separator("__"))
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads configuration from `config/config.toml`.
    ///
    /// The config file path can be overridden using the `MERIDIAN_CONFIG` environment
    /// variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "config/config.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Returns the parsed socket address for the HTTP server.
    ///
    /// # Errors
    ///
    /// Returns an error string if the address cannot be parsed.
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, String> {
        format!("{}:{}", self.server.bind_address, self.server.bind_port)
            .parse()
            .map_err(|_| {
                format!(
                    "Invalid socket address: {}:{}",
                    self.server.bind_address, self.server.bind_port
                )
            })
    }

    /// Validates the configuration for correctness and consistency.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("No nodes configured".to_string());
        }

        let mut names = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err("Node name must not be empty".to_string());
            }
            if !names.insert(node.name.as_str()) {
                return Err(format!("Duplicate node name: {}", node.name));
            }
            validate_url(&node.name, &node.http_url, &["http", "https"])?;
            if let Some(ws_url) = &node.ws_url {
                validate_url(&node.name, ws_url, &["ws", "wss"])?;
            }
            if node.probe_interval_ms == Some(0) {
                return Err(format!("Probe interval of node {} must be greater than 0", node.name));
            }
        }

        let Some(monitoring) = &self.monitoring else {
            return Err(
                "Missing [monitoring] section: lag_threshold, probe_interval_ms, backoff_base_ms \
                 and backoff_max_ms must be configured"
                    .to_string(),
            );
        };
        for (field, value) in [
            ("probe_interval_ms", monitoring.probe_interval_ms),
            ("backoff_base_ms", monitoring.backoff_base_ms),
            ("backoff_max_ms", monitoring.backoff_max_ms),
            ("probe_timeout_ms", monitoring.probe_timeout_ms),
            ("dial_timeout_ms", monitoring.dial_timeout_ms),
            ("close_timeout_ms", monitoring.close_timeout_ms),
        ] {
            if value == 0 {
                return Err(format!("monitoring.{field} must be greater than 0"));
            }
        }
        if monitoring.poll_interval_ms == Some(0) {
            return Err("monitoring.poll_interval_ms must be greater than 0".to_string());
        }
        if monitoring.no_new_heads_threshold_ms == Some(0) {
            return Err("monitoring.no_new_heads_threshold_ms must be greater than 0".to_string());
        }
        if monitoring.probe_failure_threshold == 0 {
            return Err("monitoring.probe_failure_threshold must be greater than 0".to_string());
        }
        monitoring.backoff().validate()?;

        self.pool_config().validate()?;

        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json' or 'pretty'".to_string());
        }
        if self.server.bind_port == 0 {
            return Err("Bind port must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Runtime pool settings.
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            chain_id: ChainId(self.pool.chain_id),
            selection_mode: self.pool.selection_mode,
            max_call_attempts: self.pool.max_call_attempts,
            call_timeout: Duration::from_millis(self.pool.call_timeout_ms),
            subscription_buffer: self.pool.subscription_buffer,
        }
    }

    /// Runtime node configurations, with per-node overrides applied.
    ///
    /// # Errors
    ///
    /// Returns an error string if the `[monitoring]` section is missing.
    pub fn node_configs(&self) -> Result<Vec<NodeConfig>, String> {
        let monitoring = self.monitoring.as_ref().ok_or("Missing [monitoring] section")?;

        Ok(self
            .nodes
            .iter()
            .map(|node| {
                NodeConfig::new(
                    node.name.clone(),
                    node.order,
                    ChainId(node.chain_id),
                    node.lag_threshold.unwrap_or(monitoring.lag_threshold),
                    Duration::from_millis(node.probe_interval_ms.unwrap_or(monitoring.probe_interval_ms)),
                    monitoring.backoff(),
                )
                .with_timeouts(
                    Duration::from_millis(monitoring.dial_timeout_ms),
                    Duration::from_millis(monitoring.probe_timeout_ms),
                    Duration::from_millis(monitoring.close_timeout_ms),
                )
                .with_probe_failure_threshold(monitoring.probe_failure_threshold)
                .with_poll_interval(monitoring.poll_interval_ms.map(Duration::from_millis))
                .with_no_new_heads_threshold(
                    monitoring.no_new_heads_threshold_ms.map(Duration::from_millis),
                )
            })
            .collect())
    }
}

impl MonitoringConfig {
    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
        .with_jitter(self.jitter_factor)
        .with_max_attempts(self.max_redial_attempts)
    }
}

fn validate_url(node: &str, raw: &str, schemes: &[&str]) -> Result<(), String> {
    let url = Url::parse(raw).map_err(|e| format!("Invalid URL for node {node}: {raw} ({e})"))?;
    if !schemes.contains(&url.scheme()) {
        return Err(format!(
            "Invalid URL scheme for node {node}: {raw} (expected one of {})",
            schemes.join(", ")
        ));
    }
    Ok(())
}
