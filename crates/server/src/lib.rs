//! HTTP surface of a Meridian pool: health, readiness, chain state and metrics.

pub mod router;

use meridian_core::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system based on the configuration.
///
/// `RUST_LOG=debug` and `RUST_LOG=trace` are shortcuts that raise only the Meridian
/// crates; any other `RUST_LOG` value is used as a full filter directive.
pub fn init_logging(config: &LoggingConfig) {
    let filter = if let Ok(env_filter) = std::env::var("RUST_LOG") {
        if env_filter == "debug" {
            EnvFilter::new("warn,meridian_core=debug,server=debug,tests=debug")
        } else if env_filter == "trace" {
            EnvFilter::new("warn,meridian_core=trace,server=trace,tests=trace")
        } else {
            EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| default_filter(&config.level))
        }
    } else {
        default_filter(&config.level)
    };

    let registry = tracing_subscriber::registry().with(filter);

    if config.format.as_str() == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer().json();
        registry.with(fmt_layer).init();
    } else {
        // "pretty" and any other format default to pretty logging
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).init();
    }
}

fn default_filter(level: &str) -> EnvFilter {
    EnvFilter::new(format!("warn,meridian_core={level},server={level}"))
}
