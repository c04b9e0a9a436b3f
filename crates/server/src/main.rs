use anyhow::Result;
use axum::serve;
use meridian_core::{
    config::AppConfig,
    evm::EvmClient,
    metrics::init_metrics,
    pool::{Pool, PoolBuilder},
};
use rustls::crypto::{ring::default_provider, CryptoProvider};
use server::{
    init_logging,
    router::{create_router, AppState},
};
use std::{sync::Arc, time::Duration};
use tokio::signal;
use tracing::{debug, error, info};

/// Builds one [`EvmClient`] per configured node and the pool over them.
fn init_pool(
    config: &AppConfig,
    metrics: Option<Arc<meridian_core::metrics::MetricsCollector>>,
) -> Result<Arc<Pool<EvmClient>>> {
    let pool_config = config.pool_config();
    let node_configs =
        config.node_configs().map_err(|e| anyhow::anyhow!("Invalid node configuration: {e}"))?;

    let mut builder = PoolBuilder::new(pool_config.clone());
    for (endpoint, node_config) in config.nodes.iter().zip(node_configs) {
        let client = EvmClient::new(
            &endpoint.name,
            &endpoint.http_url,
            endpoint.ws_url.as_deref(),
            pool_config.call_timeout,
        )
        .map_err(|e| anyhow::anyhow!("Failed to create client for {}: {e}", endpoint.name))?;
        builder = builder.node(node_config, Arc::new(client));
    }
    if let Some(metrics) = metrics {
        builder = builder.metrics(metrics);
    }

    let pool = builder.build().map_err(|e| anyhow::anyhow!("Failed to build pool: {e}"))?;
    Ok(Arc::new(pool))
}

#[tokio::main]
async fn main() -> Result<()> {
    CryptoProvider::install_default(default_provider())
        .map_err(|e| anyhow::anyhow!("Failed to install crypto provider: {e:?}"))?;

    let config =
        AppConfig::load().map_err(|e| anyhow::anyhow!("Failed to load configuration: {e}"))?;
    config.validate().map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

    init_logging(&config.logging);
    info!(environment = %config.environment, "Starting Meridian");
    debug!(
        nodes_count = config.nodes.len(),
        chain_id = config.pool.chain_id,
        selection_mode = %config.pool.selection_mode,
        bind_port = config.server.bind_port,
        "Configuration loaded"
    );

    let metrics = config.metrics.enabled.then(init_metrics);
    let pool = init_pool(&config, metrics.clone())?;
    pool.start().map_err(|e| anyhow::anyhow!("Failed to start pool: {e}"))?;
    info!(chain_id = %pool.chain_id(), nodes = pool.nodes().len(), "Pool started");

    let app = create_router(AppState { pool: Arc::clone(&pool), metrics });
    let addr = config.socket_addr().map_err(|e| anyhow::anyhow!(e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Server listening");

    if let Err(e) = serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %e, "Server error occurred");
    }

    let close_timeout = Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS);
    match tokio::time::timeout(close_timeout, pool.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Pool shutdown failed"),
        Err(_) => error!("Pool shutdown timed out"),
    }
    info!("Server shutdown complete");

    Ok(())
}

/// Upper bound on closing the pool after the HTTP server stops.
const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(
                error = %e,
                "Failed to install Ctrl+C handler"
            );
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(
                    error = %e,
                    "Failed to install signal handler"
                );

                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, closing pool");
}
