use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use meridian_core::{
    chain::ChainInfo,
    client::NodeClient,
    metrics::MetricsCollector,
    node::{NodeState, StateTransition},
    pool::{HealthReport, Pool},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

/// Transitions rendered per node by `/chain`.
const CHAIN_HISTORY_LIMIT: usize = 20;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared handler state.
pub struct AppState<C: NodeClient> {
    pub pool: Arc<Pool<C>>,
    pub metrics: Option<Arc<MetricsCollector>>,
}

impl<C: NodeClient> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self { pool: Arc::clone(&self.pool), metrics: self.metrics.clone() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Failing,
}

/// One component of a `?full` health or readiness answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksResponse {
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeChainView {
    pub name: String,
    pub order: i32,
    pub state: NodeState,
    pub chain_info: ChainInfo,
    pub state_since: DateTime<Utc>,
    pub subscribers: usize,
    pub history: Vec<StateTransition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainResponse {
    pub chain_id: u64,
    pub active_node: Option<String>,
    pub live_nodes: usize,
    pub highest_alive: ChainInfo,
    pub highest_user_observations: ChainInfo,
    pub nodes: Vec<NodeChainView>,
}

/// Builds the router serving `/health`, `/readyz`, `/chain` and `/metrics`.
pub fn create_router<C: NodeClient>(state: AppState<C>) -> Router {
    Router::new()
        .route("/health", get(health::<C>))
        .route("/readyz", get(readyz::<C>))
        .route("/chain", get(chain::<C>))
        .route("/metrics", get(metrics::<C>))
        .with_state(state)
}

/// GET /health
///
/// 200 when every component of the pool's health report passes, 503 otherwise.
pub async fn health<C: NodeClient>(
    State(state): State<AppState<C>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let checks = health_checks(&state.pool.health_report());
    let passing = checks.iter().all(|check| check.status == CheckStatus::Passing);
    checks_response(passing, checks, params.contains_key("full"))
}

/// GET /readyz
///
/// 200 when the pool can route a call right now.
pub async fn readyz<C: NodeClient>(
    State(state): State<AppState<C>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let pool = &state.pool;
    let ready = pool.is_ready();
    let output = if ready {
        pool.active_node_name().map(|name| format!("active node {name}"))
    } else if pool.is_closed() {
        Some("pool closed".to_string())
    } else {
        Some(format!("no eligible node for chain {}", pool.chain_id()))
    };
    let check = Check {
        name: "pool.active_node".to_string(),
        status: if ready { CheckStatus::Passing } else { CheckStatus::Failing },
        output,
    };
    checks_response(ready, vec![check], params.contains_key("full"))
}

/// GET /chain
pub async fn chain<C: NodeClient>(State(state): State<AppState<C>>) -> Json<ChainResponse> {
    let pool = &state.pool;
    let (live_nodes, highest_alive) = pool.latest_chain_info();

    let nodes = pool
        .nodes()
        .iter()
        .map(|node| {
            let status = node.status();
            NodeChainView {
                name: status.name,
                order: status.order,
                state: status.state,
                chain_info: status.chain_info,
                state_since: status.state_since,
                subscribers: status.subscribers,
                history: node.state_history(CHAIN_HISTORY_LIMIT),
            }
        })
        .collect();

    Json(ChainResponse {
        chain_id: pool.chain_id().0,
        active_node: pool.active_node_name(),
        live_nodes,
        highest_alive,
        highest_user_observations: pool.highest_user_observations(),
        nodes,
    })
}

/// GET /metrics
pub async fn metrics<C: NodeClient>(State(state): State<AppState<C>>) -> Response {
    match &state.metrics {
        Some(metrics) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            metrics.get_prometheus_metrics(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

fn health_checks(report: &HealthReport) -> Vec<Check> {
    report
        .iter()
        .map(|(name, error)| Check {
            name: name.clone(),
            status: if error.is_some() { CheckStatus::Failing } else { CheckStatus::Passing },
            output: error.map(|e| e.to_string()),
        })
        .collect()
}

fn checks_response(passing: bool, checks: Vec<Check>, full: bool) -> Response {
    let status = if passing { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    if full {
        (status, Json(ChecksResponse { checks })).into_response()
    } else {
        let body = if passing { "ok" } else { "unavailable" };
        (status, body).into_response()
    }
}
