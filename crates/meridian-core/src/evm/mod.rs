//! [`NodeClient`] binding for Ethereum JSON-RPC endpoints.
//!
//! Requests go over HTTP with `reqwest` (rustls); head subscriptions use
//! `eth_subscribe("newHeads")` over a WebSocket when one is configured.
//!
//! | Capability | Method |
//! |------------|--------|
//! | `dial`, `ping` | `web3_clientVersion` |
//! | `chain_id` | `eth_chainId` |
//! | `latest_head` | `eth_getBlockByNumber("latest", false)` |
//! | `latest_finalized_block` | `eth_getBlockByNumber("finalized", false)`, `latest` if the tag is rejected |
//! | `is_syncing` | `eth_syncing` |
//! | `subscribe_new_heads` | `eth_subscribe("newHeads")` |
//!
//! A JSON-RPC error answer to a reachability probe still proves the endpoint is up,
//! so `dial` and `ping` only fail on transport errors.

mod block;
mod ws;

use crate::{
    chain::{ChainId, Head},
    client::{ClientError, HeadStream, NodeClient, RpcErrorCategory},
    types::{parse_hex_u64, JsonRpcRequest, JsonRpcResponse},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{header::CONTENT_TYPE, Client, ClientBuilder};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// Longest error body kept in [`ClientError::HttpError`].
const MAX_ERROR_BODY: usize = 256;

/// Ethereum JSON-RPC client for one endpoint.
pub struct EvmClient {
    name: Arc<str>,
    http_url: String,
    ws_url: Option<String>,
    http: Client,
    request_timeout: Duration,
    next_id: AtomicU64,
    subscription: Mutex<Option<AbortHandle>>,
}

impl EvmClient {
    /// Creates a client. No connection is made until the first request.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn new(
        name: &str,
        http_url: &str,
        ws_url: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(16)
            .connect_timeout(request_timeout.min(Duration::from_secs(5)))
            .timeout(request_timeout)
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("meridian/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                ClientError::ConnectionFailed(format!("HTTP client build failed: {e}"))
            })?;

        Ok(Self {
            name: Arc::from(name),
            http_url: http_url.to_string(),
            ws_url: ws_url.map(str::to_string),
            http,
            request_timeout,
            next_id: AtomicU64::new(1),
            subscription: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends one JSON-RPC request and decodes its result.
    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(method, Some(params), json!(id));
        let body = serde_json::to_vec(&request)
            .map_err(|e| ClientError::InvalidResponse(format!("failed to encode {method}: {e}")))?;

        trace!(node = %self.name, method, id, "sending request");
        let response = self
            .http
            .post(&self.http_url)
            .header(CONTENT_TYPE, "application/json")
            .body(bytes::Bytes::from(body))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| map_network_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let mut text = response.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(ClientError::HttpError(status.as_u16(), text));
        }

        let bytes = response.bytes().await.map_err(|e| map_network_error(&e))?;
        let response: JsonRpcResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::InvalidResponse(format!("{method}: {e}")))?;

        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error.code, error.message));
        }
        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(|e| ClientError::InvalidResponse(format!("{method}: {e}")))
    }

    async fn block_head(&self, tag: &str) -> Result<Head, ClientError> {
        let block: Value = self.request("eth_getBlockByNumber", json!([tag, false])).await?;
        block::head_from_value(block)
    }

    /// Reachability check that treats a JSON-RPC error answer as reachable.
    async fn reach(&self) -> Result<(), ClientError> {
        match self.request::<Value>("web3_clientVersion", json!([])).await {
            Ok(_) | Err(ClientError::Rpc(..)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Maps reqwest failures without leaking request details.
fn map_network_error(error: &reqwest::Error) -> ClientError {
    if error.is_timeout() {
        return ClientError::Timeout;
    }
    let reason = if error.is_connect() {
        "connection refused or unreachable"
    } else if error.is_request() {
        "request failed"
    } else if error.is_body() {
        "response body error"
    } else if error.is_decode() {
        "response decode error"
    } else {
        "network error"
    };
    ClientError::ConnectionFailed(reason.to_string())
}

#[async_trait]
impl NodeClient for EvmClient {
    async fn dial(&self) -> Result<(), ClientError> {
        self.reach().await
    }

    async fn close(&self) -> Result<(), ClientError> {
        if let Some(task) = self.subscription.lock().take() {
            task.abort();
            debug!(node = %self.name, "websocket subscription closed");
        }
        Ok(())
    }

    async fn chain_id(&self) -> Result<ChainId, ClientError> {
        let raw: String = self.request("eth_chainId", json!([])).await?;
        parse_hex_u64(&raw)
            .map(ChainId)
            .map_err(|e| ClientError::InvalidResponse(format!("eth_chainId: {e}")))
    }

    async fn latest_head(&self) -> Result<Head, ClientError> {
        self.block_head("latest").await
    }

    async fn latest_finalized_block(&self) -> Result<u64, ClientError> {
        match self.block_head("finalized").await {
            Ok(head) => Ok(head.number),
            Err(ClientError::InvalidResponse(_)) => self.block_head("latest").await.map(|h| h.number),
            Err(e) if e.rpc_category() == Some(RpcErrorCategory::ClientError) => {
                debug!(node = %self.name, error = %e, "finalized tag rejected, using latest");
                self.block_head("latest").await.map(|h| h.number)
            }
            Err(e) => Err(e),
        }
    }

    async fn subscribe_new_heads(&self) -> Result<HeadStream, ClientError> {
        let Some(ws_url) = self.ws_url.as_deref() else {
            return Err(ClientError::Unsupported("no websocket endpoint configured".to_string()));
        };

        let (stream, task) = ws::subscribe_new_heads(Arc::clone(&self.name), ws_url).await?;
        if let Some(previous) = self.subscription.lock().replace(task) {
            previous.abort();
        }
        Ok(stream)
    }

    async fn is_syncing(&self) -> Result<bool, ClientError> {
        match self.request::<Value>("eth_syncing", json!([])).await? {
            Value::Bool(syncing) => Ok(syncing),
            Value::Object(_) => Ok(true),
            other => Err(ClientError::InvalidResponse(format!("eth_syncing: unexpected {other}"))),
        }
    }

    async fn ping(&self) -> Result<(), ClientError> {
        self.reach().await
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.request(method, params).await
    }
}

impl std::fmt::Debug for EvmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmClient")
            .field("name", &self.name)
            .field("websocket", &self.ws_url.is_some())
            .finish_non_exhaustive()
    }
}
