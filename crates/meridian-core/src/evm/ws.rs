//! `newHeads` subscriptions over WebSocket.

use super::block::head_from_value;
use crate::{
    chain::Head,
    client::{ClientError, HeadStream},
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::{sync::mpsc, task::AbortHandle};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const SUBSCRIBE_REQUEST_ID: u64 = 1;
const NOTIFICATION_BUFFER: usize = 64;

/// Opens a WebSocket, subscribes to `newHeads` and waits for the confirmation.
///
/// Returns the head stream and a handle to the reader task that feeds it. Aborting
/// the task ends the stream.
pub(super) async fn subscribe_new_heads(
    node: Arc<str>,
    ws_url: &str,
) -> Result<(HeadStream, AbortHandle), ClientError> {
    let (ws_stream, response) = tokio_tungstenite::connect_async(ws_url)
        .await
        .map_err(|e| ClientError::ConnectionFailed(format!("websocket connection failed: {e}")))?;
    debug!(node = %node, status = response.status().as_u16(), "websocket connected");

    let (mut write, mut read) = ws_stream.split();

    let subscribe = json!({
        "jsonrpc": "2.0",
        "id": SUBSCRIBE_REQUEST_ID,
        "method": "eth_subscribe",
        "params": ["newHeads"]
    });
    write
        .send(Message::Text(subscribe.to_string().into()))
        .await
        .map_err(|e| ClientError::ConnectionFailed(format!("websocket send error: {e}")))?;

    let subscription_id = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let Ok(message) = serde_json::from_str::<Value>(&text) else {
                    warn!(node = %node, message = %text.as_str(), "failed to parse websocket message");
                    continue;
                };
                if let Some(confirmed) = subscription_confirmation(&message)? {
                    break confirmed;
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ClientError::ConnectionFailed(
                    "websocket closed before the subscription was confirmed".to_string(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(ClientError::ConnectionFailed(format!("websocket error: {e}")));
            }
        }
    };
    info!(node = %node, subscription_id = %subscription_id, "newHeads subscription confirmed");

    let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let task = tokio::spawn(async move {
        // The sink has to outlive the reader or the server sees the socket close.
        let _write = write;

        while let Some(message) = read.next().await {
            let item = match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => match head_notification(&value, &subscription_id) {
                        Ok(Some(head)) => Ok(head),
                        Ok(None) => continue,
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(ClientError::InvalidResponse(format!("websocket message: {e}"))),
                },
                Ok(Message::Close(_)) => {
                    warn!(node = %node, "websocket connection closed");
                    break;
                }
                Ok(_) => continue,
                Err(e) => Err(ClientError::ConnectionFailed(format!("websocket error: {e}"))),
            };

            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();
    Ok((stream, task.abort_handle()))
}

/// Returns the subscription id if `message` answers the subscribe request.
fn subscription_confirmation(message: &Value) -> Result<Option<String>, ClientError> {
    if message.get("id").and_then(Value::as_u64) != Some(SUBSCRIBE_REQUEST_ID) {
        return Ok(None);
    }
    if let Some(error) = message.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
        let text = error.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
        // -32601: method not found
        if code == -32601 {
            return Err(ClientError::Unsupported(format!("eth_subscribe: {text}")));
        }
        return Err(ClientError::Rpc(i32::try_from(code).unwrap_or(i32::MIN), text));
    }
    match message.get("result").and_then(Value::as_str) {
        Some(id) => Ok(Some(id.to_string())),
        None => Err(ClientError::InvalidResponse("subscription id missing".to_string())),
    }
}

/// Extracts the head of an `eth_subscription` notification for `subscription_id`.
fn head_notification(message: &Value, subscription_id: &str) -> Result<Option<Head>, ClientError> {
    if message.get("method").and_then(Value::as_str) != Some("eth_subscription") {
        return Ok(None);
    }
    let Some(params) = message.get("params") else { return Ok(None) };
    if params.get("subscription").and_then(Value::as_str) != Some(subscription_id) {
        return Ok(None);
    }
    let result = params.get("result").cloned().unwrap_or(Value::Null);
    head_from_value(result).map(Some)
}
