use super::Pool;
use crate::{
    chain::{ChainInfo, Head},
    client::NodeClient,
    node::shutdown_requested,
    types::Hash32,
};
use std::{
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::AbortHandle,
};
use tracing::{debug, trace};

/// How long a degraded subscription waits before checking for an eligible node
/// again when no failover happened in the meantime.
const REATTACH_INTERVAL: Duration = Duration::from_millis(100);

/// Head subscription on a pool.
///
/// Survives failover: when the active node changes, the forwarding task moves to
/// the new node and this receiver keeps yielding heads. While the pool has no
/// eligible node the subscription stays open and waits. Heads below the pool's
/// user observation watermark are never delivered.
///
/// Yields `None` only once the pool is closed or dropped.
pub struct PoolSubscription {
    rx: mpsc::Receiver<Head>,
    task: AbortHandle,
}

impl PoolSubscription {
    pub(super) fn spawn<C: NodeClient>(pool: &Arc<Pool<C>>) -> Self {
        let (tx, rx) = mpsc::channel(pool.config.subscription_buffer.max(1));
        let generations = pool.active_generation.subscribe();
        let shutdown = pool.shutdown.subscribe();
        let task = tokio::spawn(forward(Arc::downgrade(pool), tx, generations, shutdown));
        Self { rx, task: task.abort_handle() }
    }

    /// Receives the next head, or `None` once the pool is gone.
    pub async fn recv(&mut self) -> Option<Head> {
        self.rx.recv().await
    }
}

impl futures::Stream for PoolSubscription {
    type Item = Head;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Head>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for PoolSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Forwards heads from whichever node is active into `tx`.
async fn forward<C: NodeClient>(
    pool: Weak<Pool<C>>,
    tx: mpsc::Sender<Head>,
    mut generations: watch::Receiver<u64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_delivered: Option<(u64, Hash32)> = None;
    let mut attached_before = false;

    loop {
        let attached = {
            let Some(pool) = pool.upgrade() else { return };
            if pool.is_closed() {
                return;
            }
            let selected = pool.current_or_reselect();
            generations.borrow_and_update();
            // A failover that raced the selection above is picked up on the next pass.
            let current = pool.active_node();
            let settled = match (&selected, &current) {
                (Some(selected), Some(current)) => Arc::ptr_eq(selected, current),
                (None, None) => true,
                _ => false,
            };
            if !settled {
                continue;
            }
            selected.and_then(|node| match node.subscribe_new_heads() {
                Ok(subscription) => Some((node, subscription)),
                Err(e) => {
                    debug!(node = %node.name(), error = %e, "active node rejected subscription");
                    None
                }
            })
        };

        let Some((node, mut subscription)) = attached else {
            tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => return,
                () = tx.closed() => return,
                changed = generations.changed() => if changed.is_err() { return },
                () = tokio::time::sleep(REATTACH_INTERVAL) => {}
            }
            continue;
        };

        if attached_before {
            if let Some(pool) = pool.upgrade() {
                if let Some(metrics) = &pool.metrics {
                    metrics.record_subscription_rehome();
                }
            }
            debug!(node = %node.name(), "pool subscription re-homed");
        } else {
            debug!(node = %node.name(), "pool subscription attached");
        }
        attached_before = true;

        loop {
            tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => return,
                () = tx.closed() => return,
                changed = generations.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                head = subscription.recv() => {
                    let Some(head) = head else { break };
                    if last_delivered == Some((head.number, head.hash)) {
                        continue;
                    }

                    let Some(pool) = pool.upgrade() else { return };
                    let watermark = pool.highest_user_observations();
                    if head.number < watermark.block_number {
                        trace!(
                            node = %node.name(),
                            block_number = head.number,
                            watermark = watermark.block_number,
                            "skipping head below user observations"
                        );
                        continue;
                    }

                    let finalized = node.state_and_latest().1.finalized_block_number;
                    pool.aggregator.observe(ChainInfo::new(head.number, finalized));
                    drop(pool);

                    if tx.send(head).await.is_err() {
                        return;
                    }
                    last_delivered = Some((head.number, head.hash));
                }
            }
        }
    }
}
