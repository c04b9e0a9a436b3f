use crate::chain::Head;
use dashmap::DashMap;
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::{
    sync::{broadcast, mpsc},
    task::AbortHandle,
};
use tracing::warn;

/// Caller subscriptions forwarded through one node.
///
/// Each subscription is a forwarding task from the node's head broadcast into a
/// dedicated channel. Aborting the task closes the caller's channel, which is how
/// subscriptions are detached on failover. The node's own monitoring subscription
/// never goes through this registry.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_id: AtomicU64,
    tasks: DashMap<u64, AbortHandle>,
}

impl SubscriptionRegistry {
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        node: Arc<str>,
        heads: &broadcast::Sender<Head>,
        buffer: usize,
    ) -> NodeSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut source = heads.subscribe();
        let (tx, rx) = mpsc::channel(buffer.max(1));

        let task = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(head) => {
                        if tx.send(head).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(node = %node, skipped, "head subscriber lagged, skipping heads");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.tasks.insert(id, task.abort_handle());
        NodeSubscription { id, rx, registry: Arc::clone(self) }
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Aborts every caller subscription. Returns how many were detached.
    pub(crate) fn detach_all(&self) -> usize {
        let ids: Vec<u64> = self.tasks.iter().map(|entry| *entry.key()).collect();
        let mut detached = 0;
        for id in ids {
            if let Some((_, task)) = self.tasks.remove(&id) {
                task.abort();
                detached += 1;
            }
        }
        detached
    }

    fn remove(&self, id: u64) {
        if let Some((_, task)) = self.tasks.remove(&id) {
            task.abort();
        }
    }
}

/// Head subscription on a single node.
///
/// Yields `None` once the node detaches its caller subscriptions, which happens
/// when the node leaves `Alive` or is closed. Dropping the subscription
/// unregisters it.
pub struct NodeSubscription {
    id: u64,
    rx: mpsc::Receiver<Head>,
    registry: Arc<SubscriptionRegistry>,
}

impl NodeSubscription {
    /// Receives the next head, or `None` once detached.
    pub async fn recv(&mut self) -> Option<Head> {
        self.rx.recv().await
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl futures::Stream for NodeSubscription {
    type Item = Head;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Head>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for NodeSubscription {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
