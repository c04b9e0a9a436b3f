use super::{Node, NodeError, NodeState};
use crate::{
    chain::{ChainInfo, Head},
    client::{ClientError, HeadStream, NodeClient},
};
use futures::StreamExt;
use std::{
    future::Future,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio::{
    sync::watch,
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};

/// Where the monitoring loop gets heads from.
enum HeadSource {
    Subscription(HeadStream),
    Polling(Duration),
}

/// Why the monitoring phase ended.
enum MonitorExit {
    Shutdown,
    Unreachable,
}

/// Resolves once shutdown is signalled or the sender is gone.
///
/// Returns `()` so that no borrow of the channel value lives in a `select!` output.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    tokio::time::timeout(limit, call).await.unwrap_or(Err(ClientError::Timeout))
}

async fn next_head(stream: &mut Option<HeadStream>) -> Option<Result<Head, ClientError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn poll_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(poll) => {
            poll.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn delayed_interval(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn keep_first(slot: &mut Option<NodeError>, error: NodeError) {
    if slot.is_none() {
        *slot = Some(error);
    }
}

impl<C: NodeClient> Node<C> {
    /// Starts the monitoring loop.
    ///
    /// Idempotent. Fails only if the node was closed or its configuration is invalid.
    /// A node already in a fatal state is left as is.
    pub fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NodeError::Closed);
        }
        self.config.validate()?;

        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let state = self.state();
        if state.is_fatal() {
            debug!(node = %self.name, state = %state, "not starting node in fatal state");
            return Ok(());
        }

        let node = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move { node.run(shutdown).await });
        *self.task.lock() = Some(handle);

        info!(node = %self.name, order = self.config.order, chain_id = %self.config.chain_id, "node started");
        Ok(())
    }

    /// Stops monitoring, detaches subscribers, closes the transport and moves to `Closed`.
    ///
    /// Teardown continues past failures; the first one is returned. Only the first
    /// call does any work.
    pub async fn close(&self) -> Result<(), NodeError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let mut first_error = None;
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            match tokio::time::timeout(self.config.close_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => {
                    error!(node = %self.name, error = %e, "monitoring task failed");
                    keep_first(&mut first_error, NodeError::TaskFailed(e.to_string()));
                }
                Err(_) => {
                    task.abort();
                    warn!(
                        node = %self.name,
                        timeout_ms = self.config.close_timeout.as_millis(),
                        "monitoring task did not stop in time, aborted"
                    );
                    keep_first(&mut first_error, NodeError::ShutdownTimeout(self.config.close_timeout));
                }
            }
        }

        self.unsubscribe_all_except_alive_loop();

        if let Err(e) = self.client.close().await {
            warn!(node = %self.name, error = %e, "failed to close transport");
            keep_first(&mut first_error, NodeError::Client(e));
        }

        self.transition(NodeState::Closed, None);
        first_error.map_or(Ok(()), Err)
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.transition(NodeState::Dialing, None) {
            return;
        }

        let mut redials: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.state() {
                NodeState::Dialing => {
                    let source = tokio::select! {
                        biased;
                        () = shutdown_requested(&mut shutdown) => break,
                        source = self.dial() => source,
                    };
                    let Some(source) = source else { continue };

                    redials = 0;
                    self.evaluate(None, Instant::now());
                    if let MonitorExit::Shutdown = self.monitor(source, &mut shutdown).await {
                        break;
                    }
                }
                NodeState::Unreachable => {
                    if self.config.backoff.is_exhausted(redials) {
                        warn!(node = %self.name, attempts = redials, "redial attempts exhausted");
                        break;
                    }
                    let delay = self.config.backoff.delay(redials);
                    redials += 1;
                    debug!(
                        node = %self.name,
                        attempt = redials,
                        delay_ms = delay.as_millis(),
                        "scheduling redial"
                    );

                    tokio::select! {
                        biased;
                        () = shutdown_requested(&mut shutdown) => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                    self.transition(NodeState::Dialing, None);
                }
                state => {
                    debug!(node = %self.name, state = %state, "monitoring loop exiting");
                    break;
                }
            }
        }
    }

    /// Dials the endpoint and takes the initial observation.
    ///
    /// Returns the head source on success; on failure the node has already been
    /// moved to `Unreachable` or a fatal state.
    async fn dial(&self) -> Option<HeadSource> {
        let probe_timeout = self.config.probe_timeout;

        if let Err(e) = with_timeout(self.config.dial_timeout, self.client.dial()).await {
            return self.dial_failed("dial", e).await;
        }

        let chain_id = match with_timeout(probe_timeout, self.client.chain_id()).await {
            Ok(chain_id) => chain_id,
            Err(e) => return self.dial_failed("chain_id", e).await,
        };
        if chain_id != self.config.chain_id {
            error!(
                node = %self.name,
                expected = %self.config.chain_id,
                actual = %chain_id,
                "endpoint serves a different chain"
            );
            self.transition(NodeState::InvalidChainId, None);
            self.close_transport().await;
            return None;
        }

        let head = match with_timeout(probe_timeout, self.client.latest_head()).await {
            Ok(head) => head,
            Err(e) => return self.dial_failed("latest_head", e).await,
        };
        let finalized = match with_timeout(probe_timeout, self.client.latest_finalized_block()).await
        {
            Ok(finalized) => finalized,
            Err(e) => return self.dial_failed("latest_finalized_block", e).await,
        };

        let source = match with_timeout(probe_timeout, self.client.subscribe_new_heads()).await {
            Ok(stream) => HeadSource::Subscription(stream),
            Err(ClientError::Unsupported(reason)) => {
                if let Some(poll_interval) = self.config.poll_interval {
                    debug!(node = %self.name, reason = %reason, "head subscriptions unsupported, polling");
                    HeadSource::Polling(poll_interval)
                } else {
                    return self.dial_failed("subscribe_new_heads", ClientError::Unsupported(reason)).await;
                }
            }
            Err(e) => return self.dial_failed("subscribe_new_heads", e).await,
        };

        let chain_info = ChainInfo::new(head.number, finalized);
        if !self.transition(NodeState::Alive, Some(chain_info)) {
            return None;
        }
        Some(source)
    }

    async fn dial_failed(&self, step: &'static str, error: ClientError) -> Option<HeadSource> {
        if let ClientError::Unsupported(reason) = &error {
            error!(node = %self.name, step, reason = %reason, "endpoint lacks a required capability");
            self.transition(NodeState::Unusable, None);
        } else {
            warn!(node = %self.name, step, error = %error, "dial failed");
            self.transition(NodeState::Unreachable, None);
        }
        self.close_transport().await;
        None
    }

    async fn close_transport(&self) {
        if let Err(e) = self.client.close().await {
            debug!(node = %self.name, error = %e, "failed to close transport");
        }
    }

    async fn become_unreachable(&self, reason: &str) {
        warn!(node = %self.name, reason, "node unreachable");
        self.transition(NodeState::Unreachable, None);
        self.close_transport().await;
    }

    /// Follows heads and probes the endpoint while the node is in a monitored state.
    async fn monitor(&self, source: HeadSource, shutdown: &mut watch::Receiver<bool>) -> MonitorExit {
        let (mut stream, mut poll) = match source {
            HeadSource::Subscription(stream) => (Some(stream), None),
            HeadSource::Polling(period) => (None, Some(delayed_interval(period))),
        };
        let mut probes = delayed_interval(self.config.probe_interval);
        let mut last_head_at = Instant::now();
        let mut failed_probes: u32 = 0;

        loop {
            tokio::select! {
                biased;
                () = shutdown_requested(shutdown) => return MonitorExit::Shutdown,
                next = next_head(&mut stream) => match next {
                    Some(Ok(head)) => {
                        if self.record_head(&head).is_some() {
                            last_head_at = Instant::now();
                            trace!(node = %self.name, block_number = head.number, "new head");
                        }
                        self.evaluate(None, last_head_at);
                    }
                    Some(Err(e)) => {
                        self.become_unreachable(&format!("head subscription failed: {e}")).await;
                        return MonitorExit::Unreachable;
                    }
                    None => {
                        self.become_unreachable("head subscription ended").await;
                        return MonitorExit::Unreachable;
                    }
                },
                () = poll_tick(&mut poll) => {
                    match with_timeout(self.config.probe_timeout, self.client.latest_head()).await {
                        Ok(head) => {
                            failed_probes = 0;
                            if self.record_head(&head).is_some() {
                                last_head_at = Instant::now();
                                trace!(node = %self.name, block_number = head.number, "polled new head");
                            }
                        }
                        Err(e) => {
                            failed_probes += 1;
                            debug!(node = %self.name, error = %e, failed_probes, "head poll failed");
                        }
                    }
                    self.evaluate(None, last_head_at);
                }
                _ = probes.tick() => match self.probe().await {
                    Ok(syncing) => {
                        failed_probes = 0;
                        self.evaluate(syncing, last_head_at);
                    }
                    Err(e) => {
                        failed_probes += 1;
                        debug!(node = %self.name, error = %e, failed_probes, "liveness probe failed");
                    }
                },
            }

            if failed_probes >= self.config.probe_failure_threshold {
                self.become_unreachable(&format!("{failed_probes} consecutive probes failed")).await;
                return MonitorExit::Unreachable;
            }
            if !self.state().is_monitored() {
                return MonitorExit::Shutdown;
            }
        }
    }

    /// Pings the endpoint and refreshes finality.
    ///
    /// Returns the reported sync status, `None` when it could not be determined.
    async fn probe(&self) -> Result<Option<bool>, ClientError> {
        let limit = self.config.probe_timeout;
        with_timeout(limit, self.client.ping()).await?;

        match with_timeout(limit, self.client.latest_finalized_block()).await {
            Ok(finalized) => self.record_finalized(finalized),
            Err(e) => debug!(node = %self.name, error = %e, "finality refresh failed"),
        }

        match with_timeout(limit, self.client.is_syncing()).await {
            Ok(syncing) => Ok(Some(syncing)),
            Err(e) => {
                debug!(node = %self.name, error = %e, "sync status unavailable");
                Ok(None)
            }
        }
    }

    /// Applies the freshness rules to the current snapshot.
    fn evaluate(&self, syncing: Option<bool>, last_head_at: Instant) {
        let (state, chain_info) = self.state_and_latest();
        let highest = self.highest_alive().unwrap_or_default();
        let lagging = chain_info.block_number.saturating_add(self.config.lag_threshold) <
            highest.block_number;
        let stalled = self.config.no_new_heads_threshold.is_some_and(|t| last_head_at.elapsed() > t);

        let next = match (state, syncing) {
            (NodeState::Alive | NodeState::OutOfSync | NodeState::Syncing, Some(true)) => {
                NodeState::Syncing
            }
            (NodeState::Alive, _) if lagging || stalled => NodeState::OutOfSync,
            (NodeState::OutOfSync, _) if !lagging && !stalled => NodeState::Alive,
            (NodeState::Syncing, Some(false)) if lagging || stalled => NodeState::OutOfSync,
            (NodeState::Syncing, Some(false)) => NodeState::Alive,
            _ => return,
        };
        if next == state {
            return;
        }

        debug!(
            node = %self.name,
            blocks_behind = chain_info.blocks_behind(&highest),
            lag_threshold = self.config.lag_threshold,
            stalled,
            syncing = ?syncing,
            "freshness changed"
        );
        self.transition(next, None);
    }
}
