//! Scripted [`NodeClient`] for driving the node state machine without a network.
//!
//! Every capability answers from shared in-memory state that tests change while a
//! node is running: reachability, chain id, head and finality, sync status,
//! subscription support and queued call results.

use async_trait::async_trait;
use futures::{channel::mpsc, StreamExt};
use meridian_core::{
    chain::{ChainId, Head},
    client::{ClientError, HeadStream, NodeClient},
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

struct MockState {
    reachable: bool,
    chain_id: ChainId,
    head: Head,
    finalized: u64,
    syncing: bool,
    subscriptions_supported: bool,
    subscribers: Vec<mpsc::UnboundedSender<Result<Head, ClientError>>>,
    call_results: VecDeque<Result<Value, ClientError>>,
    call_delay: Option<Duration>,
    failing_head_reads: usize,
}

/// In-memory endpoint. Cheap to share as `Arc<MockNodeClient>`.
pub struct MockNodeClient {
    name: String,
    state: Mutex<MockState>,
    dials: AtomicUsize,
    closes: AtomicUsize,
    calls: AtomicUsize,
}

impl MockNodeClient {
    /// Reachable endpoint on `chain_id` at head `block_number` that supports
    /// head subscriptions.
    #[must_use]
    pub fn new(name: &str, chain_id: ChainId, block_number: u64) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MockState {
                reachable: true,
                chain_id,
                head: Head::at(block_number),
                finalized: block_number.saturating_sub(10),
                syncing: false,
                subscriptions_supported: true,
                subscribers: Vec::new(),
                call_results: VecDeque::new(),
                call_delay: None,
                failing_head_reads: 0,
            }),
            dials: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn without_subscriptions(self) -> Self {
        self.state.lock().subscriptions_supported = false;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the endpoint unreachable or reachable again. Going unreachable ends
    /// every open head stream.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock();
        state.reachable = reachable;
        if !reachable {
            state.subscribers.clear();
        }
    }

    /// Advances the head and notifies open subscriptions.
    pub fn push_head(&self, block_number: u64) {
        let mut state = self.state.lock();
        let head = Head::at(block_number);
        state.head = head;
        state.subscribers.retain(|tx| tx.unbounded_send(Ok(head)).is_ok());
    }

    /// Sets the head returned by polling without notifying subscriptions.
    pub fn set_head(&self, block_number: u64) {
        self.state.lock().head = Head::at(block_number);
    }

    /// Fails the next `count` head reads while every other capability keeps answering.
    pub fn fail_head_reads(&self, count: usize) {
        self.state.lock().failing_head_reads = count;
    }

    #[must_use]
    pub fn pending_head_read_failures(&self) -> usize {
        self.state.lock().failing_head_reads
    }

    /// Fails every open head stream with `error`.
    pub fn fail_subscriptions(&self, error: ClientError) {
        let mut state = self.state.lock();
        for tx in state.subscribers.drain(..) {
            let _ = tx.unbounded_send(Err(error.clone()));
        }
    }

    pub fn set_finalized(&self, block_number: u64) {
        self.state.lock().finalized = block_number;
    }

    pub fn set_syncing(&self, syncing: bool) {
        self.state.lock().syncing = syncing;
    }

    pub fn set_chain_id(&self, chain_id: ChainId) {
        self.state.lock().chain_id = chain_id;
    }

    /// Queues the result of the next `call`. Without queued results a call answers
    /// with the endpoint name.
    pub fn push_call_result(&self, result: Result<Value, ClientError>) {
        self.state.lock().call_results.push_back(result);
    }

    /// Delays every `call` by `delay`.
    pub fn set_call_delay(&self, delay: Option<Duration>) {
        self.state.lock().call_delay = delay;
    }

    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn open_subscriptions(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    fn ensure_reachable(&self) -> Result<(), ClientError> {
        if self.state.lock().reachable {
            Ok(())
        } else {
            Err(ClientError::ConnectionFailed(format!("{} is unreachable", self.name)))
        }
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn dial(&self) -> Result<(), ClientError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.ensure_reachable()
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.state.lock().subscribers.clear();
        Ok(())
    }

    async fn chain_id(&self) -> Result<ChainId, ClientError> {
        self.ensure_reachable()?;
        Ok(self.state.lock().chain_id)
    }

    async fn latest_head(&self) -> Result<Head, ClientError> {
        self.ensure_reachable()?;
        let mut state = self.state.lock();
        if state.failing_head_reads > 0 {
            state.failing_head_reads -= 1;
            return Err(ClientError::Timeout);
        }
        Ok(state.head)
    }

    async fn latest_finalized_block(&self) -> Result<u64, ClientError> {
        self.ensure_reachable()?;
        Ok(self.state.lock().finalized)
    }

    async fn subscribe_new_heads(&self) -> Result<HeadStream, ClientError> {
        self.ensure_reachable()?;
        let mut state = self.state.lock();
        if !state.subscriptions_supported {
            return Err(ClientError::Unsupported("newHeads".to_string()));
        }
        let (tx, rx) = mpsc::unbounded();
        state.subscribers.push(tx);
        Ok(rx.boxed())
    }

    async fn is_syncing(&self) -> Result<bool, ClientError> {
        self.ensure_reachable()?;
        Ok(self.state.lock().syncing)
    }

    async fn ping(&self) -> Result<(), ClientError> {
        self.ensure_reachable()
    }

    async fn call(&self, method: &str, _params: Value) -> Result<Value, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_reachable()?;

        let delay = self.state.lock().call_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.state.lock().call_results.pop_front();
        scripted.unwrap_or_else(|| Ok(json!({ "node": self.name, "method": method })))
    }
}
