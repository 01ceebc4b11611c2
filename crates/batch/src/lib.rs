//! kexp batch writer.
//!
//! Accumulates items and hands them to a [`BatchHandler`] as one group, either
//! when `batch_size` items are pending or every `interval`. The handler
//! reports success per item; failed items ride along with the next flush
//! until they have failed `max_retries + 1` times, then they are dropped.

#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::Duration;

use metrics::Counter;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_size: usize,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub interval: Duration,
    /// Upper bound for a single handler invocation.
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_retries: 3,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Caller-supplied flush handler.
///
/// Returns one flag per input item, `true` meaning delivered. Missing flags
/// count as failures.
#[async_trait::async_trait]
pub trait BatchHandler<T>: Send + Sync + 'static {
    async fn handle(&self, items: &[T]) -> Vec<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Accumulating,
    Flushing,
    Terminated,
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch writer stopped")]
    Stopped,
}

pub struct BatchWriter<T> {
    tx: mpsc::Sender<T>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    state_rx: watch::Receiver<BatchState>,
}

impl<T: Send + Sync + 'static> BatchWriter<T> {
    /// Spawn the accumulator task. Must be called inside a tokio runtime.
    ///
    /// `dropped` counts items given up on, either after exhausting their
    /// retries or because they were still failing at stop.
    pub fn start<H: BatchHandler<T>>(config: BatchConfig, handler: H, dropped: Counter) -> Self {
        let config = BatchConfig { batch_size: config.batch_size.max(1), ..config };
        let (tx, rx) = mpsc::channel(config.batch_size);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(BatchState::Idle);
        let worker = Worker { config, handler, dropped, items: Vec::with_capacity(config.batch_size), failures: Vec::with_capacity(config.batch_size), state_tx };
        let task = tokio::spawn(worker.run(rx, stop_rx));
        Self { tx, stop_tx: Mutex::new(Some(stop_tx)), task: Mutex::new(Some(task)), state_rx }
    }

    /// Queue an item for the next flush.
    pub async fn submit(&self, item: T) -> Result<(), BatchError> {
        self.tx.send(item).await.map_err(|_| BatchError::Stopped)
    }

    pub fn state(&self) -> BatchState { *self.state_rx.borrow() }

    /// Flush whatever is pending and wait for the accumulator to exit.
    /// Subsequent calls return immediately.
    pub async fn stop(&self) {
        let stop_tx = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = stop_tx { let _ = tx.send(()); }
        if let Some(task) = task {
            if let Err(e) = task.await { warn!(error = %e, "batch worker panicked"); }
        }
    }
}

struct Worker<T, H> {
    config: BatchConfig,
    handler: H,
    dropped: Counter,
    items: Vec<T>,
    // failed attempts so far, parallel to `items`
    failures: Vec<u32>,
    state_tx: watch::Sender<BatchState>,
}

impl<T: Send + Sync + 'static, H: BatchHandler<T>> Worker<T, H> {
    async fn run(mut self, mut rx: mpsc::Receiver<T>, mut stop_rx: oneshot::Receiver<()>) {
        let period = self.config.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(item) => {
                            self.push(item);
                            if self.items.len() >= self.config.batch_size {
                                self.flush().await;
                                ticker.reset();
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.flush().await;
                }
                _ = &mut stop_rx => break,
            }
        }
        // Items accepted before stop still get their final flush.
        rx.close();
        while let Ok(item) = rx.try_recv() { self.push(item); }
        let pending = self.items.len();
        self.flush().await;
        if !self.items.is_empty() {
            warn!(dropped = self.items.len(), "batch writer stopped with failed items; dropping");
            self.dropped.increment(self.items.len() as u64);
        }
        self.set_state(BatchState::Terminated);
        info!(pending, "batch writer stopped");
    }

    fn push(&mut self, item: T) {
        self.items.push(item);
        self.failures.push(0);
        self.set_state(BatchState::Accumulating);
    }

    async fn flush(&mut self) {
        if self.items.is_empty() { return; }
        self.set_state(BatchState::Flushing);
        let n = self.items.len();
        let t0 = std::time::Instant::now();
        let results = match tokio::time::timeout(self.config.timeout, self.handler.handle(&self.items)).await {
            Ok(r) => r,
            Err(_) => {
                warn!(items = n, timeout_ms = %self.config.timeout.as_millis(), "batch flush timed out");
                Vec::new()
            }
        };
        let items = std::mem::take(&mut self.items);
        let failures = std::mem::take(&mut self.failures);
        let (mut ok, mut dropped) = (0usize, 0usize);
        for (i, (item, failed)) in items.into_iter().zip(failures).enumerate() {
            if results.get(i).copied().unwrap_or(false) { ok += 1; continue; }
            let failed = failed + 1;
            if failed > self.config.max_retries {
                dropped += 1;
                continue;
            }
            self.items.push(item);
            self.failures.push(failed);
        }
        if dropped > 0 {
            warn!(dropped, max_retries = self.config.max_retries, "dropping batch items after exhausting retries");
            self.dropped.increment(dropped as u64);
        }
        debug!(items = n, ok, retry = self.items.len(), dropped, took_ms = %t0.elapsed().as_millis(), "batch flushed");
        self.set_state(if self.items.is_empty() { BatchState::Idle } else { BatchState::Accumulating });
    }

    fn set_state(&self, s: BatchState) { let _ = self.state_tx.send(s); }
}
