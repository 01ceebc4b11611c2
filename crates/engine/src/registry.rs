//! Delivery registries: where routed events go after the route picks names.
//!
//! [`ChannelRegistry`] gives every sink its own bounded queue and worker task,
//! so a slow or failing sink never holds up ingestion or its neighbours.
//! [`SyncRegistry`] delivers on the caller's task and exists for tests and
//! local runs.

use std::sync::{Arc, Mutex, MutexGuard};

use kexp_core::{EnhancedEvent, MetricsStore, Sink};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("receiver {0:?} already registered")]
    Duplicate(String),
    #[error("registry closed")]
    Closed,
}

/// Name → sink table that accepts events for delivery.
#[async_trait::async_trait]
pub trait ReceiverRegistry: Send + Sync {
    async fn register(&self, name: &str, sink: Box<dyn Sink>) -> Result<(), RegistryError>;

    /// Deliver (or enqueue) one event for `name`. Never surfaces sink errors.
    async fn send_event(&self, name: &str, event: Arc<EnhancedEvent>);

    /// Close every sink once. Later sends are dropped.
    async fn close(&self);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|e| e.into_inner()) }

// ---- channel registry ----

struct Destination {
    tx: mpsc::Sender<Arc<EnhancedEvent>>,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Table {
    destinations: FxHashMap<String, Destination>,
    closed: bool,
}

/// One bounded queue and one worker per sink.
pub struct ChannelRegistry {
    capacity: usize,
    metrics: MetricsStore,
    table: Mutex<Table>,
}

impl ChannelRegistry {
    pub fn new(capacity: usize, metrics: MetricsStore) -> Self {
        Self {
            capacity: capacity.max(1),
            metrics,
            table: Mutex::new(Table { destinations: FxHashMap::default(), closed: false }),
        }
    }

    pub fn len(&self) -> usize { lock(&self.table).destinations.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[async_trait::async_trait]
impl ReceiverRegistry for ChannelRegistry {
    async fn register(&self, name: &str, sink: Box<dyn Sink>) -> Result<(), RegistryError> {
        let mut table = lock(&self.table);
        if table.closed {
            return Err(RegistryError::Closed);
        }
        if table.destinations.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(deliver(name.to_string(), sink, rx, stop_rx, self.metrics.clone()));
        table.destinations.insert(name.to_string(), Destination { tx, stop_tx, task });
        debug!(sink = %name, capacity = self.capacity, "sink worker spawned");
        Ok(())
    }

    async fn send_event(&self, name: &str, event: Arc<EnhancedEvent>) {
        let outcome = match lock(&self.table).destinations.get(name) {
            Some(dest) => dest.tx.try_send(event),
            None => {
                error!(sink = %name, uid = %event.uid(), "no such receiver; event dropped");
                self.metrics.events_dropped.increment(1);
                return;
            }
        };
        match outcome {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                warn!(sink = %name, uid = %ev.uid(), "sink queue full; event dropped");
                self.metrics.events_dropped.increment(1);
            }
            Err(mpsc::error::TrySendError::Closed(ev)) => {
                error!(sink = %name, uid = %ev.uid(), "sink worker gone; event dropped");
                self.metrics.events_dropped.increment(1);
            }
        }
    }

    async fn close(&self) {
        let destinations: Vec<(String, Destination)> = {
            let mut table = lock(&self.table);
            table.closed = true;
            table.destinations.drain().collect()
        };
        info!(sinks = destinations.len(), "closing sinks");
        let mut tasks = Vec::with_capacity(destinations.len());
        for (name, dest) in destinations {
            let _ = dest.stop_tx.send(());
            drop(dest.tx);
            tasks.push((name, dest.task));
        }
        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!(sink = %name, error = %e, "sink worker panicked");
            }
        }
        info!("all sinks closed");
    }
}

/// Worker loop: deliver in arrival order until stopped, then drain what was
/// already queued and close the sink.
async fn deliver(
    name: String,
    sink: Box<dyn Sink>,
    mut rx: mpsc::Receiver<Arc<EnhancedEvent>>,
    mut stop_rx: oneshot::Receiver<()>,
    metrics: MetricsStore,
) {
    debug!(sink = %name, "sink worker started");
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(ev) => send_one(&name, sink.as_ref(), &ev, &metrics).await,
                None => break,
            },
            _ = &mut stop_rx => break,
        }
    }
    rx.close();
    let mut drained = 0usize;
    while let Ok(ev) = rx.try_recv() {
        send_one(&name, sink.as_ref(), &ev, &metrics).await;
        drained += 1;
    }
    sink.close().await;
    info!(sink = %name, drained, "sink closed");
}

async fn send_one(name: &str, sink: &dyn Sink, ev: &EnhancedEvent, metrics: &MetricsStore) {
    debug!(sink = %name, uid = %ev.uid(), "sending event to sink");
    if let Err(e) = sink.send(ev).await {
        metrics.send_errors.increment(1);
        error!(sink = %name, uid = %ev.uid(), error = %e, "cannot send event");
    }
}

// ---- sync registry ----

/// Delivers on the caller's task, one sink at a time.
pub struct SyncRegistry {
    metrics: MetricsStore,
    sinks: Mutex<Option<FxHashMap<String, Arc<dyn Sink>>>>,
}

impl SyncRegistry {
    pub fn new(metrics: MetricsStore) -> Self {
        Self { metrics, sinks: Mutex::new(Some(FxHashMap::default())) }
    }
}

impl Default for SyncRegistry {
    fn default() -> Self { Self::new(MetricsStore::default()) }
}

#[async_trait::async_trait]
impl ReceiverRegistry for SyncRegistry {
    async fn register(&self, name: &str, sink: Box<dyn Sink>) -> Result<(), RegistryError> {
        let mut guard = lock(&self.sinks);
        let sinks = guard.as_mut().ok_or(RegistryError::Closed)?;
        if sinks.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        sinks.insert(name.to_string(), Arc::from(sink));
        Ok(())
    }

    async fn send_event(&self, name: &str, event: Arc<EnhancedEvent>) {
        let sink = lock(&self.sinks).as_ref().and_then(|s| s.get(name).cloned());
        match sink {
            Some(sink) => send_one(name, sink.as_ref(), &event, &self.metrics).await,
            None => {
                error!(sink = %name, uid = %event.uid(), "no such receiver; event dropped");
                self.metrics.events_dropped.increment(1);
            }
        }
    }

    async fn close(&self) {
        let sinks = lock(&self.sinks).take().unwrap_or_default();
        for (name, sink) in sinks {
            info!(sink = %name, "closing sink");
            sink.close().await;
        }
    }
}
