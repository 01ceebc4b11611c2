//! Event watcher: list+watch core/v1 Events and forward new ones.
//!
//! Only additions are forwarded. An event counts as added the first time its
//! UID shows up on the stream; later updates of the same UID are ignored.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kexp_core::{EnhancedEvent, EnhancedObjectReference, MetricsStore};
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event as WatchEvent},
        WatchStreamExt,
    },
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::cache::ObjectMetadataCache;

/// Consumer of enriched events.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: EnhancedEvent);
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Empty or `None` watches all namespaces.
    pub namespace: Option<String>,
    pub max_event_age: Duration,
    pub omit_lookup: bool,
    /// Stale events stamped before this instant are dropped silently.
    pub start_time: DateTime<Utc>,
}

struct Inner {
    config: WatcherConfig,
    cache: Option<Arc<ObjectMetadataCache>>,
    metrics: MetricsStore,
    handler: Arc<dyn EventHandler>,
}

pub struct EventWatcher {
    inner: Arc<Inner>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventWatcher {
    pub fn new(
        config: WatcherConfig,
        cache: Option<Arc<ObjectMetadataCache>>,
        metrics: MetricsStore,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner { config, cache, metrics, handler }),
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Filter, enrich and hand over one newly added event.
    pub async fn on_event(&self, raw: &Event) { self.inner.on_event(raw).await }

    pub fn is_discarded(&self, raw: &Event, now: DateTime<Utc>) -> bool { self.inner.is_discarded(raw, now) }

    /// Spawn the subscription loop. A second call is ignored.
    pub fn start(&self, api: Api<Event>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            warn!("event watcher already started");
            return;
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        *self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(stop_tx);
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move { inner.run(api, stop_rx).await }));
    }

    /// Signal the loop and wait for it to finish. Idempotent.
    pub async fn stop(&self) {
        let stop_tx = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = task {
            if let Err(e) = handle.await {
                error!(error = %e, "event watcher task failed");
            }
        }
    }
}

impl Inner {
    async fn run(&self, api: Api<Event>, mut stop_rx: oneshot::Receiver<()>) {
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        let mut seen = AddTracker::default();
        info!(ns = ?self.config.namespace, "event watcher started");
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                next = stream.next() => match next {
                    Some(Ok(ev)) => {
                        for added in seen.observe(ev) {
                            self.on_event(&added).await;
                        }
                    }
                    Some(Err(e)) => {
                        self.metrics.watch_errors.increment(1);
                        warn!(error = %e, "event watch error");
                    }
                    None => {
                        warn!("event watch stream ended");
                        break;
                    }
                },
            }
        }
        info!("event watcher stopped");
    }

    fn is_discarded(&self, raw: &Event, now: DateTime<Utc>) -> bool {
        // No timestamp at all reads as infinitely old and predates start.
        let Some(ts) = event_timestamp(raw) else {
            return true;
        };
        let age = now - ts;
        if age <= self.config.max_event_age {
            return false;
        }
        if ts > self.config.start_time {
            warn!(
                age_secs = age.num_seconds(),
                ns = raw.metadata.namespace.as_deref().unwrap_or(""),
                name = raw.metadata.name.as_deref().unwrap_or(""),
                "event discarded as older than max event age"
            );
            self.metrics.events_discarded.increment(1);
        }
        true
    }

    async fn on_event(&self, raw: &Event) {
        if self.is_discarded(raw, Utc::now()) {
            return;
        }
        debug!(
            ns = raw.metadata.namespace.as_deref().unwrap_or(""),
            reason = raw.reason.as_deref().unwrap_or(""),
            object = raw.involved_object.name.as_deref().unwrap_or(""),
            msg = raw.message.as_deref().unwrap_or(""),
            "received event"
        );
        self.metrics.events_processed.increment(1);
        let involved = self.enrich(raw).await;
        self.handler.on_event(EnhancedEvent::from_event(raw, involved)).await;
    }

    async fn enrich(&self, raw: &Event) -> EnhancedObjectReference {
        let reference = &raw.involved_object;
        let cache = match &self.cache {
            Some(cache) if !self.config.omit_lookup => cache,
            _ => return EnhancedObjectReference::plain(reference),
        };
        match cache.get(reference).await {
            Ok(md) => md.enrich(reference),
            Err(e) if e.is_not_found() => {
                error!(object = reference.name.as_deref().unwrap_or(""), "object not found, likely deleted");
                EnhancedObjectReference { deleted: true, ..EnhancedObjectReference::plain(reference) }
            }
            Err(e) => {
                error!(error = %e, object = reference.name.as_deref().unwrap_or(""), "failed to get object metadata");
                EnhancedObjectReference::plain(reference)
            }
        }
    }
}

/// lastTimestamp, falling back to eventTime.
fn event_timestamp(raw: &Event) -> Option<DateTime<Utc>> {
    raw.last_timestamp.as_ref().map(|t| t.0).or_else(|| raw.event_time.as_ref().map(|t| t.0))
}

/// Turns watch notifications into "added" events by tracking seen UIDs.
#[derive(Default)]
pub(crate) struct AddTracker {
    seen: HashSet<String>,
}

impl AddTracker {
    pub(crate) fn observe(&mut self, ev: WatchEvent<Event>) -> Vec<Event> {
        match ev {
            WatchEvent::Applied(o) => match o.metadata.uid.clone() {
                Some(uid) if self.seen.insert(uid.clone()) => vec![o],
                Some(_) => Vec::new(),
                None => vec![o],
            },
            WatchEvent::Deleted(o) => {
                if let Some(uid) = &o.metadata.uid {
                    self.seen.remove(uid);
                }
                Vec::new()
            }
            WatchEvent::Restarted(list) => {
                let mut next = HashSet::with_capacity(list.len());
                let mut added = Vec::new();
                for o in list {
                    match o.metadata.uid.clone() {
                        Some(uid) => {
                            if !self.seen.contains(&uid) {
                                added.push(o);
                            }
                            next.insert(uid);
                        }
                        None => added.push(o),
                    }
                }
                debug!(count = next.len(), added = added.len(), "event watch restarted");
                self.seen = next;
                added
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize { self.seen.len() }
}
