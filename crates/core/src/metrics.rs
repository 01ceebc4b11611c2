//! Counters shared by the watcher, the cache, the registries and batched sinks.
//!
//! Names carry the configured prefix, e.g. `event_exporter_events_sent`.
//! The store only increments; reading is left to the exporter.

use metrics::{register_counter, Counter};

#[derive(Clone)]
pub struct MetricsStore {
    pub events_processed: Counter,
    pub events_discarded: Counter,
    pub watch_errors: Counter,
    pub send_errors: Counter,
    pub events_dropped: Counter,
    pub cache_hits: Counter,
    pub api_reads: Counter,
    pub batch_items_dropped: Counter,
}

impl MetricsStore {
    pub fn new(prefix: &str) -> Self {
        Self {
            events_processed: register_counter!(format!("{}events_sent", prefix)),
            events_discarded: register_counter!(format!("{}events_discarded", prefix)),
            watch_errors: register_counter!(format!("{}watch_errors", prefix)),
            send_errors: register_counter!(format!("{}send_event_errors", prefix)),
            events_dropped: register_counter!(format!("{}events_dropped", prefix)),
            cache_hits: register_counter!(format!("{}kube_api_read_cache_hits", prefix)),
            api_reads: register_counter!(format!("{}kube_api_read_cache_misses", prefix)),
            batch_items_dropped: register_counter!(format!("{}batch_items_dropped", prefix)),
        }
    }
}

impl Default for MetricsStore {
    fn default() -> Self { Self::new("") }
}
