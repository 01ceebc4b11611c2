//! Object metadata cache: bounded LRU keyed by object identity.
//!
//! Entries are only filled by successful lookups and only leave by eviction,
//! so staleness is bounded by capacity and churn rather than by time.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use k8s_openapi::api::core::v1::ObjectReference;
use kexp_core::{MetricsStore, ObjectMetadata};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::lookup::{LookupError, MetadataLookup};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    api_version: String,
    kind: String,
    namespace: String,
    name: String,
}

impl From<&ObjectReference> for CacheKey {
    fn from(r: &ObjectReference) -> Self {
        let s = |v: &Option<String>| v.clone().unwrap_or_default();
        Self { api_version: s(&r.api_version), kind: s(&r.kind), namespace: s(&r.namespace), name: s(&r.name) }
    }
}

/// Recency-ordered map with fixed capacity.
struct Lru {
    map: FxHashMap<CacheKey, (ObjectMetadata, u64)>,
    order: BTreeMap<u64, CacheKey>,
    tick: u64,
    cap: usize,
}

impl Lru {
    fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: BTreeMap::new(), tick: 0, cap: cap.max(1) }
    }

    fn next_tick(&mut self) -> u64 { self.tick += 1; self.tick }

    fn get(&mut self, key: &CacheKey) -> Option<ObjectMetadata> {
        let tick = self.next_tick();
        let (value, last) = self.map.get_mut(key)?;
        self.order.remove(last);
        *last = tick;
        self.order.insert(tick, key.clone());
        Some(value.clone())
    }

    fn insert(&mut self, key: CacheKey, value: ObjectMetadata) {
        let tick = self.next_tick();
        if let Some((_, last)) = self.map.get(&key) {
            self.order.remove(last);
        } else {
            while self.map.len() >= self.cap {
                match self.order.pop_first() {
                    Some((_, oldest)) => { self.map.remove(&oldest); }
                    None => break,
                }
            }
        }
        self.order.insert(tick, key.clone());
        self.map.insert(key, (value, tick));
    }
}

/// Caching front for a [`MetadataLookup`]; safe to share between tasks.
pub struct ObjectMetadataCache {
    lookup: Arc<dyn MetadataLookup>,
    entries: Mutex<Lru>,
    metrics: MetricsStore,
}

impl ObjectMetadataCache {
    pub fn new(lookup: Arc<dyn MetadataLookup>, capacity: usize, metrics: MetricsStore) -> Self {
        Self { lookup, entries: Mutex::new(Lru::with_capacity(capacity)), metrics }
    }

    pub fn len(&self) -> usize { self.lock().map.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Cached metadata, or a lookup on miss. Failures are not cached.
    pub async fn get(&self, reference: &ObjectReference) -> Result<ObjectMetadata, LookupError> {
        let key = CacheKey::from(reference);
        let cached = self.lock().get(&key);
        if let Some(hit) = cached {
            self.metrics.cache_hits.increment(1);
            return Ok(hit);
        }
        self.metrics.api_reads.increment(1);
        trace!(kind = %key.kind, ns = %key.namespace, name = %key.name, "metadata cache miss");
        let resolved = self.lookup.resolve(reference).await?;
        self.lock().insert(key, resolved.clone());
        Ok(resolved)
    }

    fn lock(&self) -> MutexGuard<'_, Lru> { self.entries.lock().unwrap_or_else(|e| e.into_inner()) }
}
