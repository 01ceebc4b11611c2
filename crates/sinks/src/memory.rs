use std::sync::{Arc, Mutex};

use kexp_core::prelude::*;

/// Shared handle to everything an [`InMemorySink`] received.
pub type EventStore = Arc<Mutex<Vec<EnhancedEvent>>>;

/// Keeps every event it is sent. Intended for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemorySink {
    store: EventStore,
}

impl InMemorySink {
    pub fn new() -> Self { Self::default() }
    pub fn with_store(store: EventStore) -> Self { Self { store } }
    pub fn store(&self) -> EventStore { self.store.clone() }
}

#[async_trait::async_trait]
impl Sink for InMemorySink {
    async fn send(&self, event: &EnhancedEvent) -> Result<(), SinkError> {
        self.store.lock().unwrap_or_else(|e| e.into_inner()).push(event.clone());
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keeps_events_in_send_order() {
        let sink = InMemorySink::new();
        for reason in ["a", "b", "c"] {
            let ev = EnhancedEvent { reason: Some(reason.into()), ..Default::default() };
            sink.send(&ev).await.unwrap();
        }
        let store = sink.store();
        let got: Vec<String> = store.lock().unwrap().iter().map(|e| e.reason().to_string()).collect();
        assert_eq!(got, vec!["a", "b", "c"]);
    }
}
