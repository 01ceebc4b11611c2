use std::sync::Arc;

use kexp_core::{EnhancedEvent, MetricsStore};
use kexp_kubehub::EventHandler;
use kexp_route::Route;
use tracing::{debug, info};

use crate::config::Config;
use crate::registry::ReceiverRegistry;
use crate::EngineError;

/// Routes enriched events to registered sinks.
pub struct Engine {
    route: Route,
    registry: Box<dyn ReceiverRegistry>,
    cluster_name: Option<String>,
}

impl Engine {
    /// Build and register one sink per receiver. Any construction failure is
    /// returned before a single event is processed.
    pub async fn new(config: &Config, registry: Box<dyn ReceiverRegistry>, metrics: &MetricsStore) -> Result<Self, EngineError> {
        for rc in &config.receivers {
            let kind = rc.kind()?;
            let sink = rc.build(metrics).await?;
            info!(receiver = %rc.name, kind = ?kind, "registering sink");
            registry.register(&rc.name, sink).await?;
        }
        Ok(Self { route: config.route.clone(), registry, cluster_name: config.cluster_name().map(str::to_string) })
    }

    pub async fn on_event(&self, mut event: EnhancedEvent) {
        if let Some(cluster) = &self.cluster_name {
            event.cluster_name = Some(cluster.clone());
        }
        let event = Arc::new(event);
        let destinations = self.route.resolve(&event);
        debug!(uid = %event.uid(), reason = %event.reason(), destinations = destinations.len(), "routing event");
        for name in destinations {
            self.registry.send_event(name, event.clone()).await;
        }
    }

    /// Close every sink; waits for queued deliveries to finish.
    pub async fn stop(&self) { self.registry.close().await }
}

#[async_trait::async_trait]
impl EventHandler for Engine {
    async fn on_event(&self, event: EnhancedEvent) { Engine::on_event(self, event).await }
}
