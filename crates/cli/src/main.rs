use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser};
use kexp_core::MetricsStore;
use kexp_engine::{ChannelRegistry, Config, Engine, ReceiverRegistry, SyncRegistry};
use kexp_kubehub::{EventWatcher, KubeMetadataLookup, ObjectMetadataCache, WatcherConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kexp", version, about = "Export cluster events to configured sinks")]
struct Cli {
    /// Config file path
    #[arg(long = "conf", env = "KEXP_CONF", default_value = "config.yaml")]
    conf: String,

    /// Prometheus listener address
    #[arg(long = "metrics-address", env = "KEXP_METRICS_ADDR", default_value = "0.0.0.0:2112")]
    metrics_address: SocketAddr,

    /// Kubeconfig to use instead of in-cluster or default discovery
    #[arg(long = "kubeconfig")]
    kubeconfig: Option<String>,

    /// Deliver on the watcher task instead of per-sink workers (debugging)
    #[arg(long = "sync-registry", action = ArgAction::SetTrue)]
    sync_registry: bool,
}

/// `KEXP_LOG` wins over the config level; format is `pretty` unless `json`.
fn init_tracing(level: Option<&str>, format: Option<&str>) {
    let directive = std::env::var("KEXP_LOG")
        .ok()
        .or_else(|| level.filter(|l| !l.is_empty()).map(str::to_string))
        .unwrap_or_else(|| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&directive).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match format {
        Some("json") => builder.json().init(),
        _ => builder.init(),
    }
}

fn init_metrics(addr: SocketAddr) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    match builder.with_http_listener(addr).install() {
        Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM; waiting for Ctrl-C only"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Utc::now();
    let cli = Cli::parse();

    let text = Config::read(&cli.conf).with_context(|| format!("reading config {}", cli.conf))?;
    let mut cfg = Config::parse(&text).context("parsing config")?;
    init_tracing(cfg.log_level.as_deref(), cfg.log_format.as_deref());
    info!(path = %cli.conf, "config loaded");
    cfg.set_defaults();
    cfg.validate().context("config validation failed")?;

    init_metrics(cli.metrics_address);
    let metrics = MetricsStore::new(&cfg.metrics_name_prefix);

    let registry: Box<dyn ReceiverRegistry> = if cli.sync_registry {
        Box::new(SyncRegistry::new(metrics.clone()))
    } else {
        Box::new(ChannelRegistry::new(cfg.queue_capacity, metrics.clone()))
    };
    let engine = Arc::new(Engine::new(&cfg, registry, &metrics).await.context("initializing sinks")?);

    let client = kexp_kubehub::client(cli.kubeconfig.as_deref()).await?;
    let cache = if cfg.omit_lookup {
        None
    } else {
        let lookup = Arc::new(KubeMetadataLookup::new(client.clone()));
        Some(Arc::new(ObjectMetadataCache::new(lookup, cfg.cache_size, metrics.clone())))
    };
    let watcher_cfg = WatcherConfig {
        namespace: cfg.namespace.clone().filter(|ns| !ns.is_empty()),
        max_event_age: chrono::Duration::seconds(cfg.max_event_age_seconds),
        omit_lookup: cfg.omit_lookup,
        start_time,
    };
    info!(
        ns = ?watcher_cfg.namespace,
        max_event_age_secs = cfg.max_event_age_seconds,
        omit_lookup = cfg.omit_lookup,
        receivers = cfg.receivers.len(),
        "starting event exporter"
    );
    let watcher = EventWatcher::new(watcher_cfg, cache, metrics, engine.clone());
    watcher.start(kexp_kubehub::events_api(client, cfg.namespace.as_deref()));

    shutdown_signal().await;
    info!("received signal to exit; stopping");
    watcher.stop().await;
    engine.stop().await;
    info!("stopped");
    Ok(())
}
