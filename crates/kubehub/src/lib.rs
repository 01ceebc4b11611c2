//! kexp kubehub: cluster-facing side of the exporter.
//!
//! - [`watcher`]: subscribes to core/v1 Events, drops stale ones, enriches
//!   the involved object and hands the result to an [`EventHandler`].
//! - [`cache`]: bounded LRU in front of a [`MetadataLookup`].
//! - [`lookup`]: the kube-backed lookup (discovery + dynamic GET).

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Event;
use kube::{api::Api, Client};

pub mod cache;
pub mod lookup;
pub mod watcher;

pub use cache::ObjectMetadataCache;
pub use lookup::{KubeMetadataLookup, LookupError, MetadataLookup};
pub use watcher::{EventHandler, EventWatcher, WatcherConfig};

/// Build a client from an explicit kubeconfig path, or the default chain
/// (in-cluster, then `KUBECONFIG`/`~/.kube/config`).
pub async fn client(kubeconfig: Option<&str>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = kube::config::Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path))?;
            let cfg = kube::Config::from_custom_kubeconfig(kc, &kube::config::KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?;
            Client::try_from(cfg).context("building kube client")
        }
        None => Client::try_default().await.context("building default kube client"),
    }
}

/// Events API scoped to one namespace, or cluster-wide when `None`/empty.
pub fn events_api(client: Client, namespace: Option<&str>) -> Api<Event> {
    match namespace.filter(|ns| !ns.is_empty()) {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}
