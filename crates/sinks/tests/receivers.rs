#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kexp_core::{EnhancedEvent, MetricsStore};
use metrics::Counter;
use kexp_sinks::{BuildError, EventStore, ReceiverConfig};

fn event(reason: &str) -> EnhancedEvent {
    EnhancedEvent { reason: Some(reason.into()), ..Default::default() }
}

#[tokio::test]
async fn file_receiver_built_from_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.jsonl");
    let yaml = format!("name: dump\nfile:\n  path: {}\n", path.display());
    let rc: ReceiverConfig = serde_yaml::from_str(&yaml).unwrap();

    let sink = rc.build(&MetricsStore::default()).await.unwrap();
    sink.send(&event("Started")).await.unwrap();
    sink.send(&event("Killing")).await.unwrap();
    sink.close().await;

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), 2);
    assert!(text.contains("\"reason\":\"Killing\""));
}

#[tokio::test]
async fn in_memory_receiver_shares_store() {
    let store = EventStore::default();
    let sink = ReceiverConfig::in_memory("mem", store.clone()).build(&MetricsStore::default()).await.unwrap();
    sink.send(&event("BackOff")).await.unwrap();
    sink.close().await;
    let got = store.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].reason(), "BackOff");
}

#[tokio::test]
async fn bulk_receiver_flushes_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!("name: wh\nbulkFile:\n  directory: {}\n  batchSize: 10\n", dir.path().display());
    let rc: ReceiverConfig = serde_yaml::from_str(&yaml).unwrap();
    let sink = rc.build(&MetricsStore::default()).await.unwrap();
    sink.send(&event("a")).await.unwrap();
    sink.close().await;
    let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(files.len(), 1);
}

#[tokio::test]
async fn bulk_receiver_reports_dropped_items_through_metrics_store() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("batches");
    let yaml = format!("name: wh\nbulkFile:\n  directory: {}\n  batchSize: 10\n  maxRetries: 0\n", target.display());
    let rc: ReceiverConfig = serde_yaml::from_str(&yaml).unwrap();
    let dropped = Arc::new(AtomicU64::new(0));
    let metrics = MetricsStore { batch_items_dropped: Counter::from_arc(dropped.clone()), ..MetricsStore::new("kexp_") };

    let sink = rc.build(&metrics).await.unwrap();
    std::fs::remove_dir_all(&target).unwrap();
    sink.send(&event("a")).await.unwrap();
    sink.send(&event("b")).await.unwrap();
    sink.close().await;
    assert_eq!(dropped.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn receiver_without_sink_fails_to_build() {
    let rc: ReceiverConfig = serde_yaml::from_str("name: empty\n").unwrap();
    assert!(matches!(rc.build(&MetricsStore::default()).await, Err(BuildError::NoSink(_))));
}
