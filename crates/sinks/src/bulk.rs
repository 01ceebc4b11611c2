//! Batched sink: events are grouped by a [`BatchWriter`] and each flush lands
//! in its own JSON-lines file, `batch-<unix seconds>-<uuid>.jsonl`.

use std::path::{Path, PathBuf};

use kexp_batch::{BatchConfig, BatchHandler, BatchWriter};
use metrics::Counter;
use kexp_core::prelude::*;
use tracing::{debug, error, warn};

pub struct BulkFileSink {
    directory: PathBuf,
    writer: BatchWriter<EnhancedEvent>,
}

impl BulkFileSink {
    /// Create `directory` if needed and start the batch writer.
    pub async fn start(directory: impl AsRef<Path>, config: BatchConfig, dropped: Counter) -> std::io::Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&directory).await?;
        let writer = BatchWriter::start(config, BatchFiles { directory: directory.clone() }, dropped);
        Ok(Self { directory, writer })
    }

    pub fn directory(&self) -> &Path { &self.directory }
}

#[async_trait::async_trait]
impl Sink for BulkFileSink {
    async fn send(&self, event: &EnhancedEvent) -> Result<(), SinkError> {
        self.writer.submit(event.clone()).await.map_err(|_| SinkError::Closed)
    }

    async fn close(&self) { self.writer.stop().await }
}

struct BatchFiles {
    directory: PathBuf,
}

impl BatchFiles {
    fn next_path(&self) -> PathBuf {
        let name = format!("batch-{}-{}.jsonl", chrono::Utc::now().timestamp(), uuid::Uuid::new_v4());
        self.directory.join(name)
    }
}

#[async_trait::async_trait]
impl BatchHandler<EnhancedEvent> for BatchFiles {
    async fn handle(&self, items: &[EnhancedEvent]) -> Vec<bool> {
        let mut buf = Vec::new();
        let mut results = Vec::with_capacity(items.len());
        for ev in items {
            match ev.to_json() {
                Ok(line) => {
                    buf.extend_from_slice(&line);
                    buf.push(b'\n');
                    results.push(true);
                }
                Err(e) => {
                    warn!(uid = %ev.uid(), error = %e, "event not serializable; skipping in batch");
                    results.push(false);
                }
            }
        }
        if buf.is_empty() {
            return results;
        }
        let path = self.next_path();
        match tokio::fs::write(&path, &buf).await {
            Ok(()) => {
                debug!(path = %path.display(), items = items.len(), bytes = buf.len(), "batch file written");
                results
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "batch file write failed");
                vec![false; items.len()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(uid: &str) -> EnhancedEvent {
        let mut ev = EnhancedEvent::default();
        ev.metadata.uid = Some(uid.into());
        ev
    }

    fn batch_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect();
        files.sort();
        files
    }

    fn uids(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<EnhancedEvent>(l).unwrap().uid().to_string())
            .collect()
    }

    #[tokio::test]
    async fn one_file_per_flush() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BatchConfig { batch_size: 2, max_retries: 0, interval: Duration::from_secs(3600), timeout: Duration::from_secs(5) };
        let sink = BulkFileSink::start(dir.path(), cfg, Counter::noop()).await.unwrap();
        for uid in ["a", "b", "c"] {
            sink.send(&event(uid)).await.unwrap();
        }
        sink.close().await;

        let files = batch_files(dir.path());
        assert_eq!(files.len(), 2, "{:?}", files);
        let mut all: Vec<String> = files.iter().flat_map(|f| uids(f)).collect();
        all.sort();
        assert_eq!(all, vec!["a", "b", "c"]);
        for f in &files {
            let name = f.file_name().unwrap().to_string_lossy().to_string();
            assert!(name.starts_with("batch-") && name.ends_with(".jsonl"), "{}", name);
        }
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sink = BulkFileSink::start(dir.path(), BatchConfig::default(), Counter::noop()).await.unwrap();
        sink.close().await;
        assert!(matches!(sink.send(&event("late")).await, Err(SinkError::Closed)));
        assert!(batch_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn unwritable_directory_fails_every_item() {
        let dir = tempfile::tempdir().unwrap();
        let handler = BatchFiles { directory: dir.path().join("missing") };
        let res = handler.handle(&[event("x"), event("y")]).await;
        assert_eq!(res, vec![false, false]);
    }
}
