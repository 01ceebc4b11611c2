use std::path::{Path, PathBuf};

use kexp_core::prelude::*;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Appends one JSON line per event to a file. Output is buffered and
/// flushed on close.
pub struct FileSink {
    path: PathBuf,
    out: Mutex<Option<BufWriter<fs::File>>>,
}

impl FileSink {
    /// Open `path` for appending, creating it and its parent directories.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        debug!(path = %path.display(), "file sink opened");
        Ok(Self { path, out: Mutex::new(Some(BufWriter::new(file))) })
    }

    pub fn path(&self) -> &Path { &self.path }
}

#[async_trait::async_trait]
impl Sink for FileSink {
    async fn send(&self, event: &EnhancedEvent) -> Result<(), SinkError> {
        let mut line = event.to_json()?;
        line.push(b'\n');
        let mut guard = self.out.lock().await;
        let out = guard.as_mut().ok_or(SinkError::Closed)?;
        out.write_all(&line).await?;
        Ok(())
    }

    async fn close(&self) {
        let taken = self.out.lock().await.take();
        if let Some(mut out) = taken {
            if let Err(e) = out.shutdown().await {
                warn!(path = %self.path.display(), error = %e, "file sink flush failed");
            }
        }
    }
}
