//! kexp sinks.
//!
//! Each receiver in the config names exactly one sink kind; [`ReceiverConfig::build`]
//! turns it into a boxed [`Sink`] ready for registration.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use kexp_batch::BatchConfig;
use kexp_core::{MetricsStore, Sink};
use serde::Deserialize;

mod bulk;
mod file;
mod memory;
mod stdout;

pub use bulk::BulkFileSink;
pub use file::FileSink;
pub use memory::{EventStore, InMemorySink};
pub use stdout::StdoutSink;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("receiver {0:?} has no sink configured")]
    NoSink(String),
    #[error("receiver {0:?} configures more than one sink")]
    MultipleSinks(String),
    #[error("receiver {name:?}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StdoutConfig {}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BulkFileConfig {
    pub directory: PathBuf,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl BulkFileConfig {
    /// Unset or zero values fall back to the batch defaults.
    pub fn batch_config(&self) -> BatchConfig {
        let d = BatchConfig::default();
        let nz = |v: Option<u64>| v.filter(|s| *s > 0).map(Duration::from_secs);
        BatchConfig {
            batch_size: self.batch_size.filter(|n| *n > 0).unwrap_or(d.batch_size),
            max_retries: self.max_retries.unwrap_or(d.max_retries),
            interval: nz(self.interval_seconds).unwrap_or(d.interval),
            timeout: nz(self.timeout_seconds).unwrap_or(d.timeout),
        }
    }
}

/// Events land in `store`; the store is filled programmatically, never from YAML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InMemoryConfig {
    #[serde(skip)]
    pub store: EventStore,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReceiverConfig {
    pub name: String,
    #[serde(default)]
    pub stdout: Option<StdoutConfig>,
    #[serde(default)]
    pub file: Option<FileConfig>,
    #[serde(default)]
    pub bulk_file: Option<BulkFileConfig>,
    #[serde(default)]
    pub in_memory: Option<InMemoryConfig>,
}

/// The one sink kind a receiver selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Stdout,
    File,
    BulkFile,
    InMemory,
}

impl ReceiverConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), stdout: None, file: None, bulk_file: None, in_memory: None }
    }

    pub fn in_memory(name: impl Into<String>, store: EventStore) -> Self {
        Self { in_memory: Some(InMemoryConfig { store }), ..Self::new(name) }
    }

    pub fn kind(&self) -> Result<SinkKind, BuildError> {
        let set = [
            (self.stdout.is_some(), SinkKind::Stdout),
            (self.file.is_some(), SinkKind::File),
            (self.bulk_file.is_some(), SinkKind::BulkFile),
            (self.in_memory.is_some(), SinkKind::InMemory),
        ];
        let mut chosen = set.iter().filter(|(on, _)| *on).map(|(_, k)| *k);
        match (chosen.next(), chosen.next()) {
            (Some(k), None) => Ok(k),
            (None, _) => Err(BuildError::NoSink(self.name.clone())),
            (Some(_), Some(_)) => Err(BuildError::MultipleSinks(self.name.clone())),
        }
    }

    /// Construct the sink. Bulk sinks spawn their writer, so this needs a runtime.
    pub async fn build(&self, metrics: &MetricsStore) -> Result<Box<dyn Sink>, BuildError> {
        let io = |source: std::io::Error| BuildError::Io { name: self.name.clone(), source };
        let sink: Box<dyn Sink> = match self.kind()? {
            SinkKind::Stdout => Box::new(StdoutSink::new()),
            SinkKind::File => {
                let cfg = self.file.as_ref().ok_or_else(|| BuildError::NoSink(self.name.clone()))?;
                Box::new(FileSink::open(&cfg.path).await.map_err(io)?)
            }
            SinkKind::BulkFile => {
                let cfg = self.bulk_file.as_ref().ok_or_else(|| BuildError::NoSink(self.name.clone()))?;
                Box::new(BulkFileSink::start(&cfg.directory, cfg.batch_config(), metrics.batch_items_dropped.clone()).await.map_err(io)?)
            }
            SinkKind::InMemory => {
                let cfg = self.in_memory.as_ref().ok_or_else(|| BuildError::NoSink(self.name.clone()))?;
                Box::new(InMemorySink::with_store(cfg.store.clone()))
            }
        };
        Ok(sink)
    }
}
