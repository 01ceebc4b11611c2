//! kexp engine: configuration, delivery registries and the pipeline that
//! ties routing to sinks.

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod registry;

pub use config::{Config, ConfigError};
pub use engine::Engine;
pub use registry::{ChannelRegistry, ReceiverRegistry, RegistryError, SyncRegistry};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot initialize sink: {0}")]
    Sink(#[from] kexp_sinks::BuildError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
