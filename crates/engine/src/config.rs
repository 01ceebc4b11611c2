//! Exporter configuration: YAML with environment expansion, defaults and
//! validation.

use std::path::Path;

use kexp_route::Route;
use kexp_sinks::{BuildError, ReceiverConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_CACHE_SIZE: usize = 1024;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_EVENT_AGE_SECONDS: i64 = 5;
/// Largest age a `chrono::Duration` can hold in whole seconds.
pub const MAX_EVENT_AGE_SECONDS_LIMIT: i64 = i64::MAX / 1_000;

static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))").unwrap()
});

// https://prometheus.io/docs/concepts/data_model/#metric-names-and-labels
static METRICS_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_:]*_$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("cannot set both throttlePeriod (deprecated) and maxEventAgeSeconds")]
    ConflictingMaxAge,
    #[error("maxEventAgeSeconds must not be negative, got {0}")]
    NegativeMaxAge(i64),
    #[error("maxEventAgeSeconds must be at most {MAX_EVENT_AGE_SECONDS_LIMIT}, got {0}")]
    MaxAgeTooLarge(i64),
    #[error("metricsNamePrefix {0:?} should match ^[a-zA-Z][a-zA-Z0-9_:]*_$")]
    MetricsPrefix(String),
    #[error("unknown log level {0:?}")]
    LogLevel(String),
    #[error("unknown log format {0:?}")]
    LogFormat(String),
    #[error("duplicate receiver {0:?}")]
    DuplicateReceiver(String),
    #[error("route references undeclared receiver {0:?}")]
    UnknownReceiver(String),
    #[error(transparent)]
    Receiver(#[from] BuildError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_format: Option<String>,
    /// Deprecated alias of `max_event_age_seconds`.
    #[serde(default)]
    pub throttle_period: i64,
    #[serde(default)]
    pub max_event_age_seconds: i64,
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub metrics_name_prefix: String,
    #[serde(default)]
    pub omit_lookup: bool,
    #[serde(default)]
    pub cache_size: usize,
    #[serde(default)]
    pub queue_capacity: usize,
    #[serde(default)]
    pub route: Route,
    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
}

impl Config {
    /// Read, expand, parse, default and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_yaml(&Self::read(path)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let mut cfg = Self::parse(text)?;
        cfg.set_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Expand environment references and deserialize; no defaults, no checks.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env(text, |k| std::env::var(k).ok());
        Ok(serde_yaml::from_str(&expanded)?)
    }

    pub fn read(path: impl AsRef<Path>) -> Result<String, ConfigError> {
        let path = path.as_ref();
        std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.display().to_string(), source })
    }

    pub fn set_defaults(&mut self) {
        if self.cache_size == 0 {
            self.cache_size = DEFAULT_CACHE_SIZE;
        }
        if self.queue_capacity == 0 {
            self.queue_capacity = DEFAULT_QUEUE_CAPACITY;
        }
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.validate_max_event_age()?;
        self.validate_metrics_prefix()?;
        self.validate_logging()?;
        self.validate_receivers()
    }

    fn validate_max_event_age(&mut self) -> Result<(), ConfigError> {
        match (self.throttle_period, self.max_event_age_seconds) {
            (0, 0) => {
                self.max_event_age_seconds = DEFAULT_MAX_EVENT_AGE_SECONDS;
                info!(max_event_age_seconds = self.max_event_age_seconds, "using default max event age");
            }
            (t, m) if t != 0 && m != 0 => return Err(ConfigError::ConflictingMaxAge),
            (t, 0) => {
                warn!("throttlePeriod is deprecated, consider using maxEventAgeSeconds instead");
                self.max_event_age_seconds = t;
            }
            _ => {}
        }
        if self.max_event_age_seconds < 0 {
            return Err(ConfigError::NegativeMaxAge(self.max_event_age_seconds));
        }
        if self.max_event_age_seconds > MAX_EVENT_AGE_SECONDS_LIMIT {
            return Err(ConfigError::MaxAgeTooLarge(self.max_event_age_seconds));
        }
        Ok(())
    }

    fn validate_metrics_prefix(&self) -> Result<(), ConfigError> {
        if self.metrics_name_prefix.is_empty() {
            warn!("metrics name prefix is empty, setting metricsNamePrefix='event_exporter_' is recommended");
            return Ok(());
        }
        if !METRICS_PREFIX.is_match(&self.metrics_name_prefix) {
            return Err(ConfigError::MetricsPrefix(self.metrics_name_prefix.clone()));
        }
        Ok(())
    }

    fn validate_logging(&self) -> Result<(), ConfigError> {
        if let Some(level) = self.log_level.as_deref().filter(|l| !l.is_empty()) {
            if !matches!(level, "trace" | "debug" | "info" | "warn" | "error") {
                return Err(ConfigError::LogLevel(level.to_string()));
            }
        }
        if let Some(format) = self.log_format.as_deref().filter(|f| !f.is_empty()) {
            if !matches!(format, "pretty" | "json") {
                return Err(ConfigError::LogFormat(format.to_string()));
            }
        }
        Ok(())
    }

    fn validate_receivers(&self) -> Result<(), ConfigError> {
        let mut names = FxHashSet::default();
        for r in &self.receivers {
            r.kind()?;
            if !names.insert(r.name.as_str()) {
                return Err(ConfigError::DuplicateReceiver(r.name.clone()));
            }
        }
        if let Some(missing) = self.route.receivers().into_iter().find(|n| !names.contains(n)) {
            return Err(ConfigError::UnknownReceiver(missing.to_string()));
        }
        Ok(())
    }

    /// Cluster name to stamp on events, if any.
    pub fn cluster_name(&self) -> Option<&str> { self.cluster_name.as_deref().filter(|s| !s.is_empty()) }
}

/// Replace `${VAR}` and `$VAR` using `lookup`; unknown variables expand to nothing.
pub fn expand_env(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    ENV_VAR
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let key = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            lookup(key).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config, ConfigError> {
        let mut cfg: Config = serde_yaml::from_str(yaml)?;
        cfg.set_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn defaults_applied() {
        let cfg = parse("{}").unwrap();
        assert_eq!(cfg.max_event_age_seconds, 5);
        assert_eq!(cfg.cache_size, 1024);
        assert_eq!(cfg.queue_capacity, 1024);
        assert!(cfg.receivers.is_empty());
        assert_eq!(cfg.cluster_name(), None);
    }

    #[test]
    fn throttle_period_is_an_alias() {
        let cfg = parse("throttlePeriod: 30").unwrap();
        assert_eq!(cfg.max_event_age_seconds, 30);
        assert!(matches!(parse("throttlePeriod: 30\nmaxEventAgeSeconds: 10"), Err(ConfigError::ConflictingMaxAge)));
        assert_eq!(parse("maxEventAgeSeconds: 60").unwrap().max_event_age_seconds, 60);
    }

    #[test]
    fn max_event_age_is_bounded() {
        let at_limit = format!("maxEventAgeSeconds: {}", MAX_EVENT_AGE_SECONDS_LIMIT);
        assert_eq!(parse(&at_limit).unwrap().max_event_age_seconds, MAX_EVENT_AGE_SECONDS_LIMIT);
        let over = format!("maxEventAgeSeconds: {}", MAX_EVENT_AGE_SECONDS_LIMIT + 1);
        assert!(matches!(parse(&over), Err(ConfigError::MaxAgeTooLarge(_))));
        let throttle = format!("throttlePeriod: {}", i64::MAX);
        assert!(matches!(parse(&throttle), Err(ConfigError::MaxAgeTooLarge(_))));
        assert!(matches!(parse("maxEventAgeSeconds: -1"), Err(ConfigError::NegativeMaxAge(-1))));
    }

    #[test]
    fn metrics_prefix_must_end_with_underscore() {
        assert!(parse("metricsNamePrefix: event_exporter_").is_ok());
        assert!(matches!(parse("metricsNamePrefix: event_exporter"), Err(ConfigError::MetricsPrefix(_))));
        assert!(matches!(parse("metricsNamePrefix: 1abc_"), Err(ConfigError::MetricsPrefix(_))));
    }

    #[test]
    fn log_settings_are_checked() {
        assert!(parse("logLevel: debug\nlogFormat: json").is_ok());
        assert!(matches!(parse("logLevel: loud"), Err(ConfigError::LogLevel(_))));
        assert!(matches!(parse("logFormat: xml"), Err(ConfigError::LogFormat(_))));
    }

    #[test]
    fn receivers_must_be_unique_and_routed_names_declared() {
        let dup = "receivers:\n  - name: a\n    stdout: {}\n  - name: a\n    stdout: {}\n";
        assert!(matches!(parse(dup), Err(ConfigError::DuplicateReceiver(n)) if n == "a"));

        let unknown = "route:\n  match:\n    - receiver: a\n    - route:\n        match:\n          - receiver: b\nreceivers:\n  - name: a\n    stdout: {}\n";
        assert!(matches!(parse(unknown), Err(ConfigError::UnknownReceiver(n)) if n == "b"));

        let no_sink = "receivers:\n  - name: a\n";
        assert!(matches!(parse(no_sink), Err(ConfigError::Receiver(BuildError::NoSink(_)))));
    }

    #[test]
    fn invalid_pattern_rejected_at_load() {
        assert!(matches!(parse("route:\n  drop:\n    - reason: \"(\"\n"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn load_expands_environment() {
        std::env::set_var("KEXP_TEST_CLUSTER", "staging");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "clusterName: ${KEXP_TEST_CLUSTER}\nmaxEventAgeSeconds: 30\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.cluster_name(), Some("staging"));
        assert_eq!(cfg.max_event_age_seconds, 30);
        assert!(matches!(Config::load(dir.path().join("missing.yaml")), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn env_expansion() {
        let lookup = |k: &str| match k {
            "NS" => Some("prod".to_string()),
            "PREFIX" => Some("kexp_".to_string()),
            _ => None,
        };
        assert_eq!(expand_env("namespace: ${NS}", lookup), "namespace: prod");
        assert_eq!(expand_env("metricsNamePrefix: $PREFIX", lookup), "metricsNamePrefix: kexp_");
        assert_eq!(expand_env("x: ${MISSING}y", lookup), "x: y");
        assert_eq!(expand_env("no vars here", lookup), "no vars here");
    }
}
