//! Simulation configuration.

use crate::{
    channel::condition::Mode,
    shutdown::ShutdownOptions,
    worker::{ConsumerStop, Latency},
};
use serde::Deserialize;
use std::{
    fs,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;


/// Error loading or validating a [`SimConfig`]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Where a simulation runs its workers
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstrateKind {
    /// One named OS thread per worker
    Threads,
    /// A dedicated tokio runtime's blocking pool
    Pool,
}

/// Parameters of one simulation run
///
/// Every field has a default, so a TOML file need only name what it changes:
///
/// ```toml
/// capacity = 1
/// producers = 3
/// mode = "monitor"
///
/// [consumer_latency]
/// min_ms = 0
/// max_ms = 50
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Channel capacity
    pub capacity: usize,
    /// Number of producers
    pub producers: usize,
    /// Number of consumers
    pub consumers: usize,
    /// Messages each producer puts
    pub messages_per_producer: u64,
    pub producer_latency: Latency,
    pub consumer_latency: Latency,
    pub mode: Mode,
    pub substrate: SubstrateKind,
    /// Bound on each shutdown phase
    pub join_timeout_ms: u64,
    /// Seed for latency randomness. Unseeded runs draw from entropy.
    pub seed: Option<u64>,
    /// If set, consumers stop after this many payloads instead of on a sentinel
    pub consumer_quota: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            capacity: 5,
            producers: 2,
            consumers: 2,
            messages_per_producer: 10,
            producer_latency: Latency::millis(100, 600),
            consumer_latency: Latency::millis(200, 1000),
            mode: Mode::Split,
            substrate: SubstrateKind::Threads,
            join_timeout_ms: 30_000,
            seed: None,
            consumer_quota: None,
        }
    }
}

impl SimConfig {
    /// Parse from TOML text, then validate
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file, then validate
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_owned(), source })?;
        Self::from_toml_str(&s)
    }

    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("capacity must be at least 1"));
        }
        if self.producers == 0 {
            return Err(ConfigError::Invalid("there must be at least one producer"));
        }
        if self.consumers == 0 {
            return Err(ConfigError::Invalid("there must be at least one consumer"));
        }
        if !self.producer_latency.is_valid() {
            return Err(ConfigError::Invalid("producer latency min_ms exceeds max_ms"));
        }
        if !self.consumer_latency.is_valid() {
            return Err(ConfigError::Invalid("consumer latency min_ms exceeds max_ms"));
        }
        if self.join_timeout_ms == 0 {
            return Err(ConfigError::Invalid("join timeout must be positive"));
        }
        Ok(())
    }

    /// How consumers stop
    pub fn consumer_stop(&self) -> ConsumerStop {
        match self.consumer_quota {
            Some(n) => ConsumerStop::Quota(n),
            None => ConsumerStop::Sentinel,
        }
    }

    /// Shutdown bounds implied by this config
    pub fn shutdown_options(&self) -> ShutdownOptions {
        ShutdownOptions {
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            ..Default::default()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(SimConfig::from_toml_str("").unwrap(), SimConfig::default());
    }

    #[test]
    fn partial_toml_overrides() {
        let config = SimConfig::from_toml_str(r#"
            capacity = 1
            producers = 3
            mode = "monitor"
            substrate = "pool"
            seed = 42
            consumer_quota = 7

            [consumer_latency]
            min_ms = 0
            max_ms = 50
        "#).unwrap();
        assert_eq!(config.capacity, 1);
        assert_eq!(config.producers, 3);
        assert_eq!(config.consumers, 2);
        assert_eq!(config.mode, Mode::Monitor);
        assert_eq!(config.substrate, SubstrateKind::Pool);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.consumer_stop(), ConsumerStop::Quota(7));
        assert_eq!(config.consumer_latency, Latency::millis(0, 50));
        assert_eq!(config.producer_latency, Latency::millis(100, 600));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            SimConfig::from_toml_str("capacityy = 3"),
            Err(ConfigError::Parse(_)),
        ));
        assert!(matches!(
            SimConfig::from_toml_str("mode = \"fifo\""),
            Err(ConfigError::Parse(_)),
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for toml in [
            "capacity = 0",
            "producers = 0",
            "consumers = 0",
            "join_timeout_ms = 0",
            "[producer_latency]\nmin_ms = 10\nmax_ms = 5",
            "[consumer_latency]\nmin_ms = 10\nmax_ms = 5",
        ] {
            assert!(
                matches!(SimConfig::from_toml_str(toml), Err(ConfigError::Invalid(_))),
                "accepted {:?}",
                toml,
            );
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        let path = std::env::temp_dir().join("cistern-config-that-does-not-exist.toml");
        assert!(matches!(SimConfig::from_path(&path), Err(ConfigError::Io { .. })));
    }
}
