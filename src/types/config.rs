//! Configuration structures.
//!
//! Every component takes its own config struct at construction time; `Config`
//! aggregates them so a host can load the whole client access layer from one
//! JSON document.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{Error, Result};

/// Queue bound multiple applied when only `max_concurrent_requests` is set.
pub const DEFAULT_QUEUE_MULTIPLE: usize = 16;

/// Aggregate configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Client request broker.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Server request dispatcher.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Caching decorator.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Byte-stream channel framing.
    #[serde(default)]
    pub stream: StreamConfig,
}

impl Config {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        self.dispatcher.validate()?;
        self.cache.validate()?;
        self.stream.validate()
    }
}

/// Client request broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BrokerConfig {
    /// Default per-request timeout. `None` waits indefinitely.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Close the channel on dispose. `None` closes it only when the broker
    /// created the channel itself.
    #[serde(default)]
    pub terminate_on_dispose: Option<bool>,
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout == Some(Duration::ZERO) {
            return Err(Error::validation("timeout must be positive"));
        }
        Ok(())
    }
}

/// Server request dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DispatcherConfig {
    /// Maximum calls running at once. `None` is unbounded.
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,

    /// Maximum calls waiting for a running slot. `None` derives a bound from
    /// `max_concurrent_requests` (see [`DispatcherConfig::queue_limit`]).
    #[serde(default)]
    pub max_queued_requests: Option<usize>,

    /// Close the channel on dispose.
    #[serde(default)]
    pub terminate_on_dispose: bool,
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        validate_positive(self.max_concurrent_requests, "max_concurrent_requests")?;
        validate_positive(self.max_queued_requests, "max_queued_requests")
    }

    /// Effective running bound.
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrent_requests.unwrap_or(usize::MAX)
    }

    /// Effective queue bound.
    pub fn queue_limit(&self) -> usize {
        match (self.max_queued_requests, self.max_concurrent_requests) {
            (Some(queued), _) => queued,
            (None, Some(concurrent)) => concurrent.saturating_mul(DEFAULT_QUEUE_MULTIPLE),
            (None, None) => usize::MAX,
        }
    }
}

/// Caching decorator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// LRU bound. Zero disables caching entirely.
    pub max_entries: usize,

    /// Lifetime of a resolved entry, measured from resolution.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,

    /// Period of the background expiry sweep. `None` evicts lazily only.
    #[serde(default, with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl: None,
            sweep_interval: None,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval == Some(Duration::ZERO) {
            return Err(Error::validation("sweep_interval must be positive"));
        }
        Ok(())
    }
}

/// Byte-stream channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 5 * 1024 * 1024,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_bytes == 0 {
            return Err(Error::validation("max_frame_bytes must be positive"));
        }
        Ok(())
    }
}

fn validate_positive(value: Option<usize>, field: &str) -> Result<()> {
    if value == Some(0) {
        return Err(Error::validation(format!("{} must be positive", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_limit_defaults_to_multiple_of_concurrency() {
        let config = DispatcherConfig {
            max_concurrent_requests: Some(4),
            ..Default::default()
        };
        assert_eq!(config.queue_limit(), 4 * DEFAULT_QUEUE_MULTIPLE);
        assert_eq!(config.concurrency_limit(), 4);
    }

    #[test]
    fn test_unbounded_when_nothing_set() {
        let config = DispatcherConfig::default();
        assert_eq!(config.queue_limit(), usize::MAX);
        assert_eq!(config.concurrency_limit(), usize::MAX);
    }

    #[test]
    fn test_explicit_queue_limit_wins() {
        let config = DispatcherConfig {
            max_concurrent_requests: Some(2),
            max_queued_requests: Some(1),
            terminate_on_dispose: false,
        };
        assert_eq!(config.queue_limit(), 1);
    }

    #[test]
    fn test_zero_bounds_rejected() {
        let config = DispatcherConfig {
            max_concurrent_requests: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_with_humantime_durations() {
        let config = Config::from_json_str(
            r#"{
                "broker": { "timeout": "250ms" },
                "dispatcher": { "max_concurrent_requests": 2 },
                "cache": { "max_entries": 10, "ttl": "1s", "sweep_interval": "5s" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.broker.timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.dispatcher.queue_limit(), 32);
        assert_eq!(config.cache.ttl, Some(Duration::from_secs(1)));
        assert_eq!(config.stream.max_frame_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        let err = Config::from_json_str(r#"{ "stream": { "max_frame_bytes": 0 } }"#).unwrap_err();
        assert!(err.to_string().contains("max_frame_bytes"));
    }
}
