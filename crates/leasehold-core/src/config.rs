//! Worker configuration.
//!
//! Everything the transport needs is passed in explicitly through
//! [`LeaseholdConfig`]; nothing is read from process-wide state.
//!
//! ```toml
//! [broker]
//! queue = "fifo_req_calipso"
//! visibility_timeout = 1800
//!
//! [broker.predefined_queues.fifo_req_calipso]
//! url = "http://localhost:9324/queue/fifo_req_calipso"
//!
//! [lease]
//! ping_interval_secs = 2
//!
//! [results]
//! backend_url = "sqs://http://localhost:9324/queue/fifo_res"
//! buffer_size = 10
//! drain_interval_secs = 60
//!
//! [results.buffer]
//! strategy = "shared"
//! url = "redis://localhost:6379/1"
//! key = "leasehold:results"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lease::MAX_VISIBILITY_TIMEOUT;
use crate::ports::queue_client::{SQS_MAX_MESSAGES, SQS_MAX_WAIT_SECONDS};

/// Visibility timeout applied when none is configured (seconds).
pub const DEFAULT_VISIBILITY_TIMEOUT: u32 = 1800;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseholdConfig {
    pub broker: BrokerConfig,
    pub lease: LeaseConfig,
    pub results: ResultsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Queue the worker consumes task messages from.
    pub queue: String,

    /// Base visibility timeout in seconds. Also the lease length requested on receive.
    pub visibility_timeout: u32,

    /// Long-poll wait for each receive call.
    pub wait_time_seconds: u64,

    /// Number of tasks executed concurrently. Also the prefetch budget.
    pub concurrency: usize,

    /// Queue name -> url. When non-empty, only these queues may be used.
    pub predefined_queues: BTreeMap<String, PredefinedQueue>,

    pub endpoint_url: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredefinedQueue {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub ping_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    /// `<scheme>://<queue url or name>`; the last path segment names the result queue.
    pub backend_url: String,
    pub buffer_size: usize,
    pub drain_interval_secs: u64,
    /// How many times a result is offered to the buffer before it is dropped.
    pub store_attempts: u32,
    pub buffer: BufferStrategy,
}

/// Where completed results wait before being drained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BufferStrategy {
    /// Process-local map.
    #[default]
    Memory,

    /// List in an external store shared by several worker processes.
    Shared { url: String, key: String },
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue: "celery".to_string(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            wait_time_seconds: 1,
            concurrency: 4,
            predefined_queues: BTreeMap::new(),
            endpoint_url: None,
            region: None,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 2,
        }
    }
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            backend_url: "sqs://fifo_res".to_string(),
            buffer_size: SQS_MAX_MESSAGES,
            drain_interval_secs: 60,
            store_attempts: 3,
            buffer: BufferStrategy::Memory,
        }
    }
}

impl LeaseholdConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Fail-fast checks run before anything is wired.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.queue.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.queue must not be empty".into()));
        }
        if broker.visibility_timeout == 0 || broker.visibility_timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(ConfigError::Invalid(format!(
                "broker.visibility_timeout must be within 1..={MAX_VISIBILITY_TIMEOUT}, got {}",
                broker.visibility_timeout
            )));
        }
        if broker.wait_time_seconds > SQS_MAX_WAIT_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "broker.wait_time_seconds must be at most {SQS_MAX_WAIT_SECONDS}"
            )));
        }
        if broker.concurrency == 0 {
            return Err(ConfigError::Invalid("broker.concurrency must be at least 1".into()));
        }
        if self.lease.ping_interval_secs == 0 {
            return Err(ConfigError::Invalid("lease.ping_interval_secs must be at least 1".into()));
        }

        let results = &self.results;
        if results.result_queue().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "results.backend_url does not name a queue: {}",
                results.backend_url
            )));
        }
        if results.buffer_size == 0 {
            return Err(ConfigError::Invalid("results.buffer_size must be at least 1".into()));
        }
        if results.drain_interval_secs == 0 {
            return Err(ConfigError::Invalid("results.drain_interval_secs must be at least 1".into()));
        }
        if results.store_attempts == 0 {
            return Err(ConfigError::Invalid("results.store_attempts must be at least 1".into()));
        }
        if let BufferStrategy::Shared { url, key } = &results.buffer
            && (url.trim().is_empty() || key.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "results.buffer: shared strategy needs both url and key".into(),
            ));
        }
        Ok(())
    }
}

impl BrokerConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_seconds)
    }

    pub fn predefined_urls(&self) -> BTreeMap<String, String> {
        self.predefined_queues
            .iter()
            .map(|(name, q)| (name.clone(), q.url.clone()))
            .collect()
    }
}

impl LeaseConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl ResultsConfig {
    /// Backend url without its scheme.
    pub fn as_uri(&self) -> &str {
        match self.backend_url.split_once("://") {
            Some((_, rest)) => rest,
            None => &self.backend_url,
        }
    }

    /// Name of the queue results are sent to.
    pub fn result_queue(&self) -> &str {
        self.as_uri()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        let config = LeaseholdConfig::default();
        config.validate().unwrap();
        assert_eq!(config.broker.visibility_timeout, 1800);
        assert_eq!(config.lease.ping_interval_secs, 2);
        assert_eq!(config.results.buffer_size, 10);
        assert_eq!(config.results.drain_interval_secs, 60);
        assert_eq!(config.results.buffer, BufferStrategy::Memory);
    }

    #[test]
    fn parses_full_document() {
        let raw = r#"
            [broker]
            queue = "fifo_req_calipso"
            visibility_timeout = 120

            [broker.predefined_queues.fifo_req_calipso]
            url = "http://localhost:9324/queue/fifo_req_calipso"

            [lease]
            ping_interval_secs = 3

            [results]
            backend_url = "sqs://http://localhost:9324/queue/fifo_res"
            buffer_size = 2

            [results.buffer]
            strategy = "shared"
            url = "redis://localhost:6379/1"
            key = "leasehold:results"
        "#;
        let config = LeaseholdConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.broker.queue, "fifo_req_calipso");
        assert_eq!(config.broker.visibility_timeout, 120);
        assert_eq!(
            config.broker.predefined_urls().get("fifo_req_calipso").map(String::as_str),
            Some("http://localhost:9324/queue/fifo_req_calipso")
        );
        assert_eq!(config.lease.ping_interval(), Duration::from_secs(3));
        assert_eq!(config.results.buffer_size, 2);
        assert_eq!(config.results.drain_interval_secs, 60);
        assert_eq!(
            config.results.buffer,
            BufferStrategy::Shared {
                url: "redis://localhost:6379/1".into(),
                key: "leasehold:results".into(),
            }
        );
    }

    #[rstest]
    #[case("sqs://http://localhost:9324/queue/fifo_res", "http://localhost:9324/queue/fifo_res", "fifo_res")]
    #[case("sqs://fifo_res", "fifo_res", "fifo_res")]
    #[case("fifo_res", "fifo_res", "fifo_res")]
    #[case("sqs://http://localhost:9324/queue/fifo_res/", "http://localhost:9324/queue/fifo_res/", "fifo_res")]
    fn backend_url_names_result_queue(#[case] url: &str, #[case] uri: &str, #[case] queue: &str) {
        let results = ResultsConfig {
            backend_url: url.to_string(),
            ..ResultsConfig::default()
        };
        assert_eq!(results.as_uri(), uri);
        assert_eq!(results.result_queue(), queue);
    }

    #[rstest]
    #[case("[broker]\nvisibility_timeout = 0")]
    #[case("[broker]\nvisibility_timeout = 43200")]
    #[case("[broker]\nconcurrency = 0")]
    #[case("[broker]\nwait_time_seconds = 21")]
    #[case("[lease]\nping_interval_secs = 0")]
    #[case("[results]\nbuffer_size = 0")]
    #[case("[results]\nstore_attempts = 0")]
    #[case("[results.buffer]\nstrategy = \"shared\"\nurl = \"redis://localhost\"\nkey = \"\"")]
    fn rejects_invalid_values(#[case] raw: &str) {
        let err = LeaseholdConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn reports_missing_file() {
        let err = LeaseholdConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
