//! Configuration loading, validation, and management for Busline.
//!
//! Loads configuration from `~/.busline/config.toml` with environment
//! variable overrides. Validates all settings at startup and converts them
//! into the option structs the broker driver and consumer understand.

use busline_core::{Compression, ReaderOptions, RequiredAcks, RetryPolicy, StartOffset, WriterOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.busline/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bootstrap broker addresses
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    /// Producer settings
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Consumer settings
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Built-in interceptors
    #[serde(default)]
    pub interceptors: InterceptorConfig,
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".into()]
}
fn default_topic() -> String {
    "events".into()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Topic envelopes are published to
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Write attempts the driver makes before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// How long the driver waits to fill a batch
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    #[serde(default)]
    pub required_acks: RequiredAcks,

    #[serde(default)]
    pub compression: Compression,

    /// Return before the broker acknowledges the write
    #[serde(default)]
    pub async_write: bool,

    /// Side topic for envelopes whose write failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_topic: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_batch_timeout_ms() -> u64 {
    10
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            max_attempts: default_max_attempts(),
            batch_timeout_ms: default_batch_timeout_ms(),
            required_acks: RequiredAcks::default(),
            compression: Compression::default(),
            async_write: false,
            dead_letter_topic: None,
        }
    }
}

/// When the consumer commits a record's offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Commit after every processed record, whatever the outcome.
    #[default]
    Always,
    /// Hold the commit and stop the loop when a terminal failure could not
    /// be written to the dead-letter topic.
    AfterTerminalHandling,
}

/// What the consumer does with business-rejected envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessErrorPolicy {
    #[default]
    DeadLetter,
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Topic to consume
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Consumer group id
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// "newest", "oldest" or an explicit offset
    #[serde(default)]
    pub start_offset: StartOffset,

    #[serde(default = "default_min_bytes")]
    pub min_bytes: usize,

    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// 0 = commit synchronously
    #[serde(default)]
    pub commit_interval_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    #[serde(default = "default_rebalance_timeout_ms")]
    pub rebalance_timeout_ms: u64,

    /// In-place retries for transient handler failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first in-place retry (0 = immediate)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Cap for the exponential in-place retry delay
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    /// Pause after a failed fetch before fetching again
    #[serde(default = "default_fetch_backoff_ms")]
    pub fetch_backoff_ms: u64,

    #[serde(default)]
    pub commit_policy: CommitPolicy,

    #[serde(default)]
    pub business_errors: BusinessErrorPolicy,

    /// Side topic for envelopes that could not be processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_topic: Option<String>,
}

fn default_group_id() -> String {
    "busline".into()
}
fn default_min_bytes() -> usize {
    1
}
fn default_max_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_max_wait_ms() -> u64 {
    500
}
fn default_heartbeat_interval_ms() -> u64 {
    3_000
}
fn default_session_timeout_ms() -> u64 {
    30_000
}
fn default_rebalance_timeout_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    100
}
fn default_retry_backoff_max_ms() -> u64 {
    5_000
}
fn default_fetch_backoff_ms() -> u64 {
    1_000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            group_id: default_group_id(),
            start_offset: StartOffset::default(),
            min_bytes: default_min_bytes(),
            max_bytes: default_max_bytes(),
            max_wait_ms: default_max_wait_ms(),
            commit_interval_ms: 0,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            rebalance_timeout_ms: default_rebalance_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            fetch_backoff_ms: default_fetch_backoff_ms(),
            commit_policy: CommitPolicy::default(),
            business_errors: BusinessErrorPolicy::default(),
            dead_letter_topic: None,
        }
    }
}

impl ConsumerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_backoff_ms),
            multiplier: 2.0,
            max_delay: Duration::from_millis(self.retry_backoff_max_ms),
        }
    }

    pub fn fetch_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptorConfig {
    /// Master switch for the built-in interceptors
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub logging: bool,

    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            logging: true,
            metrics: true,
        }
    }
}

impl BusConfig {
    /// Load configuration from the default path (~/.busline/config.toml).
    ///
    /// Environment variables override the file:
    /// - `BUSLINE_BROKERS` (comma-separated)
    /// - `BUSLINE_TOPIC` (producer and consumer)
    /// - `BUSLINE_GROUP_ID`
    /// - `BUSLINE_DLQ_TOPIC` (producer and consumer)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(&Self::config_dir().join("config.toml"))
    }

    /// Load from `path`, then apply the environment overrides and validate.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".busline")
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// [`load`](Self::load)).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(brokers) = lookup("BUSLINE_BROKERS") {
            let list: Vec<String> = brokers
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(String::from)
                .collect();
            if !list.is_empty() {
                self.brokers = list;
            }
        }

        if let Some(topic) = lookup("BUSLINE_TOPIC") {
            self.producer.topic = topic.clone();
            self.consumer.topic = topic;
        }

        if let Some(group) = lookup("BUSLINE_GROUP_ID") {
            self.consumer.group_id = group;
        }

        if let Some(dlq) = lookup("BUSLINE_DLQ_TOPIC") {
            self.producer.dead_letter_topic = Some(dlq.clone());
            self.consumer.dead_letter_topic = Some(dlq);
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.is_empty() || self.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "brokers must list at least one non-empty address".into(),
            ));
        }

        let p = &self.producer;
        if p.topic.is_empty() {
            return Err(ConfigError::ValidationError("producer.topic must not be empty".into()));
        }
        if p.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "producer.max_attempts must be at least 1".into(),
            ));
        }
        check_dead_letter_topic("producer", &p.topic, p.dead_letter_topic.as_deref())?;

        let c = &self.consumer;
        if c.topic.is_empty() {
            return Err(ConfigError::ValidationError("consumer.topic must not be empty".into()));
        }
        if c.group_id.is_empty() {
            return Err(ConfigError::ValidationError(
                "consumer.group_id must not be empty".into(),
            ));
        }
        if c.max_bytes == 0 || c.min_bytes > c.max_bytes {
            return Err(ConfigError::ValidationError(format!(
                "consumer.min_bytes ({}) must not exceed consumer.max_bytes ({})",
                c.min_bytes, c.max_bytes
            )));
        }
        if c.heartbeat_interval_ms >= c.session_timeout_ms {
            return Err(ConfigError::ValidationError(
                "consumer.heartbeat_interval_ms must be shorter than consumer.session_timeout_ms"
                    .into(),
            ));
        }
        if let StartOffset::At(offset) = c.start_offset
            && offset < 0
        {
            return Err(ConfigError::ValidationError(format!(
                "consumer.start_offset must be >= 0, got {offset}"
            )));
        }
        check_dead_letter_topic("consumer", &c.topic, c.dead_letter_topic.as_deref())?;

        Ok(())
    }

    /// Options for the broker writer.
    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            brokers: self.brokers.clone(),
            max_attempts: self.producer.max_attempts,
            batch_timeout: Duration::from_millis(self.producer.batch_timeout_ms),
            required_acks: self.producer.required_acks,
            compression: self.producer.compression,
            async_write: self.producer.async_write,
        }
    }

    /// Options for the broker reader.
    pub fn reader_options(&self) -> ReaderOptions {
        let c = &self.consumer;
        ReaderOptions {
            brokers: self.brokers.clone(),
            topic: c.topic.clone(),
            group_id: c.group_id.clone(),
            start_offset: c.start_offset,
            min_bytes: c.min_bytes,
            max_bytes: c.max_bytes,
            max_wait: Duration::from_millis(c.max_wait_ms),
            commit_interval: Duration::from_millis(c.commit_interval_ms),
            heartbeat_interval: Duration::from_millis(c.heartbeat_interval_ms),
            session_timeout: Duration::from_millis(c.session_timeout_ms),
            rebalance_timeout: Duration::from_millis(c.rebalance_timeout_ms),
        }
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn check_dead_letter_topic(
    section: &str,
    topic: &str,
    dead_letter_topic: Option<&str>,
) -> Result<(), ConfigError> {
    match dead_letter_topic {
        Some("") => Err(ConfigError::ValidationError(format!(
            "{section}.dead_letter_topic must not be empty when set"
        ))),
        Some(dlq) if dlq == topic => Err(ConfigError::ValidationError(format!(
            "{section}.dead_letter_topic must differ from {section}.topic"
        ))),
        _ => Ok(()),
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            interceptors: InterceptorConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = BusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.brokers, vec!["localhost:9092"]);
        assert_eq!(config.consumer.max_retries, 3);
        assert_eq!(config.consumer.commit_policy, CommitPolicy::Always);
        assert!(config.interceptors.enabled);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = BusConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: BusConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.producer.topic, config.producer.topic);
        assert_eq!(parsed.consumer.start_offset, config.consumer.start_offset);
    }

    #[test]
    fn full_config_parsing() {
        let toml_str = r#"
brokers = ["kafka-1:9092", "kafka-2:9092"]

[producer]
topic = "orders"
max_attempts = 5
required_acks = "leader"
compression = "zstd"
async_write = true
dead_letter_topic = "orders.dlq"

[consumer]
topic = "orders"
group_id = "billing"
start_offset = 120
max_retries = 5
commit_policy = "after_terminal_handling"
business_errors = "discard"
dead_letter_topic = "orders.dlq"

[interceptors]
enabled = false
"#;
        let config: BusConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.brokers.len(), 2);
        assert_eq!(config.producer.required_acks, RequiredAcks::Leader);
        assert_eq!(config.producer.compression, Compression::Zstd);
        assert!(config.producer.async_write);
        assert_eq!(config.consumer.start_offset, StartOffset::At(120));
        assert_eq!(config.consumer.commit_policy, CommitPolicy::AfterTerminalHandling);
        assert_eq!(config.consumer.business_errors, BusinessErrorPolicy::Discard);
        assert!(!config.interceptors.enabled);
        assert!(config.interceptors.metrics);
    }

    #[test]
    fn unknown_compression_rejected() {
        let toml_str = r#"
[producer]
compression = "brotli"
"#;
        assert!(toml::from_str::<BusConfig>(toml_str).is_err());
    }

    #[test]
    fn negative_start_offset_rejected() {
        let toml_str = r#"
[consumer]
start_offset = -5
"#;
        assert!(toml::from_str::<BusConfig>(toml_str).is_err());
    }

    #[test]
    fn min_bytes_above_max_rejected() {
        let mut config = BusConfig::default();
        config.consumer.min_bytes = 2048;
        config.consumer.max_bytes = 1024;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn dead_letter_topic_must_differ() {
        let mut config = BusConfig::default();
        config.consumer.dead_letter_topic = Some(config.consumer.topic.clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_brokers_rejected() {
        let config = BusConfig {
            brokers: vec![],
            ..BusConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = BusConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        assert_eq!(result.unwrap().producer.topic, "events");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[consumer]\ngroup_id = \"audit\"\n").unwrap();
        let config = BusConfig::load_from(&path).unwrap();
        assert_eq!(config.consumer.group_id, "audit");
    }

    #[test]
    fn invalid_file_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "brokers = 12").unwrap();
        assert!(matches!(
            BusConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("BUSLINE_BROKERS", "a:9092, b:9092"),
            ("BUSLINE_TOPIC", "payments"),
            ("BUSLINE_GROUP_ID", "ledger"),
            ("BUSLINE_DLQ_TOPIC", "payments.dlq"),
        ]);
        let mut config = BusConfig::default();
        config.apply_env_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.brokers, vec!["a:9092", "b:9092"]);
        assert_eq!(config.producer.topic, "payments");
        assert_eq!(config.consumer.topic, "payments");
        assert_eq!(config.consumer.group_id, "ledger");
        assert_eq!(config.consumer.dead_letter_topic.as_deref(), Some("payments.dlq"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn options_follow_config() {
        let config = BusConfig::default();
        let writer = config.writer_options();
        assert_eq!(writer.max_attempts, 3);
        assert_eq!(writer.batch_timeout, Duration::from_millis(10));

        let reader = config.reader_options();
        assert_eq!(reader.group_id, "busline");
        assert_eq!(reader.max_wait, Duration::from_millis(500));

        let retry = config.consumer.retry_policy();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.base_delay, Duration::from_millis(100));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = BusConfig::default_toml();
        assert!(toml_str.contains("localhost:9092"));
        assert!(toml_str.contains("group_id"));
    }
}
