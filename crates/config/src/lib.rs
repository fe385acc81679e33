//! Configuration management for chatflow
//!
//! Settings are layered with figment: built-in defaults, then an optional
//! YAML file, then environment variables prefixed with `CHATFLOW_` (nested
//! keys separated by `__`, e.g. `CHATFLOW_BROKER__MODE=kafka`).

use chatflow_types::streams;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level chatflow configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatflowConfig {
    /// Message broker connection
    pub broker: BrokerConfig,

    /// Processing-group behaviour
    pub processing: ProcessingConfig,

    /// Local state and snapshots
    pub state: StateConfig,

    /// Stream and group names
    pub topics: TopicNames,

    /// Emitter delivery settings
    pub emitter: EmitterConfig,
}

impl ChatflowConfig {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        Self::figment(config_path)
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))
    }

    /// The layered provider chain, exposed for callers that add their own layers
    pub fn figment(config_path: Option<PathBuf>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(ChatflowConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        figment.merge(Env::prefixed("CHATFLOW_").split("__"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.broker.mode == BrokerMode::Kafka && self.broker.brokers.is_empty() {
            return Err(ConfigError::ValidationError(
                "kafka mode requires at least one bootstrap broker".to_string(),
            ));
        }

        if self.broker.default_partitions == 0 {
            return Err(ConfigError::ValidationError(
                "default_partitions must be greater than zero".to_string(),
            ));
        }

        if self.broker.auto_commit {
            return Err(ConfigError::ValidationError(
                "auto_commit must be disabled, offsets are committed after processing".to_string(),
            ));
        }

        if self.processing.poll_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.processing.max_poll_records == 0 {
            return Err(ConfigError::ValidationError(
                "max_poll_records must be greater than zero".to_string(),
            ));
        }

        self.topics.validate()
    }
}

/// Broker backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerMode {
    /// In-process broker, state is lost on exit
    #[default]
    Memory,
    /// Apache Kafka cluster
    Kafka,
}

/// Where a group starts reading when it has no committed offset
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

/// What a processing group does with an event whose handler failed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log the failure, dead-letter the event and move on
    #[default]
    Skip,
    /// Stop the partition without committing past the event
    Halt,
}

/// Emitter delivery mode used by the CLI commands
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Sync,
    Async,
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub mode: BrokerMode,

    /// Bootstrap servers (kafka mode)
    pub brokers: Vec<String>,

    /// Partition count used when a topic is created
    pub default_partitions: u32,

    pub offset_reset: OffsetReset,

    /// Must stay false; processing groups commit explicitly
    pub auto_commit: bool,

    /// Additional client properties passed through to the kafka client
    pub extra: BTreeMap<String, String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: BrokerMode::Memory,
            brokers: vec!["localhost:9092".to_string()],
            default_partitions: 10,
            offset_reset: OffsetReset::Earliest,
            auto_commit: false,
            extra: BTreeMap::new(),
        }
    }
}

/// Processing-group configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Idle wait per fetch, in milliseconds
    pub poll_timeout_ms: u64,

    /// Maximum records fetched per partition per poll
    pub max_poll_records: usize,

    pub error_policy: ErrorPolicy,

    /// Transport retries before a failure is treated as fatal
    pub max_retries: u32,

    /// Base delay of the exponential retry backoff, in milliseconds
    pub retry_backoff_ms: u64,

    /// Topic receiving skipped events, if any
    pub dead_letter_topic: Option<String>,

    /// Table writes between local snapshots, 0 disables snapshots
    pub snapshot_interval: u64,
}

impl ProcessingConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            max_poll_records: 500,
            error_policy: ErrorPolicy::Skip,
            max_retries: 5,
            retry_backoff_ms: 50,
            dead_letter_topic: None,
            snapshot_interval: 1000,
        }
    }
}

/// Local state configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateConfig {
    /// Directory of the sled snapshot store; in-memory snapshots when unset
    pub snapshot_dir: Option<PathBuf>,
}

/// Stream and group names
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopicNames {
    pub messages: String,
    pub banned_words: String,
    pub blocked_users: String,
    pub filtered_messages: String,
    pub blocked_users_group: String,
    pub banned_words_group: String,
    pub filter_group: String,
}

impl TopicNames {
    fn validate(&self) -> Result<()> {
        let names = [
            &self.messages,
            &self.banned_words,
            &self.blocked_users,
            &self.filtered_messages,
            &self.blocked_users_group,
            &self.banned_words_group,
            &self.filter_group,
        ];

        let mut seen = HashSet::new();
        for name in names {
            if name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "topic and group names must not be empty".to_string(),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate topic or group name '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl Default for TopicNames {
    fn default() -> Self {
        Self {
            messages: streams::MESSAGES.to_string(),
            banned_words: streams::BANNED_WORDS.to_string(),
            blocked_users: streams::BLOCKED_USERS.to_string(),
            filtered_messages: streams::FILTERED_MESSAGES.to_string(),
            blocked_users_group: streams::BLOCKED_USERS_GROUP.to_string(),
            banned_words_group: streams::BANNED_WORDS_GROUP.to_string(),
            filter_group: streams::FILTERED_MESSAGES_GROUP.to_string(),
        }
    }
}

/// Emitter configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmitterConfig {
    pub delivery: DeliveryMode,

    /// Upper bound on a single send, in milliseconds
    pub send_timeout_ms: u64,
}

impl EmitterConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::Sync,
            send_timeout_ms: 5000,
        }
    }
}
