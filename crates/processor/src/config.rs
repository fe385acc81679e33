//! Runtime configuration of processing groups, views and emitters
//!
//! These are the resolved, typed forms of the `processing`, `broker` and
//! `emitter` sections of [`ChatflowConfig`].

use chatflow_config::ChatflowConfig;
use std::time::Duration;

pub use chatflow_config::{ErrorPolicy, OffsetReset};

use crate::broker::RetryPolicy;
use crate::error::{ProcessorError, Result};

/// Processing-group configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    /// Idle wait of a partition worker's fetch
    pub poll_timeout: Duration,

    /// Maximum records fetched per input per poll
    pub max_poll_records: usize,

    /// What happens to an event whose handler failed
    pub error_policy: ErrorPolicy,

    /// Retry budget for table writes, emits, commits and fetches
    pub retry: RetryPolicy,

    /// Start position for partitions without a committed offset
    pub offset_reset: OffsetReset,

    /// Topic receiving skipped events
    pub dead_letter_topic: Option<String>,

    /// Table writes between snapshots (0 disables)
    pub snapshot_interval: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            max_poll_records: 500,
            error_policy: ErrorPolicy::Skip,
            retry: RetryPolicy::default(),
            offset_reset: OffsetReset::Earliest,
            dead_letter_topic: None,
            snapshot_interval: 1000,
        }
    }
}

impl ProcessorConfig {
    /// Resolve from the layered application configuration
    pub fn from_settings(settings: &ChatflowConfig) -> Self {
        let processing = &settings.processing;
        Self {
            poll_timeout: processing.poll_timeout(),
            max_poll_records: processing.max_poll_records,
            error_policy: processing.error_policy,
            retry: RetryPolicy::new(processing.max_retries, processing.retry_backoff()),
            offset_reset: settings.broker.offset_reset,
            dead_letter_topic: processing.dead_letter_topic.clone(),
            snapshot_interval: processing.snapshot_interval,
        }
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.offset_reset = reset;
        self
    }

    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll_timeout.is_zero() {
            return Err(ProcessorError::Configuration(
                "poll_timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_poll_records == 0 {
            return Err(ProcessorError::Configuration(
                "max_poll_records must be greater than 0".to_string(),
            ));
        }

        if let Some(topic) = &self.dead_letter_topic {
            if topic.trim().is_empty() {
                return Err(ProcessorError::Configuration(
                    "dead_letter_topic must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}
