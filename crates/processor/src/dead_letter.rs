//! Dead-letter routing for skipped events
//!
//! When a processing group skips an event (decode failure or a handler error
//! under the skip policy) and a dead-letter topic is configured, the raw
//! event is published there as JSON together with the failure reason.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::broker::{Broker, Record};
use crate::codec::{JsonCodec, Topic};
use crate::error::Result;

/// A skipped event with its failure context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Processing group that skipped the event
    pub group: String,
    /// Source topic
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
    pub key: String,
    /// Raw payload as read from the source topic
    pub payload: Vec<u8>,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_record(group: &str, record: &Record, reason: impl Into<String>) -> Self {
        Self {
            group: group.to_string(),
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key.clone(),
            payload: record.payload.clone(),
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Publishes [`DeadLetter`]s keyed by the original event key
#[derive(Clone)]
pub struct DeadLetterSink {
    broker: Arc<dyn Broker>,
    topic: Topic<DeadLetter>,
}

impl DeadLetterSink {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: Topic::new(topic, JsonCodec::new()),
        }
    }

    pub fn topic(&self) -> &Topic<DeadLetter> {
        &self.topic
    }

    pub async fn publish(&self, letter: &DeadLetter) -> Result<()> {
        let payload = self.topic.encode(letter)?;
        let (partition, offset) = self
            .broker
            .produce_keyed(self.topic.name(), &letter.key, &payload)
            .await?;
        debug!(
            dead_letter_topic = self.topic.name(),
            partition,
            offset,
            source_topic = %letter.topic,
            source_offset = letter.offset,
            "event dead-lettered"
        );
        Ok(())
    }

    /// Publish and only log failures; a dead-letter outage never stalls a partition
    pub async fn publish_or_log(&self, letter: &DeadLetter) {
        if let Err(e) = self.publish(letter).await {
            warn!(
                dead_letter_topic = self.topic.name(),
                source_topic = %letter.topic,
                source_offset = letter.offset,
                error = %e,
                "failed to publish dead letter"
            );
        }
    }
}
