//! Table changelog topics
//!
//! Each processing group with a table owns one compacted topic named
//! `<group>-table`, partitioned like the group's inputs. Records are full
//! values keyed by table key; an empty payload deletes the key.

use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

use crate::broker::{Broker, BrokerError, BrokerResult, Record};

const REPLAY_BATCH: usize = 1000;
const REPLAY_WAIT: Duration = Duration::from_millis(100);
const MAX_IDLE_REPLAY_POLLS: u32 = 50;

/// Name of the changelog topic backing `group`'s table
pub fn table_topic(group: &str) -> String {
    format!("{}-table", group)
}

/// Append/replay access to one group's changelog topic
#[derive(Clone)]
pub struct Changelog {
    broker: Arc<dyn Broker>,
    topic: String,
}

impl Changelog {
    pub fn new(broker: Arc<dyn Broker>, group: &str) -> Self {
        Self::for_topic(broker, table_topic(group))
    }

    pub fn for_topic(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Append a record and return its offset once the broker acknowledged it
    pub async fn append(&self, partition: u32, key: &str, payload: &[u8]) -> BrokerResult<i64> {
        self.broker.produce(&self.topic, partition, key, payload).await
    }

    /// Apply every record in `[from, high watermark)` in order and return the
    /// offset following the last applied record
    pub async fn replay<F>(&self, partition: u32, from: i64, mut apply: F) -> BrokerResult<i64>
    where
        F: FnMut(Record),
    {
        let end = self.broker.high_watermark(&self.topic, partition).await?;
        let mut next = from;
        let mut idle_polls = 0;

        while next < end {
            let records = self
                .broker
                .fetch(&self.topic, partition, next, REPLAY_BATCH, REPLAY_WAIT)
                .await?;

            if records.is_empty() {
                idle_polls += 1;
                if idle_polls >= MAX_IDLE_REPLAY_POLLS {
                    return Err(BrokerError::consumption(
                        format!("replay stalled at offset {} before {}", next, end),
                        self.topic.clone(),
                        Some(partition),
                        Some(next),
                    ));
                }
                warn!(topic = %self.topic, partition, next, end, "changelog replay idle");
                continue;
            }
            idle_polls = 0;

            for record in records {
                if record.offset >= end {
                    return Ok(end);
                }
                next = record.offset + 1;
                apply(record);
            }
        }

        trace!(topic = %self.topic, partition, from, to = next, "changelog replayed");
        Ok(next.max(from))
    }
}
