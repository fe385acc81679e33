//! Broker transport errors.
//!
//! Errors carry enough context (topic, partition, offset, group) to be
//! logged on their own, and classify themselves as retryable or fatal so
//! that callers can decide between backing off and giving up.

use thiserror::Error;

/// Result type alias for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Error type for broker operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Error establishing connection to the broker.
    #[error("Failed to connect to broker {broker}: {message}")]
    Connection {
        /// Error message describing the connection failure.
        message: String,
        /// Broker address that failed to connect.
        broker: String,
    },

    /// Error while fetching records.
    #[error("Failed to fetch from topic {topic}: {message}")]
    Consumption {
        /// Error message describing the fetch failure.
        message: String,
        /// Topic from which the fetch failed.
        topic: String,
        /// Partition number if available.
        partition: Option<u32>,
        /// Offset if available.
        offset: Option<i64>,
    },

    /// Error while appending a record.
    #[error("Failed to produce message to topic {topic}: {message}")]
    Production {
        /// Error message describing the production failure.
        message: String,
        /// Topic to which production failed.
        topic: String,
        /// Partition number if available.
        partition: Option<u32>,
    },

    /// Error committing offsets.
    #[error("Failed to commit offset {offset} of {topic}/{partition} for group {group}: {message}")]
    OffsetCommit {
        message: String,
        group: String,
        topic: String,
        partition: u32,
        offset: i64,
    },

    /// Error during consumer group coordination.
    #[error("Consumer group coordination error for group {group}: {message}")]
    GroupCoordination {
        /// Error message describing the coordination failure.
        message: String,
        /// Consumer group id.
        group: String,
    },

    /// Topic does not exist and cannot be created implicitly.
    #[error("Unknown topic {0}")]
    UnknownTopic(String),

    /// Error when a topic partition doesn't exist.
    #[error("Topic partition {topic}/{partition} does not exist")]
    PartitionNotFound {
        /// Topic name.
        topic: String,
        /// Partition number.
        partition: u32,
    },

    /// Error related to topic metadata or topic administration.
    #[error("Topic metadata error for topic {topic}: {message}")]
    TopicMetadata {
        /// Error message describing the metadata failure.
        message: String,
        /// Topic name.
        topic: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Error message describing the configuration issue.
        message: String,
        /// Field name that has invalid configuration.
        field: Option<String>,
    },

    /// Timeout error during broker operations.
    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Error from the underlying kafka client library.
    #[error("Kafka client error: {message} (error code: {code:?})")]
    Client {
        message: String,
        code: Option<i32>,
    },

    /// The broker handle has been shut down.
    #[error("Broker is closed")]
    Closed,
}

impl BrokerError {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>, broker: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            broker: broker.into(),
        }
    }

    /// Create a consumption error.
    pub fn consumption(
        message: impl Into<String>,
        topic: impl Into<String>,
        partition: Option<u32>,
        offset: Option<i64>,
    ) -> Self {
        Self::Consumption {
            message: message.into(),
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// Create a production error.
    pub fn production(
        message: impl Into<String>,
        topic: impl Into<String>,
        partition: Option<u32>,
    ) -> Self {
        Self::Production {
            message: message.into(),
            topic: topic.into(),
            partition,
        }
    }

    /// Create an offset commit error.
    pub fn offset_commit(
        message: impl Into<String>,
        group: impl Into<String>,
        topic: impl Into<String>,
        partition: u32,
        offset: i64,
    ) -> Self {
        Self::OffsetCommit {
            message: message.into(),
            group: group.into(),
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// Create a group coordination error.
    pub fn group_coordination(message: impl Into<String>, group: impl Into<String>) -> Self {
        Self::GroupCoordination {
            message: message.into(),
            group: group.into(),
        }
    }

    /// Create a topic metadata error.
    pub fn topic_metadata(message: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::TopicMetadata {
            message: message.into(),
            topic: topic.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>, field: Option<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
            field,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a kafka client error.
    pub fn client(message: impl Into<String>, code: Option<i32>) -> Self {
        Self::Client {
            message: message.into(),
            code,
        }
    }

    /// Check if the error is retryable.
    ///
    /// Returns `true` if the operation that caused this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout { .. }
                | BrokerError::Connection { .. }
                | BrokerError::Consumption { .. }
                | BrokerError::Production { .. }
                | BrokerError::OffsetCommit { .. }
                | BrokerError::GroupCoordination { .. }
                | BrokerError::Client { .. }
        )
    }

    /// Check if the error is fatal and requires the caller to stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::InvalidConfiguration { .. } | BrokerError::Closed
        )
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for BrokerError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        use rdkafka::error::KafkaError as RdKafkaError;

        match err {
            RdKafkaError::ClientCreation(msg) => BrokerError::connection(msg, "unknown"),
            RdKafkaError::MetadataFetch(code) => {
                BrokerError::topic_metadata(code.to_string(), "unknown")
            }
            RdKafkaError::Subscription(msg) => BrokerError::group_coordination(msg, "unknown"),
            RdKafkaError::MessageProduction(code) => BrokerError::production(
                format!("Message production failed with code: {:?}", code),
                "unknown",
                None,
            ),
            RdKafkaError::MessageConsumption(code) => BrokerError::consumption(
                format!("Message consumption failed with code: {:?}", code),
                "unknown",
                None,
                None,
            ),
            RdKafkaError::ConsumerCommit(code) => {
                BrokerError::offset_commit(code.to_string(), "unknown", "unknown", 0, -1)
            }
            other => BrokerError::client(other.to_string(), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_retryable() {
        assert!(BrokerError::timeout("fetch", 1000).is_retryable());
        assert!(BrokerError::production("queue full", "t", Some(1)).is_retryable());
        assert!(!BrokerError::invalid_config("no brokers", None).is_retryable());
        assert!(!BrokerError::Closed.is_retryable());
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(BrokerError::Closed.is_fatal());
        assert!(BrokerError::invalid_config("no brokers", None).is_fatal());
        assert!(!BrokerError::timeout("fetch", 1000).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = BrokerError::offset_commit("rejected", "g", "t", 3, 42);
        let display = err.to_string();
        assert!(display.contains("t/3"));
        assert!(display.contains("group g"));
    }
}
