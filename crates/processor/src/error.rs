//! Error types for the stream processor
//!
//! This module provides error handling for all processor operations
//! including codecs, keyed state, broker transport and handler execution.

use thiserror::Error;

pub use crate::broker::error::BrokerError;
pub use crate::codec::CodecError;

/// Main processor error type
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Codec errors raised outside of event handling (e.g. registry lookups)
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// State backend errors
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Broker transport errors that outlived their retry budget
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Handler errors surfaced by a halted partition
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A partition stopped under the halt policy
    #[error("group '{group}' halted at {topic}/{partition}@{offset}: {reason}")]
    Halted {
        group: String,
        topic: String,
        partition: u32,
        offset: i64,
        reason: String,
    },

    /// A worker or view task panicked or was aborted
    #[error("task failed: {0}")]
    Task(String),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for unexpected conditions
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// State backend and keyed table errors
#[derive(Error, Debug)]
pub enum StateError {
    /// State serialization failed
    #[error("state serialization failed for key '{key}': {reason}")]
    SerializationFailed { key: String, reason: String },

    /// State deserialization failed
    #[error("state deserialization failed for key '{key}': {reason}")]
    DeserializationFailed { key: String, reason: String },

    /// Empty encodings are reserved for tombstones
    #[error("value for key '{key}' encodes to an empty payload, which is reserved for deletes")]
    EmptyEncoding { key: String },

    /// State backend storage error
    #[error("storage error in {backend_type}: {details}")]
    StorageError {
        backend_type: String,
        details: String,
    },

    /// Changelog append failed; the change was not applied
    #[error("changelog write to {topic}/{partition} failed: {source}")]
    ChangelogWrite {
        topic: String,
        partition: u32,
        #[source]
        source: BrokerError,
    },

    /// Changelog replay failed
    #[error("recovery of {topic}/{partition} failed: {reason}")]
    RecoveryFailed {
        topic: String,
        partition: u32,
        reason: String,
    },

    /// Snapshot creation failed
    #[error("snapshot failed for {group}/{partition}: {reason}")]
    SnapshotFailed {
        group: String,
        partition: u32,
        reason: String,
    },

    /// Snapshot restoration failed
    #[error("restore failed from snapshot {group}/{partition}: {reason}")]
    RestoreFailed {
        group: String,
        partition: u32,
        reason: String,
    },

    /// The group was built without a table
    #[error("group '{group}' has no table")]
    NoTable { group: String },
}

impl StateError {
    /// Whether the failure came from the broker and may succeed on retry
    pub fn is_transport(&self) -> bool {
        match self {
            StateError::ChangelogWrite { source, .. } => !source.is_fatal(),
            StateError::RecoveryFailed { .. } => true,
            _ => false,
        }
    }
}

/// Errors returned by event handlers
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler rejected the event
    #[error("{0}")]
    Failed(String),

    /// The event content is not acceptable for this handler
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Encoding an emitted value failed
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Table access failed
    #[error(transparent)]
    State(#[from] StateError),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }

    pub fn invalid_input(reason: impl Into<String>) -> Self {
        HandlerError::InvalidInput(reason.into())
    }
}

/// Result type alias for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Result type alias for state operations
pub type StateResult<T> = std::result::Result<T, StateError>;

/// Result type alias for handler functions
pub type HandlerResult = std::result::Result<(), HandlerError>;

impl From<bincode::Error> for ProcessorError {
    fn from(err: bincode::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ProcessorError {
    fn from(err: anyhow::Error) -> Self {
        ProcessorError::Unexpected(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ProcessorError {
    fn from(err: tokio::task::JoinError) -> Self {
        ProcessorError::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_display() {
        let err = StateError::EmptyEncoding {
            key: "user-1".to_string(),
        };
        assert!(err.to_string().contains("reserved for deletes"));
    }

    #[test]
    fn test_changelog_write_is_transport() {
        let err = StateError::ChangelogWrite {
            topic: "g-table".to_string(),
            partition: 0,
            source: BrokerError::production("injected", "g-table", Some(0)),
        };
        assert!(err.is_transport());

        let err = StateError::NoTable {
            group: "g".to_string(),
        };
        assert!(!err.is_transport());
    }

    #[test]
    fn test_processor_error_from_handler_error() {
        let err: ProcessorError = HandlerError::failed("nope").into();
        assert!(matches!(err, ProcessorError::Handler(_)));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_halted_display() {
        let err = ProcessorError::Halted {
            group: "g".to_string(),
            topic: "t".to_string(),
            partition: 2,
            offset: 17,
            reason: "bad".to_string(),
        };
        assert_eq!(err.to_string(), "group 'g' halted at t/2@17: bad");
    }
}
