//! Event types carried on the chat streams

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TypesError};

/// A chat message between two users.
///
/// This is the payload of the `messages` input stream and of the
/// `filtered-messages` output stream. Field names follow the wire format
/// used by existing producers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// Sending user
    #[serde(rename = "send_user_id")]
    pub sender_id: i64,
    /// Receiving user
    #[serde(rename = "receive_user_id")]
    pub receiver_id: i64,
    /// Message body
    #[serde(rename = "message")]
    pub text: String,
}

impl ChatMessage {
    /// Create a new chat message
    pub fn new(sender_id: i64, receiver_id: i64, text: impl Into<String>) -> Self {
        Self {
            sender_id,
            receiver_id,
            text: text.into(),
        }
    }

    /// Key used when the message enters the pipeline (sender id)
    pub fn sender_key(&self) -> String {
        self.sender_id.to_string()
    }

    /// Key used when the message leaves the pipeline (receiver id)
    pub fn receiver_key(&self) -> String {
        self.receiver_id.to_string()
    }
}

/// A "user blocks user" command.
///
/// On the wire the command is split across the record: the key is the
/// blocking (receiving) user and the value is the blocked user, both as
/// decimal strings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BlockCommand {
    /// User that no longer wants to receive messages
    pub receiver_id: i64,
    /// User being blocked
    pub blocked_id: i64,
}

impl BlockCommand {
    pub fn new(receiver_id: i64, blocked_id: i64) -> Self {
        Self {
            receiver_id,
            blocked_id,
        }
    }

    /// Rebuild a command from its record key and value
    pub fn from_record(key: &str, value: &str) -> Result<Self> {
        Ok(Self {
            receiver_id: parse_user_id(key)?,
            blocked_id: parse_user_id(value)?,
        })
    }

    /// Record key (receiver id)
    pub fn key(&self) -> String {
        self.receiver_id.to_string()
    }

    /// Record value (blocked id)
    pub fn value(&self) -> String {
        self.blocked_id.to_string()
    }
}

/// Parse a decimal user id as found in record keys and values
pub fn parse_user_id(raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|e| TypesError::InvalidUserId {
            value: raw.to_string(),
            reason: e.to_string(),
        })
}
