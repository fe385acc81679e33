//! Error types for domain parsing

use thiserror::Error;

/// Result type alias for domain operations
pub type Result<T> = std::result::Result<T, TypesError>;

/// Errors raised while interpreting raw stream values as domain entities
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypesError {
    #[error("invalid user id '{value}': {reason}")]
    InvalidUserId { value: String, reason: String },

    #[error("invalid word '{0}': words must be non-empty and contain no whitespace")]
    InvalidWord(String),
}
