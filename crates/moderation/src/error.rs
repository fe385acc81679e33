//! Error types for the moderation pipeline

use chatflow_config::ConfigError;
use chatflow_types::TypesError;
use processor::ProcessorError;
use thiserror::Error;

/// Moderation pipeline error
#[derive(Error, Debug)]
pub enum ModerationError {
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid event: {0}")]
    Types(#[from] TypesError),

    /// Unknown group name in a group selection
    #[error("unknown group '{0}' (expected block, ban or filter)")]
    UnknownGroup(String),

    #[error("invalid generator settings: {0}")]
    Generator(String),

    #[error("task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, ModerationError>;
