//! Core types and data models for chatflow
//!
//! This crate holds the domain entities exchanged over the chat streams and
//! persisted in the moderation tables, together with the canonical stream
//! and group names used by a default deployment.

pub mod errors;
pub mod events;
pub mod models;
pub mod streams;

pub use errors::{Result, TypesError};
pub use events::{BlockCommand, ChatMessage};
pub use models::{normalize_word, BlockList, MASK};
