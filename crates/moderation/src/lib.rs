//! Chat moderation on top of the stream processor
//!
//! Three processing groups cooperate through the broker:
//!
//! - `blocked-users-group` keeps the senders each receiver blocked
//! - `group-banned-words` keeps the banned words
//! - `filtered-messages-group` drops messages from blocked senders, masks
//!   banned words and forwards the rest keyed by receiver
//!
//! ```rust,no_run
//! use chatflow_config::ChatflowConfig;
//! use moderation::{GroupKind, Pipeline};
//! use processor::MemoryBroker;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> moderation::Result<()> {
//!     let broker = Arc::new(MemoryBroker::new(4));
//!     let pipeline = Pipeline::new(broker, ChatflowConfig::default())?;
//!     pipeline.run(&GroupKind::ALL, CancellationToken::new()).await
//! }
//! ```

pub mod client;
pub mod error;
pub mod generator;
pub mod groups;
pub mod pipeline;
pub mod topics;

pub use client::ModerationClient;
pub use error::{ModerationError, Result};
pub use generator::{GeneratorConfig, GeneratorStats, TrafficGenerator};
pub use groups::{ban_group, block_group, filter_group, filter_message};
pub use pipeline::{GroupKind, Pipeline, RunningPipeline};
pub use topics::Topics;
