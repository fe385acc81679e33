//! Processing groups
//!
//! A processing group is a named set of input topics, one handler per input,
//! and an optional table keyed like the inputs. [`GroupBuilder`] declares
//! it, [`Processor`] runs it as one member of the group's consumer group.

mod context;
mod definition;
mod processor;
mod stats;
mod worker;

pub use context::Context;
pub use definition::{GroupBuilder, GroupGraph};
pub use processor::Processor;
pub use stats::{ProcessorStats, ProcessorStatsSnapshot};
