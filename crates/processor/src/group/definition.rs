//! Declarative processing-group definitions
//!
//! A group binds each input topic to exactly one typed handler and
//! optionally persists a table of `V` values:
//!
//! ```rust,no_run
//! use processor::codec::{StringCodec, Topic};
//! use processor::group::GroupBuilder;
//!
//! # fn main() -> processor::Result<()> {
//! let greetings = Topic::new("greetings", StringCodec);
//! let graph = GroupBuilder::<String>::new("last-greeting")
//!     .input(greetings, |ctx, text: String| ctx.set_value(text))
//!     .persist(StringCodec)
//!     .build()?;
//! assert_eq!(graph.input_topics(), vec!["greetings".to_string()]);
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use super::context::Context;
use crate::codec::{Codec, CodecError, Topic};
use crate::error::{HandlerError, HandlerResult, ProcessorError, Result};
use crate::state::table_topic;

/// Why an event could not be handled
#[derive(Debug)]
pub(crate) enum DispatchError {
    Decode(CodecError),
    Handler(HandlerError),
}

/// Type-erased input binding used by partition workers
pub(crate) trait InputHandler<V>: Send + Sync {
    fn topic(&self) -> &str;

    fn dispatch(
        &self,
        ctx: &mut Context<'_, V>,
        payload: &[u8],
    ) -> std::result::Result<(), DispatchError>;
}

struct TypedInput<M, F> {
    topic: Topic<M>,
    handler: F,
}

impl<V, M, F> InputHandler<V> for TypedInput<M, F>
where
    M: 'static,
    F: Fn(&mut Context<'_, V>, M) -> HandlerResult + Send + Sync + 'static,
{
    fn topic(&self) -> &str {
        self.topic.name()
    }

    fn dispatch(
        &self,
        ctx: &mut Context<'_, V>,
        payload: &[u8],
    ) -> std::result::Result<(), DispatchError> {
        let message = self.topic.decode(payload).map_err(DispatchError::Decode)?;
        (self.handler)(ctx, message).map_err(DispatchError::Handler)
    }
}

/// Builder of a [`GroupGraph`]
pub struct GroupBuilder<V> {
    name: String,
    inputs: Vec<Arc<dyn InputHandler<V>>>,
    table: Option<Arc<dyn Codec<V>>>,
}

impl<V: Clone + Send + Sync + 'static> GroupBuilder<V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            table: None,
        }
    }

    /// Bind `topic` to `handler`; every event on the topic is decoded with
    /// the topic's codec before the handler sees it
    pub fn input<M, F>(mut self, topic: Topic<M>, handler: F) -> Self
    where
        M: 'static,
        F: Fn(&mut Context<'_, V>, M) -> HandlerResult + Send + Sync + 'static,
    {
        self.inputs.push(Arc::new(TypedInput { topic, handler }));
        self
    }

    /// Persist a table of `V` values in `<group>-table`
    pub fn persist(mut self, codec: impl Codec<V>) -> Self {
        self.table = Some(Arc::new(codec));
        self
    }

    pub fn build(self) -> Result<GroupGraph<V>> {
        if self.name.trim().is_empty() {
            return Err(ProcessorError::Configuration(
                "group name must not be empty".to_string(),
            ));
        }
        if self.inputs.is_empty() {
            return Err(ProcessorError::Configuration(format!(
                "group '{}' has no inputs",
                self.name
            )));
        }

        let table = table_topic(&self.name);
        let mut seen = HashSet::new();
        for input in &self.inputs {
            if !seen.insert(input.topic()) {
                return Err(ProcessorError::Configuration(format!(
                    "group '{}' binds topic '{}' more than once",
                    self.name,
                    input.topic()
                )));
            }
            if input.topic() == table {
                return Err(ProcessorError::Configuration(format!(
                    "group '{}' cannot consume its own table '{}'",
                    self.name, table
                )));
            }
        }

        Ok(GroupGraph {
            name: self.name,
            inputs: self.inputs,
            table: self.table,
        })
    }
}

/// A validated group definition
pub struct GroupGraph<V> {
    name: String,
    inputs: Vec<Arc<dyn InputHandler<V>>>,
    table: Option<Arc<dyn Codec<V>>>,
}

impl<V> Clone for GroupGraph<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inputs: self.inputs.clone(),
            table: self.table.clone(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> GroupGraph<V> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input topic names in registration order
    pub fn input_topics(&self) -> Vec<String> {
        self.inputs.iter().map(|i| i.topic().to_string()).collect()
    }

    pub fn has_table(&self) -> bool {
        self.table.is_some()
    }

    /// Changelog topic of the group's table, if it has one
    pub fn table_topic(&self) -> Option<String> {
        self.table.as_ref().map(|_| table_topic(&self.name))
    }

    pub(crate) fn table_codec(&self) -> Option<&Arc<dyn Codec<V>>> {
        self.table.as_ref()
    }

    pub(crate) fn handler(&self, topic: &str) -> Option<&Arc<dyn InputHandler<V>>> {
        self.inputs.iter().find(|i| i.topic() == topic)
    }
}
