//! Per-event handler context
//!
//! Handlers run synchronously against a [`Context`]. Table changes and
//! emissions are staged here and carried out by the partition worker after
//! the handler returns, in order: table write, emissions, offset commit.
//! Reads see the handler's own staged write.

use chrono::{DateTime, Utc};

use crate::broker::Record;
use crate::codec::Topic;
use crate::error::{HandlerError, HandlerResult, StateError};
use crate::state::PartitionStore;

/// A table change staged by a handler
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StagedChange<V> {
    Set(V),
    Delete,
}

/// An encoded record waiting to be emitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingEmit {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Everything a handler asked for while processing one event
pub(crate) struct Effects<V> {
    pub change: Option<StagedChange<V>>,
    pub emits: Vec<PendingEmit>,
}

/// Access to the current event, the group table and the output topics
pub struct Context<'a, V> {
    group: &'a str,
    record: &'a Record,
    store: Option<&'a PartitionStore<V>>,
    change: Option<StagedChange<V>>,
    emits: Vec<PendingEmit>,
}

impl<'a, V: Clone + Send + 'static> Context<'a, V> {
    pub(crate) fn new(group: &'a str, record: &'a Record, store: Option<&'a PartitionStore<V>>) -> Self {
        Self {
            group,
            record,
            store,
            change: None,
            emits: Vec::new(),
        }
    }

    /// Key of the current event; table reads and writes use this key
    pub fn key(&self) -> &str {
        &self.record.key
    }

    pub fn topic(&self) -> &str {
        &self.record.topic
    }

    pub fn partition(&self) -> u32 {
        self.record.partition
    }

    pub fn offset(&self) -> i64 {
        self.record.offset
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.record.timestamp
    }

    pub fn group(&self) -> &str {
        self.group
    }

    /// Table value of the current key, including a write staged by this handler
    pub fn value(&self) -> Option<&V> {
        match &self.change {
            Some(StagedChange::Set(value)) => Some(value),
            Some(StagedChange::Delete) => None,
            None => self.store.and_then(|store| store.peek(&self.record.key)),
        }
    }

    /// Table value of the current key, or `V::default()` when absent
    pub fn value_or_default(&self) -> V
    where
        V: Default,
    {
        self.value().cloned().unwrap_or_default()
    }

    /// Replace the table value of the current key
    pub fn set_value(&mut self, value: V) -> HandlerResult {
        self.require_table()?;
        self.change = Some(StagedChange::Set(value));
        Ok(())
    }

    /// Delete the table value of the current key
    pub fn delete(&mut self) -> HandlerResult {
        self.require_table()?;
        self.change = Some(StagedChange::Delete);
        Ok(())
    }

    /// Emit `value` to `topic` under `key` once the event's table write succeeded
    pub fn emit<T: 'static>(&mut self, topic: &Topic<T>, key: impl Into<String>, value: &T) -> HandlerResult {
        let payload = topic.encode(value)?;
        self.emits.push(PendingEmit {
            topic: topic.name().to_string(),
            key: key.into(),
            payload,
        });
        Ok(())
    }

    /// Fail the current event with `reason`
    pub fn fail(&self, reason: impl Into<String>) -> HandlerResult {
        Err(HandlerError::failed(reason))
    }

    fn require_table(&self) -> HandlerResult {
        if self.store.is_none() {
            return Err(StateError::NoTable {
                group: self.group.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn into_effects(self) -> Effects<V> {
        Effects {
            change: self.change,
            emits: self.emits,
        }
    }
}
