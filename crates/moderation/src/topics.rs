//! Typed streams of the moderation pipeline

use chatflow_config::TopicNames;
use chatflow_types::ChatMessage;
use processor::{Broker, CodecRegistry, JsonCodec, ProcessorError, StringCodec, Topic};
use tracing::info;

use crate::error::Result;

/// The four chat streams, each bound to its payload codec
#[derive(Clone)]
pub struct Topics {
    names: TopicNames,
    pub messages: Topic<ChatMessage>,
    pub banned_words: Topic<String>,
    pub blocked_users: Topic<String>,
    pub filtered_messages: Topic<ChatMessage>,
}

impl Topics {
    pub fn new(names: &TopicNames) -> Result<Self> {
        let mut registry = CodecRegistry::new();
        Self::register(&mut registry, names)?;
        Self::from_registry(&registry, names)
    }

    /// Register the chat streams in `registry`
    pub fn register(registry: &mut CodecRegistry, names: &TopicNames) -> Result<()> {
        registry
            .register::<ChatMessage>(names.messages.as_str(), JsonCodec::<ChatMessage>::new())
            .map_err(ProcessorError::from)?;
        registry
            .register::<String>(names.banned_words.as_str(), StringCodec)
            .map_err(ProcessorError::from)?;
        registry
            .register::<String>(names.blocked_users.as_str(), StringCodec)
            .map_err(ProcessorError::from)?;
        registry
            .register::<ChatMessage>(names.filtered_messages.as_str(), JsonCodec::<ChatMessage>::new())
            .map_err(ProcessorError::from)?;
        Ok(())
    }

    /// Typed handles of streams registered with [`Topics::register`]
    pub fn from_registry(registry: &CodecRegistry, names: &TopicNames) -> Result<Self> {
        let lookup = |name: &str| -> Result<Topic<String>> {
            Ok(registry.topic::<String>(name).map_err(ProcessorError::from)?)
        };
        Ok(Self {
            names: names.clone(),
            messages: registry
                .topic::<ChatMessage>(&names.messages)
                .map_err(ProcessorError::from)?,
            banned_words: lookup(&names.banned_words)?,
            blocked_users: lookup(&names.blocked_users)?,
            filtered_messages: registry
                .topic::<ChatMessage>(&names.filtered_messages)
                .map_err(ProcessorError::from)?,
        })
    }

    pub fn names(&self) -> &TopicNames {
        &self.names
    }

    /// Create the input and output streams with `partitions` partitions
    pub async fn ensure(&self, broker: &dyn Broker, partitions: u32) -> Result<()> {
        for name in [
            self.messages.name(),
            self.banned_words.name(),
            self.blocked_users.name(),
            self.filtered_messages.name(),
        ] {
            broker
                .create_topic(name, partitions, false)
                .await
                .map_err(ProcessorError::from)?;
        }
        info!(partitions, "chat streams ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use processor::CodecError;

    #[test]
    fn test_topics_use_configured_names() {
        let names = TopicNames {
            messages: "chat-in".to_string(),
            ..TopicNames::default()
        };
        let topics = Topics::new(&names).unwrap();

        assert_eq!(topics.messages.name(), "chat-in");
        assert_eq!(topics.filtered_messages.name(), "filtered-messages");
        assert_eq!(topics.banned_words.codec().content_type(), "text/plain");
    }

    #[test]
    fn test_registry_lookup_is_type_checked() {
        let mut registry = CodecRegistry::new();
        let names = TopicNames::default();
        Topics::register(&mut registry, &names).unwrap();

        let err = registry.topic::<String>(&names.messages).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_ensure_creates_streams() {
        let broker = processor::MemoryBroker::new(1);
        let topics = Topics::new(&TopicNames::default()).unwrap();
        topics.ensure(&broker, 3).await.unwrap();

        assert_eq!(broker.partition_count("messages").await.unwrap(), 3);
        assert_eq!(broker.partition_count("filtered-messages").await.unwrap(), 3);
    }
}
