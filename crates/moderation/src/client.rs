//! Producer side of the chat pipeline

use chatflow_config::{DeliveryMode, EmitterConfig};
use chatflow_types::{normalize_word, BlockCommand, ChatMessage};
use processor::{Broker, Delivery, Emitter, EmitterOptions, EmitterStats};
use std::sync::Arc;

use crate::error::Result;
use crate::topics::Topics;

/// Publishes chat messages, block commands and banned words.
///
/// In [`DeliveryMode::Sync`] every call returns the acknowledged
/// [`Delivery`]; in [`DeliveryMode::Async`] records are queued and the
/// calls return `None`. Call [`ModerationClient::finish`] before dropping an
/// asynchronous client so queued records are not lost.
pub struct ModerationClient {
    messages: Emitter<ChatMessage>,
    blocks: Emitter<String>,
    bans: Emitter<String>,
    delivery: DeliveryMode,
}

impl ModerationClient {
    /// Must be called within a tokio runtime
    pub fn new(broker: Arc<dyn Broker>, topics: &Topics, settings: &EmitterConfig) -> Self {
        let options = EmitterOptions::default().with_send_timeout(settings.send_timeout());
        Self {
            messages: Emitter::with_options(Arc::clone(&broker), topics.messages.clone(), options.clone()),
            blocks: Emitter::with_options(Arc::clone(&broker), topics.blocked_users.clone(), options.clone()),
            bans: Emitter::with_options(broker, topics.banned_words.clone(), options),
            delivery: settings.delivery,
        }
    }

    pub fn delivery(&self) -> DeliveryMode {
        self.delivery
    }

    /// Send a chat message, keyed by its sender
    pub async fn send(&self, sender_id: i64, receiver_id: i64, text: &str) -> Result<Option<Delivery>> {
        let message = ChatMessage::new(sender_id, receiver_id, text);
        self.publish(&self.messages, message.sender_key(), &message).await
    }

    /// Block `blocked_id` for `receiver_id`
    pub async fn block(&self, receiver_id: i64, blocked_id: i64) -> Result<Option<Delivery>> {
        let command = BlockCommand::new(receiver_id, blocked_id);
        self.publish(&self.blocks, command.key(), &command.value()).await
    }

    /// Ban `word`; the canonical form is used as key and value
    pub async fn ban(&self, word: &str) -> Result<Option<Delivery>> {
        let word = normalize_word(word)?;
        self.publish(&self.bans, word.clone(), &word).await
    }

    /// Deliver everything queued so far and stop the emitters
    pub async fn finish(&self) -> Result<()> {
        self.messages.finish().await?;
        self.blocks.finish().await?;
        self.bans.finish().await?;
        Ok(())
    }

    /// Combined counters of the three emitters
    pub fn stats(&self) -> EmitterStats {
        [self.messages.stats(), self.blocks.stats(), self.bans.stats()]
            .into_iter()
            .fold(EmitterStats::default(), |total, stats| EmitterStats {
                sent: total.sent + stats.sent,
                failed: total.failed + stats.failed,
                queued: total.queued + stats.queued,
            })
    }

    async fn publish<T: 'static>(
        &self,
        emitter: &Emitter<T>,
        key: String,
        value: &T,
    ) -> Result<Option<Delivery>> {
        match self.delivery {
            DeliveryMode::Sync => Ok(Some(emitter.emit_sync(&key, value).await?)),
            DeliveryMode::Async => {
                emitter.emit(key, value).await?;
                Ok(None)
            }
        }
    }
}
