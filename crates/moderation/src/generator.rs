//! Demo traffic for the chat pipeline
//!
//! Produces a steady stream of random chat messages between distinct users,
//! and from time to time bans a random `badword_<n>` or blocks a random
//! user. Failures are logged; the generator keeps running.

use chatflow_types::ChatMessage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ModerationClient;
use crate::error::{ModerationError, Result};

/// Words chat messages are made of
pub const VOCABULARY: [&str; 6] = ["coffee", "car", "book", "music", "city", "work"];

const MIN_WORDS: usize = 3;
const MAX_WORDS: usize = 7;
const BANNED_WORD_RANGE: u32 = 10_000;

/// Generator settings
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub message_interval: Duration,
    pub ban_interval: Duration,
    pub block_interval: Duration,
    /// Users are numbered `0..users`
    pub users: i64,
    /// Fixed seed for reproducible traffic
    pub seed: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            message_interval: Duration::from_secs(1),
            ban_interval: Duration::from_secs(15),
            block_interval: Duration::from_secs(20),
            users: 100,
            seed: None,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.users < 2 {
            return Err(ModerationError::Generator(
                "at least two users are needed to chat".to_string(),
            ));
        }
        let intervals = [self.message_interval, self.ban_interval, self.block_interval];
        if intervals.iter().any(Duration::is_zero) {
            return Err(ModerationError::Generator(
                "generator intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters of one generator run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    pub messages: u64,
    pub bans: u64,
    pub blocks: u64,
    pub failures: u64,
}

/// Random chat traffic
pub struct TrafficGenerator {
    config: GeneratorConfig,
    rng: StdRng,
}

impl TrafficGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { config, rng })
    }

    /// A message of 3 to 7 vocabulary words between two distinct users
    pub fn next_message(&mut self) -> ChatMessage {
        let (sender, receiver) = self.user_pair();
        let words = self.rng.gen_range(MIN_WORDS..=MAX_WORDS);
        let text = (0..words)
            .map(|_| VOCABULARY[self.rng.gen_range(0..VOCABULARY.len())])
            .collect::<Vec<_>>()
            .join(" ");
        ChatMessage::new(sender, receiver, text)
    }

    pub fn next_ban(&mut self) -> String {
        format!("badword_{}", self.rng.gen_range(0..BANNED_WORD_RANGE))
    }

    /// `(receiver, blocked)` pair of distinct users
    pub fn next_block(&mut self) -> (i64, i64) {
        self.user_pair()
    }

    fn user_pair(&mut self) -> (i64, i64) {
        let first = self.rng.gen_range(0..self.config.users);
        let mut second = self.rng.gen_range(0..self.config.users - 1);
        if second >= first {
            second += 1;
        }
        (first, second)
    }

    /// Publish traffic through `client` until `token` is cancelled
    pub async fn run(mut self, client: &ModerationClient, token: CancellationToken) -> GeneratorStats {
        let mut messages = ticker(self.config.message_interval);
        let mut bans = ticker(self.config.ban_interval);
        let mut blocks = ticker(self.config.block_interval);
        let mut stats = GeneratorStats::default();
        info!(users = self.config.users, "traffic generator started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = messages.tick() => {
                    let message = self.next_message();
                    debug!(sender = message.sender_id, receiver = message.receiver_id, text = %message.text, "sending message");
                    match client.send(message.sender_id, message.receiver_id, &message.text).await {
                        Ok(_) => stats.messages += 1,
                        Err(e) => {
                            stats.failures += 1;
                            warn!(error = %e, "failed to send message");
                        }
                    }
                }
                _ = bans.tick() => {
                    let word = self.next_ban();
                    match client.ban(&word).await {
                        Ok(_) => {
                            stats.bans += 1;
                            info!(word = %word, "banned word");
                        }
                        Err(e) => {
                            stats.failures += 1;
                            warn!(word = %word, error = %e, "failed to ban word");
                        }
                    }
                }
                _ = blocks.tick() => {
                    let (receiver, blocked) = self.next_block();
                    match client.block(receiver, blocked).await {
                        Ok(_) => {
                            stats.blocks += 1;
                            info!(receiver, blocked, "blocked user");
                        }
                        Err(e) => {
                            stats.failures += 1;
                            warn!(receiver, blocked, error = %e, "failed to block user");
                        }
                    }
                }
            }
        }

        info!(
            messages = stats.messages,
            bans = stats.bans,
            blocks = stats.blocks,
            failures = stats.failures,
            "traffic generator stopped"
        );
        stats
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_config::{EmitterConfig, TopicNames};
    use processor::MemoryBroker;
    use std::sync::Arc;

    use crate::topics::Topics;

    fn seeded(seed: u64) -> TrafficGenerator {
        TrafficGenerator::new(GeneratorConfig {
            users: 5,
            seed: Some(seed),
            ..GeneratorConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_messages_use_the_vocabulary() {
        let mut generator = seeded(7);
        for _ in 0..200 {
            let message = generator.next_message();
            assert_ne!(message.sender_id, message.receiver_id);
            assert!((0..5).contains(&message.sender_id));
            assert!((0..5).contains(&message.receiver_id));

            let words: Vec<&str> = message.text.split(' ').collect();
            assert!((MIN_WORDS..=MAX_WORDS).contains(&words.len()));
            assert!(words.iter().all(|w| VOCABULARY.contains(w)));
        }
    }

    #[test]
    fn test_seed_makes_traffic_reproducible() {
        let (mut a, mut b) = (seeded(42), seeded(42));
        for _ in 0..20 {
            assert_eq!(a.next_message(), b.next_message());
            assert_eq!(a.next_ban(), b.next_ban());
            assert_eq!(a.next_block(), b.next_block());
        }
    }

    #[test]
    fn test_banned_words_are_canonical() {
        let mut generator = seeded(1);
        let word = generator.next_ban();
        assert!(word.starts_with("badword_"));
        assert_eq!(chatflow_types::normalize_word(&word).unwrap(), word);
    }

    #[test]
    fn test_rejects_single_user() {
        let config = GeneratorConfig {
            users: 1,
            ..GeneratorConfig::default()
        };
        assert!(TrafficGenerator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_run_publishes_until_cancelled() {
        let broker = MemoryBroker::new(2);
        let topics = Topics::new(&TopicNames::default()).unwrap();
        let client = ModerationClient::new(Arc::new(broker.clone()), &topics, &EmitterConfig::default());
        let generator = TrafficGenerator::new(GeneratorConfig {
            message_interval: Duration::from_millis(5),
            ban_interval: Duration::from_millis(20),
            block_interval: Duration::from_millis(20),
            users: 10,
            seed: Some(3),
        })
        .unwrap();

        let token = CancellationToken::new();
        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });
        let stats = generator.run(&client, token).await;

        assert!(stats.messages > 0);
        assert_eq!(stats.failures, 0);
        assert_eq!(broker.topic_records("messages").len() as u64, stats.messages);
        assert_eq!(broker.topic_records("banned-words").len() as u64, stats.bans);
    }
}
