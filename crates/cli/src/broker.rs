//! Broker selection from configuration

use chatflow_config::{BrokerMode, ChatflowConfig};
use processor::{Broker, MemoryBroker};
use std::sync::Arc;
use tracing::info;

/// Connect to the broker named by `settings.broker.mode`
pub fn connect(settings: &ChatflowConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match settings.broker.mode {
        BrokerMode::Memory => {
            info!(partitions = settings.broker.default_partitions, "using in-memory broker");
            Ok(Arc::new(MemoryBroker::new(settings.broker.default_partitions)))
        }
        BrokerMode::Kafka => kafka(settings),
    }
}

#[cfg(feature = "kafka")]
fn kafka(settings: &ChatflowConfig) -> anyhow::Result<Arc<dyn Broker>> {
    use processor::{KafkaBroker, KafkaBrokerConfig};

    let config = KafkaBrokerConfig::from_settings(settings);
    info!(brokers = %config.brokers, "connecting to kafka");
    Ok(Arc::new(KafkaBroker::new(config)?))
}

#[cfg(not(feature = "kafka"))]
fn kafka(_settings: &ChatflowConfig) -> anyhow::Result<Arc<dyn Broker>> {
    anyhow::bail!("kafka mode requires chatflow to be built with the `kafka` feature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_mode_uses_configured_partitions() {
        let mut settings = ChatflowConfig::default();
        settings.broker.default_partitions = 3;

        let broker = connect(&settings).unwrap();
        assert_eq!(broker.partition_count("anything").await.unwrap(), 3);
    }
}
