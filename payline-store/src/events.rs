use async_trait::async_trait;
use payline_core::events::EventPublisher;
use payline_core::BoxError;
use payline_shared::DomainEvent;
use tracing::info;

/// Publisher that only writes events to the log. Used when no broker is configured.
#[derive(Debug, Default, Clone)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<(), BoxError> {
        info!(event = event.name(), key = %event.key(), payload = %event.payload(), "Domain event");
        Ok(())
    }
}

#[cfg(feature = "kafka")]
pub use kafka::EventProducer;

#[cfg(feature = "kafka")]
mod kafka {
    use super::*;
    use rdkafka::config::ClientConfig;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use rdkafka::util::Timeout;
    use std::time::Duration;
    use tracing::error;

    /// Kafka publisher; one topic per event name, keyed by the aggregate id
    #[derive(Clone)]
    pub struct EventProducer {
        producer: FutureProducer,
        topic_prefix: String,
    }

    impl EventProducer {
        pub fn new(brokers: &str, topic_prefix: &str) -> Result<Self, rdkafka::error::KafkaError> {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .set("message.timeout.ms", "5000")
                .create()?;

            Ok(Self {
                producer,
                topic_prefix: topic_prefix.to_string(),
            })
        }

        fn topic(&self, event: &DomainEvent) -> String {
            format!("{}.{}", self.topic_prefix, event.name())
        }
    }

    #[async_trait]
    impl EventPublisher for EventProducer {
        async fn publish(&self, event: &DomainEvent) -> Result<(), BoxError> {
            let topic = self.topic(event);
            let key = event.key().to_string();
            let payload = event.payload().to_string();
            let record = FutureRecord::to(&topic).key(&key).payload(&payload);

            match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
                Ok(delivery) => {
                    info!("Sent message to {}/{}: partition {} offset {}", topic, key, delivery.partition, delivery.offset);
                    Ok(())
                }
                Err((e, _msg)) => {
                    error!("Failed to send message to {}: {}", topic, e);
                    Err(Box::new(e))
                }
            }
        }
    }
}
