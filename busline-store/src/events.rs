use async_trait::async_trait;
use busline_core::collaborators::Notifier;
use busline_core::{CoreError, CoreResult};
use busline_shared::BookingNotification;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{error, info};

#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
}

impl EventProducer {
    pub fn new(brokers: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self { producer })
    }

    pub async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                info!(topic, key, partition = delivery.partition, offset = delivery.offset, "Event published");
                Ok(())
            }
            Err((e, _msg)) => {
                error!(topic, key, error = %e, "Failed to publish event");
                Err(e)
            }
        }
    }
}

/// Hands booking notifications to the notification service via Kafka.
/// Keyed by booking id so one booking's events stay ordered.
pub struct KafkaNotifier {
    producer: EventProducer,
    topic: String,
}

impl KafkaNotifier {
    pub fn new(producer: EventProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl Notifier for KafkaNotifier {
    async fn notify(&self, notification: &BookingNotification) -> CoreResult<()> {
        let payload = notification
            .to_payload()
            .map_err(|err| CoreError::Storage(format!("notification encoding: {}", err)))?;
        self.producer
            .publish(&self.topic, &notification.booking_id.to_string(), &payload)
            .await
            .map_err(|err| CoreError::Collaborator {
                service: "kafka".to_string(),
                message: err.to_string(),
                retryable: true,
            })
    }
}
