use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use thiserror::Error;
use tracing::error;

use shoplist_common::kafka_messages::ListEvent;

use crate::kafka_producer::KafkaContext;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize event payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to produce event: {0}")]
    Kafka(#[from] KafkaError),
    #[error("event delivery was canceled before an ack")]
    Canceled,
}

/// Event bus seam. Publish failures are logged by callers and never fail
/// the operation that produced the event.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: ListEvent) -> Result<(), PublishError>;
}

pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
    events_topic: String,
    migrations_topic: String,
}

impl KafkaPublisher {
    pub fn new(
        producer: FutureProducer<KafkaContext>,
        events_topic: String,
        migrations_topic: String,
    ) -> KafkaPublisher {
        KafkaPublisher {
            producer,
            events_topic,
            migrations_topic,
        }
    }

    fn topic_for(&self, event: &ListEvent) -> &str {
        match event {
            ListEvent::MigrationRequested(_) => &self.migrations_topic,
            _ => &self.events_topic,
        }
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, event: ListEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_string(&event)?;
        let key = event.partition_key().to_owned();

        let ack = self
            .producer
            .send_result(FutureRecord {
                topic: self.topic_for(&event),
                payload: Some(&payload),
                partition: None,
                key: Some(key.as_str()),
                timestamp: None,
                headers: None,
            })
            .map_err(|(error, _)| PublishError::Kafka(error))?;

        match ack.await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                Err(PublishError::Canceled)
            }
            Ok(Err((error, _))) => Err(PublishError::Kafka(error)),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

/// Captures events in memory for tests.
#[derive(Clone, Default)]
pub struct MemoryPublisher {
    published: Arc<Mutex<Vec<ListEvent>>>,
    failing: Arc<Mutex<bool>>,
}

impl MemoryPublisher {
    pub fn new() -> MemoryPublisher {
        MemoryPublisher::default()
    }

    pub fn events(&self) -> Vec<ListEvent> {
        self.published.lock().expect("publisher mutex poisoned").clone()
    }

    pub fn fail_publishes(&self, fail: bool) {
        *self.failing.lock().expect("publisher mutex poisoned") = fail;
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, event: ListEvent) -> Result<(), PublishError> {
        if *self.failing.lock().expect("publisher mutex poisoned") {
            return Err(PublishError::Canceled);
        }
        self.published
            .lock()
            .expect("publisher mutex poisoned")
            .push(event);
        Ok(())
    }
}

/// Publish on a detached task, observing the error channel for logging only.
/// The returned handle lets callers wait for completion without inheriting
/// the outcome.
pub fn publish_best_effort(
    publisher: Arc<dyn EventPublisher>,
    event: ListEvent,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let event_type = event.event_type();
        if let Err(err) = publisher.publish(event).await {
            metrics::counter!("shoplist_publish_errors_total", "event" => event_type).increment(1);
            error!("failed to publish {} event: {}", event_type, err);
        }
    })
}
