use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use tracing::{error, info, warn};

use shoplist_common::kafka_messages::{ListEvent, MigrationDirection, MigrationRequested};

use crate::config::KafkaConfig;
use crate::error::WorkerError;
use crate::publisher::EventPublisher;
use crate::saga::MigrationSaga;

/// Drives the migration saga from redelivered `migration-requested` events.
///
/// The broker's partition-by-list-id assignment keeps same-list events on
/// one consumer in order; this loop does not serialize lists itself.
pub struct MigrationConsumer {
    consumer: StreamConsumer,
    saga: MigrationSaga,
    publisher: Arc<dyn EventPublisher>,
    retry_delay: Duration,
}

impl MigrationConsumer {
    pub fn new(
        config: &KafkaConfig,
        saga: MigrationSaga,
        publisher: Arc<dyn EventPublisher>,
        retry_delay: Duration,
    ) -> Result<MigrationConsumer, WorkerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", &config.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.migrations_topic.as_str()])?;

        Ok(MigrationConsumer {
            consumer,
            saga,
            publisher,
            retry_delay,
        })
    }

    pub async fn run(&self) -> Result<(), WorkerError> {
        info!("consuming migration events");
        loop {
            let message = self.consumer.recv().await?;

            if let Some(payload) = message.payload() {
                match serde_json::from_slice::<ListEvent>(payload) {
                    Ok(ListEvent::MigrationRequested(event)) => self.handle(event).await,
                    Ok(other) => warn!(
                        "ignoring unexpected {} event on the migrations topic",
                        other.event_type()
                    ),
                    Err(err) => {
                        counter!("shoplist_migration_events_skipped_total").increment(1);
                        warn!("skipping unparseable migration event: {}", err);
                    }
                }
            }

            self.consumer.commit_message(&message, CommitMode::Async)?;
        }
    }

    async fn handle(&self, event: MigrationRequested) {
        let progress = match event.direction {
            MigrationDirection::Complete => {
                self.saga
                    .complete_items(&event.list_id, &event.item_ids, event.progress)
                    .await
            }
            MigrationDirection::Uncomplete => {
                self.saga
                    .uncomplete_items(&event.list_id, &event.item_ids, event.progress)
                    .await
            }
        };

        if progress.is_complete() {
            return;
        }

        // Redeliver with the advanced record embedded so the next attempt
        // resumes where this one stopped, after a short pause to avoid
        // hammering a struggling store.
        tokio::time::sleep(self.retry_delay).await;
        let redelivery = MigrationRequested { progress, ..event };
        if let Err(err) = self
            .publisher
            .publish(ListEvent::MigrationRequested(redelivery))
            .await
        {
            counter!("shoplist_publish_errors_total", "event" => "migration-requested")
                .increment(1);
            // The committed offset moves past this event. The record stays
            // safe to resubmit by hand since every saga step is idempotent.
            error!("failed to republish migration event: {}", err);
        }
    }
}
