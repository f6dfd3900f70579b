//! Consume list migration events and keep list containers deduplicated.
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use eyre::Result;

use shoplist_common::metrics::{serve, setup_metrics_router};
use shoplist_common::store::{HttpItemStore, ItemStore};
use shoplist_worker::add::AddPipeline;
use shoplist_worker::config::Config;
use shoplist_worker::consumer::MigrationConsumer;
use shoplist_worker::delete::DeletePipeline;
use shoplist_worker::kafka_producer::create_kafka_producer;
use shoplist_worker::publisher::{EventPublisher, KafkaPublisher};
use shoplist_worker::saga::MigrationSaga;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store: Arc<dyn ItemStore> = Arc::new(
        HttpItemStore::new(
            &config.item_store_url,
            Duration::from_millis(config.item_store_timeout_ms),
        )
        .expect("failed to construct item store client"),
    );

    let producer = create_kafka_producer(&config.kafka)
        .await
        .expect("failed to create kafka producer");
    let publisher: Arc<dyn EventPublisher> = Arc::new(KafkaPublisher::new(
        producer,
        config.kafka.events_topic.clone(),
        config.kafka.migrations_topic.clone(),
    ));

    let add = AddPipeline::new(store.clone(), publisher.clone(), config.capacity);
    let delete = DeletePipeline::new(store.clone(), publisher.clone());
    let saga = MigrationSaga::new(store, add, delete);

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_metrics_router();
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let consumer = MigrationConsumer::new(
        &config.kafka,
        saga,
        publisher,
        Duration::from_millis(config.migration_retry_delay_ms),
    )
    .expect("failed to create migration consumer");

    consumer.run().await?;

    Ok(())
}
