use thiserror::Error;

use shoplist_common::store::StoreError;

/// Errors surfaced to direct callers of the add/delete pipelines.
#[derive(Error, Debug)]
pub enum ItemsError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("item store call failed: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ItemsError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => {
                ItemsError::NotFound("container or item missing in the item store".to_owned())
            }
            other => ItemsError::Store(other),
        }
    }
}

/// Errors from the migration event consumer loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("kafka consumer error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("failed to parse migration event: {0}")]
    Parse(#[from] serde_json::Error),
}
