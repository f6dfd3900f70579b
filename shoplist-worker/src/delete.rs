use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tracing::{error, instrument, warn};

use shoplist_common::item::ItemState;
use shoplist_common::kafka_messages::{ItemsDeleted, ListEvent};
use shoplist_common::store::{BatchDeleteOutcome, ItemStore};

use crate::error::ItemsError;
use crate::publisher::{publish_best_effort, EventPublisher};

/// Which items of a container to delete.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteSelection {
    Ids(Vec<String>),
    All,
    ByState(ItemState),
}

#[derive(Clone)]
pub struct DeletePipeline {
    store: Arc<dyn ItemStore>,
    publisher: Arc<dyn EventPublisher>,
}

impl DeletePipeline {
    pub fn new(store: Arc<dyn ItemStore>, publisher: Arc<dyn EventPublisher>) -> DeletePipeline {
        DeletePipeline { store, publisher }
    }

    /// Delete the selected items in one batched store call and report which
    /// ids the store confirmed. The "items deleted" notification covers
    /// exactly the confirmed subset.
    #[instrument(skip_all, fields(list_id = list_id, container_id = container_id))]
    pub async fn delete(
        &self,
        list_id: &str,
        container_id: &str,
        selection: DeleteSelection,
    ) -> Result<BatchDeleteOutcome, ItemsError> {
        let ids = self.resolve_ids(container_id, selection).await?;
        if ids.is_empty() {
            return Ok(BatchDeleteOutcome::default());
        }

        let outcome = self.store.delete_items_batch(container_id, &ids).await?;
        counter!("shoplist_items_deleted_total").increment(outcome.deleted.len() as u64);
        if !outcome.failed.is_empty() {
            warn!(
                "store failed to delete {} of {} items in container {}",
                outcome.failed.len(),
                ids.len(),
                container_id
            );
        }

        if !outcome.deleted.is_empty() {
            let notify = publish_best_effort(
                self.publisher.clone(),
                ListEvent::ItemsDeleted(ItemsDeleted {
                    list_id: list_id.to_owned(),
                    container_id: container_id.to_owned(),
                    item_ids: outcome.deleted.clone(),
                    timestamp: Utc::now(),
                }),
            );
            if let Err(err) = notify.await {
                error!("items-deleted notification task panicked: {}", err);
            }
        }

        Ok(outcome)
    }

    async fn resolve_ids(
        &self,
        container_id: &str,
        selection: DeleteSelection,
    ) -> Result<Vec<String>, ItemsError> {
        match selection {
            DeleteSelection::Ids(ids) => Ok(ids),
            DeleteSelection::All => {
                let snapshot = self.store.get_container_contents(container_id, true).await?;
                Ok(snapshot.items.into_iter().map(|item| item.item_id).collect())
            }
            DeleteSelection::ByState(state) => {
                let snapshot = self.store.get_container_contents(container_id, true).await?;
                Ok(snapshot
                    .items
                    .into_iter()
                    .filter(|item| item.state == state)
                    .map(|item| item.item_id)
                    .collect())
            }
        }
    }
}
