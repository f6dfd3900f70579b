use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, histogram};
use tracing::{error, instrument, warn};

use shoplist_common::item::{Item, ItemState, NewItem, RequestedItem};
use shoplist_common::kafka_messages::{ItemCreated, ListEvent};
use shoplist_common::store::ItemStore;

use crate::config::CapacityConfig;
use crate::dedup::{self, CapacityAction};
use crate::delete::{DeletePipeline, DeleteSelection};
use crate::error::ItemsError;
use crate::publisher::{publish_best_effort, EventPublisher};

#[derive(Clone)]
pub struct AddPipeline {
    store: Arc<dyn ItemStore>,
    publisher: Arc<dyn EventPublisher>,
    capacity: CapacityConfig,
}

impl AddPipeline {
    pub fn new(
        store: Arc<dyn ItemStore>,
        publisher: Arc<dyn EventPublisher>,
        capacity: CapacityConfig,
    ) -> AddPipeline {
        AddPipeline {
            store,
            publisher,
            capacity,
        }
    }

    /// Add requested items to a container: merge duplicates into their
    /// canonical items, enforce the capacity ceiling, create the rest.
    /// Returns the merged canonicals plus the newly created items.
    #[instrument(skip_all, fields(container_id = container_id, requested = requested.len()))]
    pub async fn add_items(
        &self,
        container_id: &str,
        state: ItemState,
        requested: Vec<RequestedItem>,
    ) -> Result<Vec<Item>, ItemsError> {
        let by_reference = validate_requested(requested)?;

        let snapshot = self.store.get_container_contents(container_id, true).await?;
        let existing = snapshot.items;
        let list_id = snapshot.summary.list_id;

        let plan = dedup::plan(&existing, state, &by_reference);

        match dedup::capacity_action(
            existing.len(),
            plan.duplicate_member_count(),
            by_reference.len(),
            state,
            &self.capacity,
        ) {
            CapacityAction::Fits => {}
            CapacityAction::Reject { final_count, max } => {
                return Err(ItemsError::Validation(format!(
                    "container {} would hold {} items, the limit is {}",
                    container_id, final_count, max
                )));
            }
            CapacityAction::Evict { overflow } => {
                let ids = dedup::eviction_candidates(&existing, &plan.groups, overflow);
                self.evict(&list_id, container_id, ids).await;
            }
        }

        let mut result = Vec::new();

        if !plan.updates.is_empty() {
            // Merge failures abort the add; nothing was created yet.
            let updated = self
                .store
                .update_items_batch(container_id, plan.updates.clone())
                .await?;
            let outcome = self
                .store
                .delete_items_batch(container_id, &plan.absorbed_ids)
                .await?;
            counter!("shoplist_items_merged_total").increment(plan.absorbed_ids.len() as u64);
            if !outcome.failed.is_empty() {
                warn!(
                    "failed to delete {} absorbed duplicates in container {}",
                    outcome.failed.len(),
                    container_id
                );
            }
            result.extend(updated);
        }

        let created = self
            .create_remainder(container_id, state, &existing, plan.remainder)
            .await?;
        histogram!("shoplist_add_batch_size").record(created.len() as f64);
        for item in &created {
            self.notify_created(container_id, item).await;
        }
        result.extend(created);

        Ok(result)
    }

    async fn create_remainder(
        &self,
        container_id: &str,
        state: ItemState,
        existing: &[Item],
        remainder: Vec<RequestedItem>,
    ) -> Result<Vec<Item>, ItemsError> {
        if remainder.is_empty() {
            return Ok(Vec::new());
        }

        if remainder.len() == 1 {
            let request = remainder.into_iter().next().expect("remainder has one item");
            let item = self
                .store
                .create_item(container_id, new_item(request, state))
                .await?;
            counter!("shoplist_items_created_total").increment(1);
            return Ok(vec![item]);
        }

        // The batch-create response is the entire container; recover the new
        // items by subtracting the ids we already knew about.
        let known: HashSet<&str> = existing.iter().map(|item| item.item_id.as_str()).collect();
        let requests = remainder
            .into_iter()
            .map(|request| new_item(request, state))
            .collect();
        let all = self.store.create_items_batch(container_id, requests).await?;
        let created: Vec<Item> = all
            .into_iter()
            .filter(|item| !known.contains(item.item_id.as_str()))
            .collect();
        counter!("shoplist_items_created_total").increment(created.len() as u64);

        Ok(created)
    }

    /// Best-effort hygiene: eviction failure is logged, never propagated.
    async fn evict(&self, list_id: &str, container_id: &str, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }

        let delete = DeletePipeline::new(self.store.clone(), self.publisher.clone());
        let list_id = list_id.to_owned();
        let container_id = container_id.to_owned();
        let task = tokio::spawn(async move {
            match delete
                .delete(&list_id, &container_id, DeleteSelection::Ids(ids))
                .await
            {
                Ok(outcome) => {
                    counter!("shoplist_items_evicted_total")
                        .increment(outcome.deleted.len() as u64);
                }
                Err(err) => {
                    warn!("eviction in container {} failed: {}", container_id, err);
                }
            }
        });
        if let Err(err) = task.await {
            error!("eviction task panicked: {}", err);
        }
    }

    async fn notify_created(&self, container_id: &str, item: &Item) {
        let notify = publish_best_effort(
            self.publisher.clone(),
            ListEvent::ItemCreated(ItemCreated {
                list_id: item.list_id.clone(),
                container_id: container_id.to_owned(),
                item_id: item.item_id.clone(),
                reference_id: item.reference_id.clone(),
                state: item.state,
                timestamp: Utc::now(),
            }),
        );
        if let Err(err) = notify.await {
            error!("item-created notification task panicked: {}", err);
        }
    }
}

fn validate_requested(
    requested: Vec<RequestedItem>,
) -> Result<BTreeMap<String, RequestedItem>, ItemsError> {
    if requested.is_empty() {
        return Err(ItemsError::Validation("no items requested".to_owned()));
    }

    let mut by_reference = BTreeMap::new();
    for request in requested {
        if request.reference_id.is_empty() {
            return Err(ItemsError::Validation(
                "requested item is missing a reference id".to_owned(),
            ));
        }
        if request.quantity == Some(0) {
            return Err(ItemsError::Validation(format!(
                "requested quantity for {} must be at least 1",
                request.reference_id
            )));
        }
        // Later requests for the same reference id win.
        by_reference.insert(request.reference_id.clone(), request);
    }

    Ok(by_reference)
}

fn new_item(request: RequestedItem, state: ItemState) -> NewItem {
    NewItem {
        quantity: request.quantity(),
        reference_id: request.reference_id,
        kind: request.kind,
        state,
        note: request.note,
        metadata: request.metadata,
    }
}
