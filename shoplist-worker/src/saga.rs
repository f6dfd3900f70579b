use std::collections::HashSet;
use std::sync::Arc;

use metrics::counter;
use tracing::{info, instrument, warn};

use shoplist_common::item::{Item, ItemState, RequestedItem};
use shoplist_common::kafka_messages::{MigrationDirection, MigrationPhase, MigrationProgress};
use shoplist_common::store::ItemStore;

use crate::add::AddPipeline;
use crate::delete::{DeletePipeline, DeleteSelection};
use crate::error::ItemsError;

/// Moves a batch of items between a list's pending and completed containers
/// with resumable two-flag progress.
///
/// The saga never returns an error: every failure is recovered locally by
/// returning the progress record as far as it got, and the event bus's
/// redelivery carries that record back in for the next attempt. This is
/// what makes at-least-once delivery safe here.
#[derive(Clone)]
pub struct MigrationSaga {
    store: Arc<dyn ItemStore>,
    add: AddPipeline,
    delete: DeletePipeline,
}

struct MigrationRoute {
    source_container: String,
    target_container: String,
    target_state: ItemState,
}

impl MigrationSaga {
    pub fn new(
        store: Arc<dyn ItemStore>,
        add: AddPipeline,
        delete: DeletePipeline,
    ) -> MigrationSaga {
        MigrationSaga { store, add, delete }
    }

    /// Move pending items into the list's completed container.
    #[instrument(skip_all, fields(list_id = list_id, items = item_ids.len()))]
    pub async fn complete_items(
        &self,
        list_id: &str,
        item_ids: &[String],
        progress: MigrationProgress,
    ) -> MigrationProgress {
        self.run(MigrationDirection::Complete, list_id, item_ids, progress)
            .await
    }

    /// Move completed items back into the list's pending container.
    #[instrument(skip_all, fields(list_id = list_id, items = item_ids.len()))]
    pub async fn uncomplete_items(
        &self,
        list_id: &str,
        item_ids: &[String],
        progress: MigrationProgress,
    ) -> MigrationProgress {
        self.run(MigrationDirection::Uncomplete, list_id, item_ids, progress)
            .await
    }

    pub async fn run(
        &self,
        direction: MigrationDirection,
        list_id: &str,
        item_ids: &[String],
        progress: MigrationProgress,
    ) -> MigrationProgress {
        match progress.phase() {
            MigrationPhase::Complete => progress,
            MigrationPhase::Invalid => {
                // Deleted without created should be impossible. Fail open so
                // the event is not redelivered forever.
                warn!(
                    "migration progress for list {} claims deleted without created, forcing complete",
                    list_id
                );
                record_outcome(direction, "invalid");
                MigrationProgress::complete()
            }
            MigrationPhase::Incomplete => {
                self.run_from_start(direction, list_id, item_ids, progress)
                    .await
            }
            MigrationPhase::Partial => {
                self.run_delete_only(direction, list_id, item_ids, progress)
                    .await
            }
        }
    }

    async fn run_from_start(
        &self,
        direction: MigrationDirection,
        list_id: &str,
        item_ids: &[String],
        mut progress: MigrationProgress,
    ) -> MigrationProgress {
        let route = match self.resolve_route(direction, list_id).await {
            Ok(route) => route,
            Err(err) => {
                report_route_failure(direction, list_id, &err);
                return progress;
            }
        };

        let found = match self.source_items(&route, item_ids).await {
            Ok(found) => found,
            Err(err) => {
                warn!("could not read migration source for list {}: {}", list_id, err);
                record_outcome(direction, "error");
                return progress;
            }
        };
        if found.is_empty() {
            // Already processed, or the ids never existed. Nothing to move.
            info!("no requested items left in the source for list {}", list_id);
            record_outcome(direction, "noop");
            return progress;
        }

        let requested: Vec<RequestedItem> = found.iter().map(RequestedItem::from_item).collect();
        if let Err(err) = self
            .add
            .add_items(&route.target_container, route.target_state, requested)
            .await
        {
            warn!("create step failed migrating list {}: {}", list_id, err);
            record_outcome(direction, "create_failed");
            return progress;
        }
        progress.created_in_target = true;

        let found_ids: Vec<String> = found.iter().map(|item| item.item_id.clone()).collect();
        if self.delete_from_source(&route, list_id, found_ids).await {
            progress.deleted_in_source = true;
            record_outcome(direction, "complete");
        } else {
            record_outcome(direction, "partial");
        }

        progress
    }

    /// The target items already exist from a prior attempt; only the source
    /// delete remains.
    async fn run_delete_only(
        &self,
        direction: MigrationDirection,
        list_id: &str,
        item_ids: &[String],
        mut progress: MigrationProgress,
    ) -> MigrationProgress {
        let route = match self.resolve_route(direction, list_id).await {
            Ok(route) => route,
            Err(err) => {
                report_route_failure(direction, list_id, &err);
                return progress;
            }
        };

        let found = match self.source_items(&route, item_ids).await {
            Ok(found) => found,
            Err(err) => {
                warn!("could not read migration source for list {}: {}", list_id, err);
                record_outcome(direction, "error");
                return progress;
            }
        };
        if found.is_empty() {
            // The source already drained; the delete converged on an earlier
            // attempt even though we never saw its ack.
            progress.deleted_in_source = true;
            record_outcome(direction, "converged");
            return progress;
        }

        let found_ids: Vec<String> = found.iter().map(|item| item.item_id.clone()).collect();
        if self.delete_from_source(&route, list_id, found_ids).await {
            progress.deleted_in_source = true;
            record_outcome(direction, "complete");
        } else {
            record_outcome(direction, "partial");
        }

        progress
    }

    /// Resolve source and target container ids for a direction.
    ///
    /// Completion needs the companion completed container looked up from the
    /// primary's summary before anything else can happen. Uncompletion
    /// writes into the primary container directly and only reads the
    /// companion as its source.
    async fn resolve_route(
        &self,
        direction: MigrationDirection,
        list_id: &str,
    ) -> Result<MigrationRoute, ItemsError> {
        let companion = self.companion_container(list_id).await?;

        Ok(match direction {
            MigrationDirection::Complete => MigrationRoute {
                source_container: list_id.to_owned(),
                target_container: companion,
                target_state: ItemState::Completed,
            },
            MigrationDirection::Uncomplete => MigrationRoute {
                source_container: companion,
                target_container: list_id.to_owned(),
                target_state: ItemState::Pending,
            },
        })
    }

    async fn companion_container(&self, list_id: &str) -> Result<String, ItemsError> {
        let snapshot = self.store.get_container_contents(list_id, false).await?;
        snapshot
            .summary
            .completed_container_id
            .ok_or_else(|| ItemsError::NotFound(format!("list {} has no completed container", list_id)))
    }

    /// The requested items still present in the source container. A missing
    /// container reads as empty: the list is gone, so there is nothing left
    /// to migrate.
    async fn source_items(
        &self,
        route: &MigrationRoute,
        item_ids: &[String],
    ) -> Result<Vec<Item>, ItemsError> {
        let snapshot = match self
            .store
            .get_container_contents(&route.source_container, true)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(shoplist_common::store::StoreError::NotFound) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let wanted: HashSet<&str> = item_ids.iter().map(String::as_str).collect();
        Ok(snapshot
            .items
            .into_iter()
            .filter(|item| wanted.contains(item.item_id.as_str()))
            .collect())
    }

    /// True only when the store confirmed every requested id; anything less
    /// leaves `deleted_in_source` unset for the next redelivery.
    async fn delete_from_source(
        &self,
        route: &MigrationRoute,
        list_id: &str,
        ids: Vec<String>,
    ) -> bool {
        match self
            .delete
            .delete(list_id, &route.source_container, DeleteSelection::Ids(ids))
            .await
        {
            Ok(outcome) => outcome.failed.is_empty(),
            Err(err) => {
                warn!(
                    "delete step failed migrating list {}: {}",
                    list_id, err
                );
                false
            }
        }
    }
}

fn record_outcome(direction: MigrationDirection, outcome: &'static str) {
    counter!(
        "shoplist_migrations_total",
        "direction" => direction.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

fn report_route_failure(direction: MigrationDirection, list_id: &str, err: &ItemsError) {
    match err {
        // For uncompletion a missing companion means the source of the move
        // is gone, which is the already-processed case, not a failure.
        ItemsError::NotFound(_) if direction == MigrationDirection::Uncomplete => {
            info!("no completed container left for list {}, nothing to move", list_id);
            record_outcome(direction, "noop");
        }
        _ => {
            warn!(
                "could not resolve migration containers for list {}: {}",
                list_id, err
            );
            record_outcome(direction, "error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::Map;
    use shoplist_common::item::ContainerSummary;
    use shoplist_common::kafka_messages::ListEvent;
    use shoplist_common::store::MemoryItemStore;

    use crate::config::CapacityConfig;
    use crate::publisher::MemoryPublisher;

    fn capacity() -> CapacityConfig {
        CapacityConfig {
            max_pending_items: 100,
            pending_rolling: false,
            max_completed_items: 100,
        }
    }

    fn saga(store: &MemoryItemStore, publisher: &MemoryPublisher) -> MigrationSaga {
        let store: Arc<dyn ItemStore> = Arc::new(store.clone());
        let publisher: Arc<dyn crate::publisher::EventPublisher> = Arc::new(publisher.clone());
        MigrationSaga::new(
            store.clone(),
            AddPipeline::new(store.clone(), publisher.clone(), capacity()),
            DeletePipeline::new(store, publisher),
        )
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap()
    }

    fn stored_item(item_id: &str, reference_id: &str, state: ItemState, minute: u32) -> Item {
        Item {
            list_id: "list-1".to_string(),
            item_id: item_id.to_string(),
            reference_id: reference_id.to_string(),
            kind: "product".to_string(),
            state,
            quantity: 1,
            note: None,
            metadata: Map::new(),
            created_at: at(minute),
            updated_at: at(minute),
        }
    }

    /// A list whose primary container links to a companion completed container.
    fn linked_list(store: &MemoryItemStore) {
        store.put_container(ContainerSummary {
            container_id: "list-1".to_string(),
            list_id: "list-1".to_string(),
            state: ItemState::Pending,
            completed_container_id: Some("done-1".to_string()),
            item_count: 0,
        });
        store.put_container(ContainerSummary {
            container_id: "done-1".to_string(),
            list_id: "list-1".to_string(),
            state: ItemState::Completed,
            completed_container_id: None,
            item_count: 0,
        });
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_string()).collect()
    }

    #[tokio::test]
    async fn complete_record_is_a_no_op_with_zero_store_calls() {
        let store = MemoryItemStore::new();
        let publisher = MemoryPublisher::new();
        linked_list(&store);

        let progress = saga(&store, &publisher)
            .complete_items("list-1", &ids(&["a"]), MigrationProgress::complete())
            .await;

        assert_eq!(progress, MigrationProgress::complete());
        assert_eq!(store.total_calls(), 0);
        assert!(publisher.events().is_empty());
    }

    #[tokio::test]
    async fn invalid_record_fails_open_without_store_calls() {
        let store = MemoryItemStore::new();
        let publisher = MemoryPublisher::new();
        linked_list(&store);

        let progress = saga(&store, &publisher)
            .complete_items(
                "list-1",
                &ids(&["a"]),
                MigrationProgress {
                    created_in_target: false,
                    deleted_in_source: true,
                },
            )
            .await;

        assert_eq!(progress, MigrationProgress::complete());
        assert_eq!(store.total_calls(), 0);
    }

    #[tokio::test]
    async fn completes_items_end_to_end() {
        let store = MemoryItemStore::new();
        let publisher = MemoryPublisher::new();
        linked_list(&store);
        store.put_items(
            "list-1",
            vec![
                stored_item("a", "sku-1", ItemState::Pending, 1),
                stored_item("b", "sku-2", ItemState::Pending, 2),
            ],
        );

        let progress = saga(&store, &publisher)
            .complete_items("list-1", &ids(&["a", "b"]), MigrationProgress::new())
            .await;

        assert_eq!(progress, MigrationProgress::complete());
        assert!(store.items_in("list-1").is_empty());
        let moved = store.items_in("done-1");
        assert_eq!(moved.len(), 2);
        assert!(moved.iter().all(|item| item.state == ItemState::Completed));
    }

    #[tokio::test]
    async fn delete_failure_leaves_a_partial_record_and_replay_skips_the_create() {
        let store = MemoryItemStore::new();
        let publisher = MemoryPublisher::new();
        linked_list(&store);
        store.put_items(
            "list-1",
            vec![stored_item("a", "sku-1", ItemState::Pending, 1)],
        );
        store.fail_deletes(true);

        let migration = saga(&store, &publisher);
        let progress = migration
            .complete_items("list-1", &ids(&["a"]), MigrationProgress::new())
            .await;

        assert_eq!(
            progress,
            MigrationProgress {
                created_in_target: true,
                deleted_in_source: false,
            }
        );
        assert_eq!(store.items_in("done-1").len(), 1);
        assert_eq!(store.items_in("list-1").len(), 1);

        // Redelivery with the partial record: only the delete runs.
        store.fail_deletes(false);
        let creates_before =
            store.calls_to("create_item") + store.calls_to("create_items_batch");
        let replayed = migration
            .complete_items("list-1", &ids(&["a"]), progress)
            .await;

        assert_eq!(replayed, MigrationProgress::complete());
        assert_eq!(
            store.calls_to("create_item") + store.calls_to("create_items_batch"),
            creates_before
        );
        assert!(store.items_in("list-1").is_empty());
        assert_eq!(store.items_in("done-1").len(), 1);
    }

    #[tokio::test]
    async fn empty_source_returns_progress_unchanged() {
        let store = MemoryItemStore::new();
        let publisher = MemoryPublisher::new();
        linked_list(&store);

        let progress = saga(&store, &publisher)
            .complete_items("list-1", &ids(&["ghost"]), MigrationProgress::new())
            .await;

        assert_eq!(progress, MigrationProgress::new());
        assert_eq!(store.calls_to("create_item"), 0);
        assert_eq!(store.calls_to("create_items_batch"), 0);
        assert_eq!(store.calls_to("delete_items_batch"), 0);
    }

    #[tokio::test]
    async fn partial_replay_with_drained_source_converges() {
        let store = MemoryItemStore::new();
        let publisher = MemoryPublisher::new();
        linked_list(&store);

        let progress = saga(&store, &publisher)
            .complete_items(
                "list-1",
                &ids(&["a"]),
                MigrationProgress {
                    created_in_target: true,
                    deleted_in_source: false,
                },
            )
            .await;

        assert_eq!(progress, MigrationProgress::complete());
        assert_eq!(store.calls_to("delete_items_batch"), 0);
    }

    #[tokio::test]
    async fn create_failure_returns_progress_unchanged() {
        let store = MemoryItemStore::new();
        let publisher = MemoryPublisher::new();
        linked_list(&store);
        store.put_items(
            "list-1",
            vec![stored_item("a", "sku-1", ItemState::Pending, 1)],
        );
        store.fail_creates(true);

        let progress = saga(&store, &publisher)
            .complete_items("list-1", &ids(&["a"]), MigrationProgress::new())
            .await;

        assert_eq!(progress, MigrationProgress::new());
        assert_eq!(store.items_in("list-1").len(), 1);
        assert!(store.items_in("done-1").is_empty());
    }

    #[tokio::test]
    async fn completion_requires_the_companion_container() {
        let store = MemoryItemStore::new();
        let publisher = MemoryPublisher::new();
        // Primary container without a companion link.
        store.put_container(ContainerSummary {
            container_id: "list-1".to_string(),
            list_id: "list-1".to_string(),
            state: ItemState::Pending,
            completed_container_id: None,
            item_count: 0,
        });
        store.put_items(
            "list-1",
            vec![stored_item("a", "sku-1", ItemState::Pending, 1)],
        );

        let progress = saga(&store, &publisher)
            .complete_items("list-1", &ids(&["a"]), MigrationProgress::new())
            .await;

        assert_eq!(progress, MigrationProgress::new());
        assert_eq!(store.items_in("list-1").len(), 1);
    }

    #[tokio::test]
    async fn uncompletes_items_back_into_the_primary_container() {
        let store = MemoryItemStore::new();
        let publisher = MemoryPublisher::new();
        linked_list(&store);
        store.put_items(
            "done-1",
            vec![stored_item("a", "sku-1", ItemState::Completed, 1)],
        );

        let progress = saga(&store, &publisher)
            .uncomplete_items("list-1", &ids(&["a"]), MigrationProgress::new())
            .await;

        assert_eq!(progress, MigrationProgress::complete());
        assert!(store.items_in("done-1").is_empty());
        let restored = store.items_in("list-1");
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].state, ItemState::Pending);
        assert_eq!(restored[0].reference_id, "sku-1");
    }

    #[tokio::test]
    async fn migrated_duplicates_merge_into_the_target() {
        let store = MemoryItemStore::new();
        let publisher = MemoryPublisher::new();
        linked_list(&store);
        store.put_items(
            "list-1",
            vec![stored_item("a", "sku-1", ItemState::Pending, 5)],
        );
        let mut already_done = stored_item("z", "sku-1", ItemState::Completed, 1);
        already_done.quantity = 2;
        store.put_items("done-1", vec![already_done]);

        let progress = saga(&store, &publisher)
            .complete_items("list-1", &ids(&["a"]), MigrationProgress::new())
            .await;

        assert_eq!(progress, MigrationProgress::complete());
        let done = store.items_in("done-1");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].item_id, "z");
        assert_eq!(done[0].quantity, 3);
    }

    #[tokio::test]
    async fn migration_emits_created_and_deleted_events() {
        let store = MemoryItemStore::new();
        let publisher = MemoryPublisher::new();
        linked_list(&store);
        store.put_items(
            "list-1",
            vec![stored_item("a", "sku-1", ItemState::Pending, 1)],
        );

        saga(&store, &publisher)
            .complete_items("list-1", &ids(&["a"]), MigrationProgress::new())
            .await;

        let events = publisher.events();
        let types: Vec<&str> = events.iter().map(ListEvent::event_type).collect();
        assert_eq!(types, vec!["item-created", "items-deleted"]);
    }
}
