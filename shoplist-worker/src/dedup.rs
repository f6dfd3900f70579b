use std::collections::{BTreeMap, HashMap, HashSet};

use shoplist_common::item::{Item, ItemState, ItemUpdate, RequestedItem};

use crate::config::CapacityConfig;

/// Existing container items sharing (kind, reference id, state) with one
/// requested item, ordered by creation time ascending. The first member is
/// the canonical survivor of a merge.
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub reference_id: String,
    pub members: Vec<Item>,
}

impl DuplicateGroup {
    pub fn canonical(&self) -> &Item {
        &self.members[0]
    }

    pub fn absorbed(&self) -> &[Item] {
        &self.members[1..]
    }

    /// The update applied to the canonical item: quantities of every member
    /// plus the request summed; distinct non-empty notes joined oldest to
    /// newest, the requested note last.
    pub fn merged_update(&self, requested: &RequestedItem) -> ItemUpdate {
        let quantity: u32 = self.members.iter().map(|member| member.quantity.max(1)).sum::<u32>()
            + requested.quantity();

        let mut notes: Vec<&str> = Vec::new();
        for member in &self.members {
            if let Some(note) = member.note.as_deref() {
                if !note.is_empty() && !notes.contains(&note) {
                    notes.push(note);
                }
            }
        }
        if let Some(note) = requested.note.as_deref() {
            if !note.is_empty() {
                notes.push(note);
            }
        }
        let note = if notes.is_empty() {
            None
        } else {
            Some(notes.join("\n"))
        };

        ItemUpdate {
            item_id: self.canonical().item_id.clone(),
            quantity,
            note,
        }
    }
}

/// Everything the engine decided before any store write happens.
#[derive(Debug, Default)]
pub struct DedupPlan {
    /// Duplicate groups keyed by reference id.
    pub groups: HashMap<String, DuplicateGroup>,
    /// One merged update per canonical item, in reference-id order.
    pub updates: Vec<ItemUpdate>,
    /// Non-canonical group members, to delete after the canonical updates.
    pub absorbed_ids: Vec<String>,
    /// Requested items with no duplicate group; these get created.
    pub remainder: Vec<RequestedItem>,
}

impl DedupPlan {
    /// Total existing items that belong to some duplicate group. They all
    /// collapse into their canonical after the merge.
    pub fn duplicate_member_count(&self) -> usize {
        self.groups.values().map(|group| group.members.len()).sum()
    }
}

/// Group existing items against the requested map and split requests into
/// merges and creations.
pub fn plan(
    existing: &[Item],
    state: ItemState,
    requested: &BTreeMap<String, RequestedItem>,
) -> DedupPlan {
    let mut plan = DedupPlan::default();

    for (reference_id, request) in requested {
        let mut members: Vec<Item> = existing
            .iter()
            .filter(|item| item.duplicates(request, state))
            .cloned()
            .collect();

        if members.is_empty() {
            plan.remainder.push(request.clone());
            continue;
        }

        members.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let group = DuplicateGroup {
            reference_id: reference_id.clone(),
            members,
        };
        plan.updates.push(group.merged_update(request));
        plan.absorbed_ids
            .extend(group.absorbed().iter().map(|item| item.item_id.clone()));
        plan.groups.insert(reference_id.clone(), group);
    }

    plan
}

/// What the capacity policy says about the container after the add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityAction {
    Fits,
    /// Over the ceiling under the reject policy; abort with no side effects.
    Reject { final_count: usize, max: usize },
    /// Over the ceiling under the rolling policy; evict this many items.
    Evict { overflow: usize },
}

/// `final_count` counts each duplicate group as one canonical: every group
/// member collapses away and its request survives as a single item.
pub fn capacity_action(
    existing_count: usize,
    duplicate_member_count: usize,
    requested_count: usize,
    state: ItemState,
    capacity: &CapacityConfig,
) -> CapacityAction {
    let final_count = existing_count - duplicate_member_count + requested_count;
    let max = capacity.max_for(state);

    if final_count <= max {
        CapacityAction::Fits
    } else if capacity.rolls_over(state) {
        CapacityAction::Evict {
            overflow: final_count - max,
        }
    } else {
        CapacityAction::Reject { final_count, max }
    }
}

/// The `overflow` oldest-by-update-time existing items that are not part of
/// any duplicate group. Duplicates are never evicted; the merge handles them.
pub fn eviction_candidates(
    existing: &[Item],
    groups: &HashMap<String, DuplicateGroup>,
    overflow: usize,
) -> Vec<String> {
    let duplicate_ids: HashSet<&str> = groups
        .values()
        .flat_map(|group| group.members.iter().map(|item| item.item_id.as_str()))
        .collect();

    let mut candidates: Vec<&Item> = existing
        .iter()
        .filter(|item| !duplicate_ids.contains(item.item_id.as_str()))
        .collect();
    candidates.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));

    candidates
        .into_iter()
        .take(overflow)
        .map(|item| item.item_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::Map;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap()
    }

    fn item(item_id: &str, reference_id: &str, quantity: u32, note: Option<&str>, minute: u32) -> Item {
        Item {
            list_id: "list-1".to_string(),
            item_id: item_id.to_string(),
            reference_id: reference_id.to_string(),
            kind: "product".to_string(),
            state: ItemState::Pending,
            quantity,
            note: note.map(str::to_string),
            metadata: Map::new(),
            created_at: at(minute),
            updated_at: at(minute),
        }
    }

    fn request(reference_id: &str, quantity: Option<u32>, note: Option<&str>) -> RequestedItem {
        RequestedItem {
            reference_id: reference_id.to_string(),
            kind: "product".to_string(),
            quantity,
            note: note.map(str::to_string),
            metadata: Map::new(),
        }
    }

    fn requested_map(requests: Vec<RequestedItem>) -> BTreeMap<String, RequestedItem> {
        requests
            .into_iter()
            .map(|request| (request.reference_id.clone(), request))
            .collect()
    }

    fn capacity(max_pending: usize, rolling: bool) -> CapacityConfig {
        CapacityConfig {
            max_pending_items: max_pending,
            pending_rolling: rolling,
            max_completed_items: max_pending,
        }
    }

    #[test]
    fn merge_sums_quantities_and_joins_notes_oldest_first() {
        // A(qty 2, "x") created before B(qty 3, "y"); request adds qty 1, "z".
        let existing = vec![
            item("b", "sku-1", 3, Some("y"), 5),
            item("a", "sku-1", 2, Some("x"), 1),
        ];
        let requested = requested_map(vec![request("sku-1", Some(1), Some("z"))]);

        let plan = plan(&existing, ItemState::Pending, &requested);

        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].item_id, "a");
        assert_eq!(plan.updates[0].quantity, 6);
        assert_eq!(plan.updates[0].note.as_deref(), Some("x\ny\nz"));
        assert_eq!(plan.absorbed_ids, vec!["b".to_string()]);
        assert!(plan.remainder.is_empty());
        assert_eq!(plan.duplicate_member_count(), 2);
    }

    #[test]
    fn repeated_and_empty_notes_are_skipped() {
        let existing = vec![
            item("a", "sku-1", 1, Some("x"), 1),
            item("b", "sku-1", 1, Some(""), 2),
            item("c", "sku-1", 1, Some("x"), 3),
        ];
        let requested = requested_map(vec![request("sku-1", None, None)]);

        let plan = plan(&existing, ItemState::Pending, &requested);

        assert_eq!(plan.updates[0].quantity, 4);
        assert_eq!(plan.updates[0].note.as_deref(), Some("x"));
    }

    #[test]
    fn non_matching_requests_become_remainder() {
        let existing = vec![item("a", "sku-1", 1, None, 1)];
        let requested = requested_map(vec![
            request("sku-1", None, None),
            request("sku-2", None, None),
        ]);

        let plan = plan(&existing, ItemState::Pending, &requested);

        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.remainder.len(), 1);
        assert_eq!(plan.remainder[0].reference_id, "sku-2");
    }

    #[test]
    fn items_in_the_other_state_are_not_duplicates() {
        let mut completed = item("a", "sku-1", 1, None, 1);
        completed.state = ItemState::Completed;
        let requested = requested_map(vec![request("sku-1", None, None)]);

        let plan = plan(&[completed], ItemState::Pending, &requested);

        assert!(plan.groups.is_empty());
        assert_eq!(plan.remainder.len(), 1);
    }

    #[test]
    fn capacity_fits_when_merges_free_room() {
        // 10 existing, one group of 3 members, 2 requested: 10 - 3 + 2 = 9.
        let action = capacity_action(10, 3, 2, ItemState::Pending, &capacity(9, false));
        assert_eq!(action, CapacityAction::Fits);
    }

    #[test]
    fn pending_overflow_rejects_without_rolling() {
        let action = capacity_action(100, 0, 1, ItemState::Pending, &capacity(100, false));
        assert_eq!(
            action,
            CapacityAction::Reject {
                final_count: 101,
                max: 100
            }
        );
    }

    #[test]
    fn pending_overflow_evicts_with_rolling() {
        let action = capacity_action(100, 0, 3, ItemState::Pending, &capacity(100, true));
        assert_eq!(action, CapacityAction::Evict { overflow: 3 });
    }

    #[test]
    fn completed_overflow_always_evicts() {
        let action = capacity_action(52, 0, 0, ItemState::Completed, &capacity(50, false));
        assert_eq!(action, CapacityAction::Evict { overflow: 2 });
    }

    #[test]
    fn eviction_picks_oldest_updated_non_duplicates() {
        let existing = vec![
            item("dup", "sku-1", 1, None, 0),
            item("old", "sku-2", 1, None, 1),
            item("mid", "sku-3", 1, None, 2),
            item("new", "sku-4", 1, None, 3),
        ];
        let requested = requested_map(vec![request("sku-1", None, None)]);
        let plan = plan(&existing, ItemState::Pending, &requested);

        let evicted = eviction_candidates(&existing, &plan.groups, 2);

        // "dup" is the oldest but belongs to a duplicate group, so it stays.
        assert_eq!(evicted, vec!["old".to_string(), "mid".to_string()]);
    }
}
