use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::item::ItemState;

/// Resumable progress of one migration saga invocation.
///
/// Serializes to a flat pair of named booleans so it can be embedded
/// verbatim in a redelivered event payload. Flags only ever move from
/// false to true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    pub created_in_target: bool,
    pub deleted_in_source: bool,
}

/// The four reachable shapes of a progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Nothing has happened yet.
    Incomplete,
    /// Items exist in the target from a prior attempt; only the source
    /// delete remains.
    Partial,
    /// Both halves are done.
    Complete,
    /// Deleted without created. Unreachable in normal operation.
    Invalid,
}

impl MigrationProgress {
    pub fn new() -> MigrationProgress {
        MigrationProgress::default()
    }

    pub fn complete() -> MigrationProgress {
        MigrationProgress {
            created_in_target: true,
            deleted_in_source: true,
        }
    }

    pub fn phase(&self) -> MigrationPhase {
        match (self.created_in_target, self.deleted_in_source) {
            (false, false) => MigrationPhase::Incomplete,
            (true, false) => MigrationPhase::Partial,
            (true, true) => MigrationPhase::Complete,
            (false, true) => MigrationPhase::Invalid,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase() == MigrationPhase::Complete
    }
}

/// Which way a migration moves items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    /// Pending container into the completed container.
    Complete,
    /// Completed container back into the pending container.
    Uncomplete,
}

impl MigrationDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationDirection::Complete => "complete",
            MigrationDirection::Uncomplete => "uncomplete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemCreated {
    pub list_id: String,
    pub container_id: String,
    pub item_id: String,
    pub reference_id: String,
    pub state: ItemState,
    pub timestamp: DateTime<Utc>,
}

/// Covers exactly the ids the store confirmed deleted, never the requested set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsDeleted {
    pub list_id: String,
    pub container_id: String,
    pub item_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRequested {
    pub list_id: String,
    pub item_ids: Vec<String>,
    pub direction: MigrationDirection,
    #[serde(default)]
    pub progress: MigrationProgress,
}

/// Every event this service produces or consumes, tagged for topic routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ListEvent {
    ItemCreated(ItemCreated),
    ItemsDeleted(ItemsDeleted),
    MigrationRequested(MigrationRequested),
}

impl ListEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ListEvent::ItemCreated(_) => "item-created",
            ListEvent::ItemsDeleted(_) => "items-deleted",
            ListEvent::MigrationRequested(_) => "migration-requested",
        }
    }

    /// Kafka partition key. Same-list events must land on one partition so
    /// the broker preserves their order.
    pub fn partition_key(&self) -> &str {
        match self {
            ListEvent::ItemCreated(event) => &event.list_id,
            ListEvent::ItemsDeleted(event) => &event.list_id,
            ListEvent::MigrationRequested(event) => &event.list_id,
        }
    }
}
