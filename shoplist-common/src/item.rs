use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which container a list item lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Pending,
    Completed,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::Completed => "completed",
        }
    }
}

fn default_quantity() -> u32 {
    1
}

/// A list item as stored by the item store.
///
/// `reference_id` is the caller-supplied business identity. Two items with
/// the same (kind, reference id, state) in one container are duplicates and
/// will be merged, keeping the earliest-created one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub list_id: String,
    pub item_id: String,
    pub reference_id: String,
    pub kind: String,
    pub state: ItemState,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// Whether this item is a duplicate of the given request in the given state.
    pub fn duplicates(&self, requested: &RequestedItem, state: ItemState) -> bool {
        self.state == state
            && self.kind == requested.kind
            && self.reference_id == requested.reference_id
    }
}

/// An item as requested by a caller, before deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedItem {
    pub reference_id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RequestedItem {
    /// Requested quantity, defaulting to one when absent.
    pub fn quantity(&self) -> u32 {
        self.quantity.unwrap_or(1)
    }

    /// Re-request an existing item, as the migration saga does when moving
    /// items between containers.
    pub fn from_item(item: &Item) -> RequestedItem {
        RequestedItem {
            reference_id: item.reference_id.clone(),
            kind: item.kind.clone(),
            quantity: Some(item.quantity),
            note: item.note.clone(),
            metadata: item.metadata.clone(),
        }
    }
}

/// Creation request sent to the item store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub reference_id: String,
    pub kind: String,
    pub state: ItemState,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Partial update applied to one item in a batched update call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemUpdate {
    pub item_id: String,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Store-side description of a container.
///
/// The list id doubles as the id of the list's primary (pending) container;
/// the companion completed container is linked from the primary's summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub container_id: String,
    pub list_id: String,
    pub state: ItemState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_container_id: Option<String>,
    #[serde(default)]
    pub item_count: usize,
}

/// A container summary plus, when requested, its full item list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSnapshot {
    pub summary: ContainerSummary,
    #[serde(default)]
    pub items: Vec<Item>,
}
