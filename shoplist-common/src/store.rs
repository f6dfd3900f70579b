use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::{ContainerSnapshot, ContainerSummary, Item, ItemUpdate, NewItem};
use crate::utils::uuid_v7;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("container or item not found")]
    NotFound,
    #[error("item store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to decode item store response: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("item store returned status {0}")]
    Status(u16),
}

/// Ids the store confirmed deleted and ids it could not delete. The sets
/// are disjoint and their union is a subset of the requested ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDeleteOutcome {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Remote container of list items. Every call is fallible and may return
/// empty; callers own the retry story.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Fetch a container's summary, with its items when `with_items` is set.
    async fn get_container_contents(
        &self,
        container_id: &str,
        with_items: bool,
    ) -> Result<ContainerSnapshot, StoreError>;

    async fn create_item(&self, container_id: &str, item: NewItem) -> Result<Item, StoreError>;

    /// Create several items. The store's response is the entire current
    /// container contents, not just the new items.
    async fn create_items_batch(
        &self,
        container_id: &str,
        items: Vec<NewItem>,
    ) -> Result<Vec<Item>, StoreError>;

    async fn update_items_batch(
        &self,
        container_id: &str,
        updates: Vec<ItemUpdate>,
    ) -> Result<Vec<Item>, StoreError>;

    async fn delete_items_batch(
        &self,
        container_id: &str,
        ids: &[String],
    ) -> Result<BatchDeleteOutcome, StoreError>;
}

pub struct HttpItemStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpItemStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<HttpItemStore, StoreError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("shoplist-worker")
            .timeout(timeout)
            .build()?;

        Ok(HttpItemStore {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, StoreError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound);
        }
        if !status.is_success() {
            return Err(StoreError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl ItemStore for HttpItemStore {
    async fn get_container_contents(
        &self,
        container_id: &str,
        with_items: bool,
    ) -> Result<ContainerSnapshot, StoreError> {
        let response = self
            .client
            .get(self.url(&format!("/containers/{}", container_id)))
            .query(&[("withItems", with_items)])
            .send()
            .await?;

        Self::decode(response).await
    }

    async fn create_item(&self, container_id: &str, item: NewItem) -> Result<Item, StoreError> {
        let response = self
            .client
            .post(self.url(&format!("/containers/{}/items", container_id)))
            .json(&item)
            .send()
            .await?;

        Self::decode(response).await
    }

    async fn create_items_batch(
        &self,
        container_id: &str,
        items: Vec<NewItem>,
    ) -> Result<Vec<Item>, StoreError> {
        let response = self
            .client
            .post(self.url(&format!("/containers/{}/items/batch", container_id)))
            .json(&items)
            .send()
            .await?;

        Self::decode(response).await
    }

    async fn update_items_batch(
        &self,
        container_id: &str,
        updates: Vec<ItemUpdate>,
    ) -> Result<Vec<Item>, StoreError> {
        let response = self
            .client
            .put(self.url(&format!("/containers/{}/items/batch", container_id)))
            .json(&updates)
            .send()
            .await?;

        Self::decode(response).await
    }

    async fn delete_items_batch(
        &self,
        container_id: &str,
        ids: &[String],
    ) -> Result<BatchDeleteOutcome, StoreError> {
        let response = self
            .client
            .post(self.url(&format!("/containers/{}/items/batch-delete", container_id)))
            .json(&ids)
            .send()
            .await?;

        Self::decode(response).await
    }
}

#[derive(Default)]
struct MemoryState {
    containers: HashMap<String, ContainerSummary>,
    items: HashMap<String, Vec<Item>>,
    calls: HashMap<&'static str, u64>,
    fail_creates: bool,
    fail_updates: bool,
    fail_deletes: bool,
    reject_delete_ids: HashSet<String>,
}

/// In-memory stand-in for the remote item store, with failure injection and
/// per-method call counting for tests.
#[derive(Clone, Default)]
pub struct MemoryItemStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryItemStore {
    pub fn new() -> MemoryItemStore {
        MemoryItemStore::default()
    }

    pub fn put_container(&self, summary: ContainerSummary) {
        let mut state = self.lock();
        state.items.entry(summary.container_id.clone()).or_default();
        state.containers.insert(summary.container_id.clone(), summary);
    }

    pub fn put_items(&self, container_id: &str, items: Vec<Item>) {
        let mut state = self.lock();
        state.items.insert(container_id.to_owned(), items);
    }

    pub fn items_in(&self, container_id: &str) -> Vec<Item> {
        self.lock().items.get(container_id).cloned().unwrap_or_default()
    }

    /// Make create calls fail with a remote 500.
    pub fn fail_creates(&self, fail: bool) {
        self.lock().fail_creates = fail;
    }

    /// Make batched update calls fail with a remote 500.
    pub fn fail_updates(&self, fail: bool) {
        self.lock().fail_updates = fail;
    }

    /// Make batched delete calls fail with a remote 500.
    pub fn fail_deletes(&self, fail: bool) {
        self.lock().fail_deletes = fail;
    }

    /// Keep the given ids undeletable: the store reports them in the failed
    /// set instead of erroring.
    pub fn reject_delete_ids(&self, ids: &[&str]) {
        let mut state = self.lock();
        state.reject_delete_ids = ids.iter().map(|id| (*id).to_owned()).collect();
    }

    pub fn calls_to(&self, method: &str) -> u64 {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.lock().calls.values().sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store mutex poisoned")
    }

    fn record(state: &mut MemoryState, method: &'static str) {
        *state.calls.entry(method).or_insert(0) += 1;
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn get_container_contents(
        &self,
        container_id: &str,
        with_items: bool,
    ) -> Result<ContainerSnapshot, StoreError> {
        let mut state = self.lock();
        Self::record(&mut state, "get_container_contents");

        let mut summary = state
            .containers
            .get(container_id)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        let items = state.items.get(container_id).cloned().unwrap_or_default();
        summary.item_count = items.len();

        Ok(ContainerSnapshot {
            summary,
            items: if with_items { items } else { Vec::new() },
        })
    }

    async fn create_item(&self, container_id: &str, item: NewItem) -> Result<Item, StoreError> {
        let mut state = self.lock();
        Self::record(&mut state, "create_item");

        if state.fail_creates {
            return Err(StoreError::Status(500));
        }
        let list_id = state
            .containers
            .get(container_id)
            .map(|summary| summary.list_id.clone())
            .ok_or(StoreError::NotFound)?;

        let now = Utc::now();
        let created = Item {
            list_id,
            item_id: uuid_v7().to_string(),
            reference_id: item.reference_id,
            kind: item.kind,
            state: item.state,
            quantity: item.quantity,
            note: item.note,
            metadata: item.metadata,
            created_at: now,
            updated_at: now,
        };
        state
            .items
            .entry(container_id.to_owned())
            .or_default()
            .push(created.clone());

        Ok(created)
    }

    async fn create_items_batch(
        &self,
        container_id: &str,
        items: Vec<NewItem>,
    ) -> Result<Vec<Item>, StoreError> {
        let mut state = self.lock();
        Self::record(&mut state, "create_items_batch");

        if state.fail_creates {
            return Err(StoreError::Status(500));
        }
        let list_id = state
            .containers
            .get(container_id)
            .map(|summary| summary.list_id.clone())
            .ok_or(StoreError::NotFound)?;

        let now = Utc::now();
        let created: Vec<Item> = items
            .into_iter()
            .map(|item| Item {
                list_id: list_id.clone(),
                item_id: uuid_v7().to_string(),
                reference_id: item.reference_id,
                kind: item.kind,
                state: item.state,
                quantity: item.quantity,
                note: item.note,
                metadata: item.metadata,
                created_at: now,
                updated_at: now,
            })
            .collect();

        let container_items = state.items.entry(container_id.to_owned()).or_default();
        container_items.extend(created);

        // The store's batch-create response is the whole container.
        Ok(container_items.clone())
    }

    async fn update_items_batch(
        &self,
        container_id: &str,
        updates: Vec<ItemUpdate>,
    ) -> Result<Vec<Item>, StoreError> {
        let mut state = self.lock();
        Self::record(&mut state, "update_items_batch");

        if state.fail_updates {
            return Err(StoreError::Status(500));
        }
        if !state.containers.contains_key(container_id) {
            return Err(StoreError::NotFound);
        }

        let now = Utc::now();
        let container_items = state.items.entry(container_id.to_owned()).or_default();
        let mut updated = Vec::with_capacity(updates.len());
        for update in updates {
            let item = container_items
                .iter_mut()
                .find(|item| item.item_id == update.item_id)
                .ok_or(StoreError::NotFound)?;
            item.quantity = update.quantity;
            item.note = update.note;
            item.updated_at = now;
            updated.push(item.clone());
        }

        Ok(updated)
    }

    async fn delete_items_batch(
        &self,
        container_id: &str,
        ids: &[String],
    ) -> Result<BatchDeleteOutcome, StoreError> {
        let mut state = self.lock();
        Self::record(&mut state, "delete_items_batch");

        if state.fail_deletes {
            return Err(StoreError::Status(500));
        }
        if !state.containers.contains_key(container_id) {
            return Err(StoreError::NotFound);
        }

        let rejected = state.reject_delete_ids.clone();
        let container_items = state.items.entry(container_id.to_owned()).or_default();
        let mut outcome = BatchDeleteOutcome::default();
        for id in ids {
            let position = container_items.iter().position(|item| &item.item_id == id);
            match position {
                Some(index) if !rejected.contains(id) => {
                    container_items.remove(index);
                    outcome.deleted.push(id.clone());
                }
                _ => outcome.failed.push(id.clone()),
            }
        }

        Ok(outcome)
    }
}
