//! In-memory store
//!
//! Behaves like the hosted store as far as the engine can observe: paged
//! queries with opaque cursors, per-field ids, unknown-field validation and
//! empty values for unset fields. Faults can be injected per operation and
//! per item so that partial-failure paths can be exercised.

use super::types::{
    CollectionId, CollectionSchema, FieldMap, FieldSchema, FieldValue, Filter, Item, Page,
};
use super::{RecordStore, StoreError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::RwLock;

/// Store operation, for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateCollection,
    QueryCollection,
    GetItem,
    CreateItem,
    UpdateItem,
    GetItemFieldValue,
    ListCollectionFields,
}

#[derive(Default)]
struct Faults {
    /// Next N calls of an operation fail with a transient network error
    transient: HashMap<Operation, usize>,
    /// Updates to these items always fail
    failing_updates: HashSet<String>,
    /// Creates into these collections always fail
    failing_creates: HashSet<String>,
    /// Queries against these collections always fail
    failing_queries: HashSet<String>,
    /// Field listings for these collections always fail
    failing_listings: HashSet<String>,
}

struct MemCollection {
    fields: Vec<FieldSchema>,
    item_ids: Vec<String>,
}

#[derive(Default)]
struct State {
    collections: HashMap<CollectionId, MemCollection>,
    items: HashMap<String, Item>,
    next_id: u64,
}

impl State {
    /// Ids are plain alphanumerics, like the compact ids kept in config rows
    fn mint_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:06}", prefix, self.next_id)
    }

    /// Item with every schema field present, unset ones as empty values
    fn materialize(&self, item: &Item) -> Item {
        let mut full = item.clone();
        if let Some(collection) = self.collections.get(&item.collection_id) {
            for field in &collection.fields {
                full.fields
                    .entry(field.name.clone())
                    .or_insert_with(|| field.kind.empty_value());
            }
        }
        full
    }

    fn validate_fields(&self, collection_id: &str, fields: &FieldMap) -> Result<(), StoreError> {
        let collection = self
            .collections
            .get(collection_id)
            .ok_or_else(|| StoreError::NotFound(format!("collection {}", collection_id)))?;

        for name in fields.keys() {
            if !collection.fields.iter().any(|f| &f.name == name) {
                return Err(StoreError::Api {
                    status: 400,
                    message: format!("{} is not a property that exists", name),
                });
            }
        }
        Ok(())
    }
}

/// In-memory [`RecordStore`]
pub struct MemoryStore {
    state: RwLock<State>,
    page_size: usize,
    faults: Mutex<Faults>,
    calls: Mutex<HashMap<Operation, usize>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    /// Small page sizes force multi-page queries
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: RwLock::new(State::default()),
            page_size: page_size.max(1),
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `times` calls of `op` with a transient network error
    pub fn fail_next(&self, op: Operation, times: usize) {
        self.lock_faults().transient.insert(op, times);
    }

    /// Make every update of `item_id` fail
    pub fn fail_updates_of(&self, item_id: &str) {
        self.lock_faults().failing_updates.insert(item_id.to_string());
    }

    /// Make every item creation in `collection_id` fail
    pub fn fail_creates_in(&self, collection_id: &str) {
        self.lock_faults().failing_creates.insert(collection_id.to_string());
    }

    /// Make every query of `collection_id` fail
    pub fn fail_queries_of(&self, collection_id: &str) {
        self.lock_faults().failing_queries.insert(collection_id.to_string());
    }

    /// Make every field listing of `collection_id` fail
    pub fn fail_listings_of(&self, collection_id: &str) {
        self.lock_faults().failing_listings.insert(collection_id.to_string());
    }

    pub fn clear_faults(&self) {
        *self.lock_faults() = Faults::default();
    }

    /// Number of calls made for `op` (including failed ones)
    pub fn calls(&self, op: Operation) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// All items of a collection, materialized, in insertion order
    pub async fn items(&self, collection_id: &str) -> Vec<Item> {
        let state = self.state.read().await;
        state
            .collections
            .get(collection_id)
            .map(|c| {
                c.item_ids
                    .iter()
                    .filter_map(|id| state.items.get(id))
                    .map(|item| state.materialize(item))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, op: Operation) -> Result<(), StoreError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(op)
            .or_insert(0) += 1;

        let mut faults = self.lock_faults();
        if let Some(remaining) = faults.transient.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Network(format!("injected failure in {:?}", op)));
            }
        }
        Ok(())
    }

    fn injected(set: &HashSet<String>, key: &str, what: &str) -> Result<(), StoreError> {
        if set.contains(key) {
            return Err(StoreError::Api {
                status: 409,
                message: format!("injected {} failure for {}", what, key),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_collection(&self, schema: &CollectionSchema) -> Result<CollectionId, StoreError> {
        self.enter(Operation::CreateCollection)?;
        let mut state = self.state.write().await;
        let id = state.mint_id("col");

        let fields = schema
            .fields
            .iter()
            .enumerate()
            .map(|(idx, spec)| FieldSchema {
                id: format!("{}-f{}", id, idx),
                name: spec.name.clone(),
                kind: spec.kind.clone(),
            })
            .collect();

        state.collections.insert(
            id.clone(),
            MemCollection {
                fields,
                item_ids: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn query_collection(
        &self,
        collection_id: &str,
        filter: Option<&Filter>,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        self.enter(Operation::QueryCollection)?;
        Self::injected(&self.lock_faults().failing_queries, collection_id, "query")?;

        let state = self.state.read().await;
        let collection = state
            .collections
            .get(collection_id)
            .ok_or_else(|| StoreError::NotFound(format!("collection {}", collection_id)))?;

        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| StoreError::Api { status: 400, message: format!("bad cursor {}", c) })?,
            None => 0,
        };

        let matching: Vec<Item> = collection
            .item_ids
            .iter()
            .filter_map(|id| state.items.get(id))
            .map(|item| state.materialize(item))
            .filter(|item| filter.map_or(true, |f| f.matches(item)))
            .collect();

        let end = (offset + self.page_size).min(matching.len());
        let items = matching.get(offset..end).map(<[Item]>::to_vec).unwrap_or_default();
        let next_cursor = (end < matching.len()).then(|| end.to_string());

        Ok(Page { items, next_cursor })
    }

    async fn get_item(&self, item_id: &str) -> Result<Item, StoreError> {
        self.enter(Operation::GetItem)?;
        let state = self.state.read().await;
        state
            .items
            .get(item_id)
            .map(|item| state.materialize(item))
            .ok_or_else(|| StoreError::NotFound(format!("item {}", item_id)))
    }

    async fn create_item(&self, collection_id: &str, fields: FieldMap) -> Result<Item, StoreError> {
        self.enter(Operation::CreateItem)?;
        Self::injected(&self.lock_faults().failing_creates, collection_id, "create")?;

        let mut state = self.state.write().await;
        state.validate_fields(collection_id, &fields)?;

        let id = state.mint_id("item");
        let item = Item {
            id: id.clone(),
            collection_id: collection_id.to_string(),
            fields,
        };
        state.items.insert(id.clone(), item.clone());
        if let Some(collection) = state.collections.get_mut(collection_id) {
            collection.item_ids.push(id);
        }
        Ok(state.materialize(&item))
    }

    async fn update_item(&self, item_id: &str, fields: FieldMap) -> Result<(), StoreError> {
        self.enter(Operation::UpdateItem)?;
        Self::injected(&self.lock_faults().failing_updates, item_id, "update")?;

        let mut state = self.state.write().await;
        let collection_id = state
            .items
            .get(item_id)
            .map(|i| i.collection_id.clone())
            .ok_or_else(|| StoreError::NotFound(format!("item {}", item_id)))?;
        state.validate_fields(&collection_id, &fields)?;

        if let Some(item) = state.items.get_mut(item_id) {
            item.fields.extend(fields);
        }
        Ok(())
    }

    async fn get_item_field_value(&self, item_id: &str, field_id: &str) -> Result<FieldValue, StoreError> {
        self.enter(Operation::GetItemFieldValue)?;
        let state = self.state.read().await;
        let item = state
            .items
            .get(item_id)
            .ok_or_else(|| StoreError::NotFound(format!("item {}", item_id)))?;
        let field = state
            .collections
            .get(&item.collection_id)
            .and_then(|c| c.fields.iter().find(|f| f.id == field_id))
            .ok_or_else(|| StoreError::NotFound(format!("field {}", field_id)))?;

        Ok(item
            .fields
            .get(&field.name)
            .cloned()
            .unwrap_or_else(|| field.kind.empty_value()))
    }

    async fn list_collection_fields(&self, collection_id: &str) -> Result<Vec<FieldSchema>, StoreError> {
        self.enter(Operation::ListCollectionFields)?;
        Self::injected(&self.lock_faults().failing_listings, collection_id, "listing")?;

        let state = self.state.read().await;
        state
            .collections
            .get(collection_id)
            .map(|c| c.fields.clone())
            .ok_or_else(|| StoreError::NotFound(format!("collection {}", collection_id)))
    }
}
