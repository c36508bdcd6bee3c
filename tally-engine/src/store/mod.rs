//! External tabular store
//!
//! The store is a paged, schema-flexible collection service reached over
//! calls that can fail, be slow, or be rate limited. The engine only sees it
//! through [`RecordStore`]; [`http::NotionStore`] talks to the hosted API and
//! [`memory::MemoryStore`] backs tests and dry runs.

use async_trait::async_trait;
use thiserror::Error;

pub mod http;
pub mod memory;
pub mod types;
mod wire;

pub use types::{
    ActorKind, CollectionId, CollectionSchema, DateRange, FieldKind, FieldMap, FieldSchema,
    FieldSpec, FieldTypeError, FieldValue, Filter, Item, ItemId, Page, PersonRef,
};

/// Store client errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    FieldType(#[from] FieldTypeError),
}

impl StoreError {
    /// Failures worth retrying: network trouble, throttling and 5xx
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Network(_) | StoreError::RateLimited => true,
            StoreError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The store refused the request without applying it
    pub fn is_rejected(&self) -> bool {
        matches!(self, StoreError::RateLimited)
    }
}

/// Operations the engine needs from the external store
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a collection and return its id
    async fn create_collection(&self, schema: &CollectionSchema) -> Result<CollectionId, StoreError>;

    /// Fetch one page of items; `next_cursor` is `None` on the last page
    async fn query_collection(
        &self,
        collection_id: &str,
        filter: Option<&Filter>,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError>;

    async fn get_item(&self, item_id: &str) -> Result<Item, StoreError>;

    async fn create_item(&self, collection_id: &str, fields: FieldMap) -> Result<Item, StoreError>;

    /// Overwrite the given fields; fields not named are left untouched
    async fn update_item(&self, item_id: &str, fields: FieldMap) -> Result<(), StoreError>;

    /// Read the current value of one field, bypassing any cached listing
    async fn get_item_field_value(&self, item_id: &str, field_id: &str) -> Result<FieldValue, StoreError>;

    async fn list_collection_fields(&self, collection_id: &str) -> Result<Vec<FieldSchema>, StoreError>;
}

/// Page through a collection until the cursor runs out
pub async fn query_all(
    store: &dyn RecordStore,
    collection_id: &str,
    filter: Option<&Filter>,
) -> Result<Vec<Item>, StoreError> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = store
            .query_collection(collection_id, filter, cursor.as_deref())
            .await?;
        items.extend(page.items);

        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    tracing::debug!(collection_id, count = items.len(), "Queried collection");
    Ok(items)
}
