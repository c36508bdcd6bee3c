//! Source collection reader
//!
//! Resolves the configured logical field names against each collection's
//! schema, then pages through every item.

use crate::error::{EngineResult, StoreResultExt};
use crate::models::{LogicalField, WorkItem};
use crate::project_config::FieldMapping;
use crate::store::{query_all, FieldSchema, Item, RecordStore};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Items read from one source collection
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub collection_id: String,
    pub items: Vec<WorkItem>,
    /// Configured field names the collection does not have
    pub missing_fields: Vec<String>,
}

/// Logical field → schema entry for one collection
#[derive(Debug, Clone, Default)]
pub struct ResolvedFields {
    pub fields: BTreeMap<LogicalField, FieldSchema>,
    pub missing: Vec<String>,
}

impl ResolvedFields {
    pub fn resolve(mapping: &FieldMapping, schema: &[FieldSchema]) -> Self {
        let mut resolved = ResolvedFields::default();
        for (logical, name) in mapping.entries() {
            match schema.iter().find(|f| f.name == name) {
                Some(field) => {
                    resolved.fields.insert(logical, field.clone());
                }
                None => {
                    if !resolved.missing.iter().any(|m| m == name) {
                        resolved.missing.push(name.to_string());
                    }
                }
            }
        }
        resolved
    }

    fn to_work_item(&self, item: Item) -> WorkItem {
        let mut fields = BTreeMap::new();
        let mut field_names = BTreeMap::new();
        for (logical, schema) in &self.fields {
            field_names.insert(*logical, schema.name.clone());
            if let Some(value) = item.fields.get(&schema.name) {
                fields.insert(*logical, value.clone());
            }
        }

        WorkItem {
            item_id: item.id,
            source_collection_id: item.collection_id,
            fields,
            task_id_field: self.fields.get(&LogicalField::TaskId).map(|f| f.name.clone()),
            field_names,
        }
    }
}

pub struct SourceReader<'a> {
    store: &'a dyn RecordStore,
    mapping: &'a FieldMapping,
}

impl<'a> SourceReader<'a> {
    pub fn new(store: &'a dyn RecordStore, mapping: &'a FieldMapping) -> Self {
        Self { store, mapping }
    }

    pub async fn read_collection(&self, collection_id: &str) -> EngineResult<SourceBatch> {
        let schema = self
            .store
            .list_collection_fields(collection_id)
            .await
            .during(format!("list fields of {}", collection_id))?;
        let resolved = ResolvedFields::resolve(self.mapping, &schema);

        if !resolved.missing.is_empty() {
            warn!(
                collection_id,
                missing = ?resolved.missing,
                "Source collection lacks configured fields"
            );
        }

        let items = query_all(self.store, collection_id, None)
            .await
            .during(format!("read source collection {}", collection_id))?;

        let items: Vec<WorkItem> = items
            .into_iter()
            .map(|mut item| {
                // Some stores omit the parent on listing results
                if item.collection_id.is_empty() {
                    item.collection_id = collection_id.to_string();
                }
                resolved.to_work_item(item)
            })
            .collect();

        info!(collection_id, items = items.len(), "Read source collection");

        Ok(SourceBatch {
            collection_id: collection_id.to_string(),
            items,
            missing_fields: resolved.missing,
        })
    }
}
