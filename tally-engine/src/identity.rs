//! Task identity resolution
//!
//! Every source item needs a stable task id before any record can be keyed
//! on it. Items without a valid id get a freshly minted UUIDv4 written back
//! onto the item.
//!
//! **Write-back policies:**
//! - `Required`: the write is retried with backoff; if it still fails the
//!   item is skipped this pass, so an unpersisted id never reaches the ledger.
//! - `BestEffort`: one attempt; on failure the minted id is used anyway. A
//!   later pass will mint a different id for the same item and the ledger
//!   will hold a second, disjoint set of records for it.

use crate::error::{EngineError, EngineResult};
use crate::models::{LogicalField, Stage, WorkItem};
use crate::retry::retry_transient;
use crate::store::{FieldMap, FieldValue, RecordStore};
use tally_common::config::WriteBackPolicy;
use tally_common::uuid_utils;
use tracing::{debug, info, warn};

/// Outcome of identity resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskIdentity {
    /// The item already carried a valid id
    Existing(String),
    /// A new id was minted; `persisted` is false only under `BestEffort`
    Minted { task_id: String, persisted: bool },
}

impl TaskIdentity {
    pub fn task_id(&self) -> &str {
        match self {
            TaskIdentity::Existing(id) => id,
            TaskIdentity::Minted { task_id, .. } => task_id,
        }
    }
}

pub struct IdentityResolver<'a> {
    store: &'a dyn RecordStore,
    policy: WriteBackPolicy,
    max_wait_ms: u64,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(store: &'a dyn RecordStore, policy: WriteBackPolicy, max_wait_ms: u64) -> Self {
        Self {
            store,
            policy,
            max_wait_ms,
        }
    }

    pub async fn resolve(&self, item: &WorkItem) -> EngineResult<TaskIdentity> {
        let Some(field_name) = item.task_id_field.as_deref() else {
            // Nowhere to persist a minted id; every pass would mint a new one
            return Err(EngineError::missing_field(
                &item.item_id,
                Stage::Source,
                &item.field_name(LogicalField::TaskId),
                "is not present in the source collection",
            ));
        };

        let current = item.get(LogicalField::TaskId);
        if let Some(value) = current {
            let text = value
                .as_text()
                .map_err(|e| EngineError::wrong_type(&item.item_id, Stage::Source, field_name, &e))?;
            if let Some(existing) = text {
                if uuid_utils::is_valid(existing) {
                    return Ok(TaskIdentity::Existing(existing.to_string()));
                }
                warn!(
                    item_id = %item.item_id,
                    value = existing,
                    "Task id is not a valid identifier, minting a new one"
                );
            }
        }

        let task_id = uuid_utils::generate().to_string();
        let encoded = match current {
            Some(FieldValue::Title(_)) => FieldValue::Title(task_id.clone()),
            _ => FieldValue::Text(task_id.clone()),
        };
        let mut patch = FieldMap::new();
        patch.insert(field_name.to_string(), encoded);

        let result = match self.policy {
            WriteBackPolicy::Required => {
                retry_transient("task id write-back", self.max_wait_ms, || {
                    self.store.update_item(&item.item_id, patch.clone())
                })
                .await
            }
            WriteBackPolicy::BestEffort => self.store.update_item(&item.item_id, patch).await,
        };

        match (result, self.policy) {
            (Ok(()), _) => {
                info!(item_id = %item.item_id, task_id = %task_id, "Minted task id");
                Ok(TaskIdentity::Minted {
                    task_id,
                    persisted: true,
                })
            }
            (Err(e), WriteBackPolicy::BestEffort) => {
                warn!(
                    item_id = %item.item_id,
                    task_id = %task_id,
                    error = %e,
                    "Task id write-back failed; using unpersisted id for this pass"
                );
                Ok(TaskIdentity::Minted {
                    task_id,
                    persisted: false,
                })
            }
            (Err(e), WriteBackPolicy::Required) => {
                debug!(item_id = %item.item_id, "Task id write-back failed, skipping item");
                Err(EngineError::ExternalCall {
                    operation: format!("write back task id for item {}", item.item_id),
                    source: e,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryStore, Operation};
    use crate::store::{CollectionSchema, FieldKind, FieldSpec};
    use std::collections::BTreeMap;

    async fn store_with_item(task_id: Option<&str>) -> (MemoryStore, WorkItem) {
        let store = MemoryStore::new();
        let col = store
            .create_collection(&CollectionSchema {
                title: "Tasks".into(),
                description: String::new(),
                parent_id: "p".into(),
                fields: vec![
                    FieldSpec::new("Name", FieldKind::Title),
                    FieldSpec::new("TaskId", FieldKind::Text),
                ],
            })
            .await
            .unwrap();

        let mut fields = FieldMap::new();
        if let Some(id) = task_id {
            fields.insert("TaskId".into(), FieldValue::Text(id.into()));
        }
        let item = store.create_item(&col, fields).await.unwrap();

        let mut logical = BTreeMap::new();
        logical.insert(LogicalField::TaskId, item.field("TaskId").unwrap().clone());
        let work = WorkItem {
            item_id: item.id.clone(),
            source_collection_id: col,
            fields: logical,
            task_id_field: Some("TaskId".into()),
            field_names: BTreeMap::new(),
        };
        (store, work)
    }

    #[tokio::test]
    async fn test_existing_id_is_kept() {
        let id = "4f1c2b8e-8a5f-4c71-9d55-0d7a1f0b9a11";
        let (store, item) = store_with_item(Some(id)).await;
        let resolver = IdentityResolver::new(&store, WriteBackPolicy::Required, 100);

        let identity = resolver.resolve(&item).await.unwrap();
        assert_eq!(identity, TaskIdentity::Existing(id.to_string()));
        assert_eq!(store.calls(Operation::UpdateItem), 0);
    }

    #[tokio::test]
    async fn test_missing_id_is_minted_and_persisted() {
        let (store, item) = store_with_item(None).await;
        let resolver = IdentityResolver::new(&store, WriteBackPolicy::Required, 100);

        let identity = resolver.resolve(&item).await.unwrap();
        let TaskIdentity::Minted { task_id, persisted } = identity else {
            panic!("expected minted id");
        };
        assert!(persisted);
        assert!(uuid_utils::is_valid(&task_id));

        let stored = store.get_item(&item.item_id).await.unwrap();
        assert_eq!(stored.field("TaskId"), Some(&FieldValue::Text(task_id)));
    }

    #[tokio::test]
    async fn test_invalid_id_is_replaced() {
        let (store, item) = store_with_item(Some("task-17")).await;
        let resolver = IdentityResolver::new(&store, WriteBackPolicy::Required, 100);

        let identity = resolver.resolve(&item).await.unwrap();
        assert!(matches!(identity, TaskIdentity::Minted { persisted: true, .. }));
        assert_ne!(identity.task_id(), "task-17");
    }

    #[tokio::test]
    async fn test_required_write_back_retries_transient_failures() {
        let (store, item) = store_with_item(None).await;
        store.fail_next(Operation::UpdateItem, 2);
        let resolver = IdentityResolver::new(&store, WriteBackPolicy::Required, 2_000);

        let identity = resolver.resolve(&item).await.unwrap();
        assert!(matches!(identity, TaskIdentity::Minted { persisted: true, .. }));
        assert_eq!(store.calls(Operation::UpdateItem), 3);
    }

    #[tokio::test]
    async fn test_required_write_back_failure_skips_item() {
        let (store, item) = store_with_item(None).await;
        store.fail_updates_of(&item.item_id);
        let resolver = IdentityResolver::new(&store, WriteBackPolicy::Required, 100);

        let err = resolver.resolve(&item).await.unwrap_err();
        assert!(matches!(err, EngineError::ExternalCall { .. }));
    }

    #[tokio::test]
    async fn test_best_effort_uses_unpersisted_id() {
        let (store, item) = store_with_item(None).await;
        store.fail_updates_of(&item.item_id);
        let resolver = IdentityResolver::new(&store, WriteBackPolicy::BestEffort, 100);

        let identity = resolver.resolve(&item).await.unwrap();
        assert!(matches!(identity, TaskIdentity::Minted { persisted: false, .. }));
        assert!(uuid_utils::is_valid(identity.task_id()));
    }
}
