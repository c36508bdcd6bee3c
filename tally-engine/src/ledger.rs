//! Record ledger
//!
//! One ContributionRecord per `(task id, stage)`. The store has no
//! insert-if-absent, so the existence check and the insert are two calls;
//! within a process they run under a per-slot lock. Separate processes can
//! still race and produce a duplicate.

use crate::error::{EngineError, EngineResult, StoreResultExt};
use crate::locks::KeyedLocks;
use crate::models::{ContributionRecord, Stage, StageFacts};
use crate::project_config::ProjectConfig;
use crate::schema::record;
use crate::store::{query_all, DateRange, FieldMap, FieldValue, Filter, ItemId, RecordStore};
use tally_common::time;
use tracing::{debug, info, warn};

/// Result of [`Ledger::ensure_record`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerOutcome {
    Created(ItemId),
    AlreadyExists,
}

/// Stage-weighted points: `raw * ratio / 100`
pub fn weigh(raw_points: f64, ratio: f64) -> f64 {
    raw_points * ratio / 100.0
}

/// Pending records of one stage plus rows that could not be decoded
#[derive(Debug, Default)]
pub struct PendingScan {
    pub records: Vec<ContributionRecord>,
    pub invalid: Vec<EngineError>,
}

pub struct Ledger<'a> {
    store: &'a dyn RecordStore,
    config: &'a ProjectConfig,
    locks: &'a KeyedLocks,
}

impl<'a> Ledger<'a> {
    pub fn new(store: &'a dyn RecordStore, config: &'a ProjectConfig, locks: &'a KeyedLocks) -> Self {
        Self { store, config, locks }
    }

    pub async fn ensure_record(
        &self,
        task_id: &str,
        source_collection_id: &str,
        stage: Stage,
        facts: &StageFacts,
        weighted_points: f64,
    ) -> EngineResult<LedgerOutcome> {
        let collection_id = self.config.record_collection(stage)?;
        let _slot = self.locks.acquire(&format!("{}:{}", stage, task_id)).await;

        let filter = Filter::title_equals(record::TASK_ID, task_id);
        let existing = self
            .store
            .query_collection(collection_id, Some(&filter), None)
            .await
            .during(format!("look up {} record for task {}", stage, task_id))?;

        if let Some(found) = existing.items.first() {
            if existing.items.len() > 1 {
                warn!(task_id, stage = %stage, count = existing.items.len(), "Duplicate ledger records");
            }
            debug!(task_id, stage = %stage, record_id = %found.id, "Record already exists");
            return Ok(LedgerOutcome::AlreadyExists);
        }

        let mut fields = FieldMap::new();
        fields.insert(record::TASK_ID.to_string(), FieldValue::Title(task_id.to_string()));
        fields.insert(
            record::SOURCE_COLLECTION_ID.to_string(),
            FieldValue::Text(source_collection_id.to_string()),
        );
        fields.insert(
            record::CONTRIBUTOR_ID.to_string(),
            FieldValue::Text(facts.contributor.id.clone()),
        );
        fields.insert(
            record::CONTRIBUTOR.to_string(),
            FieldValue::People(vec![facts.contributor.clone()]),
        );
        fields.insert(record::POINTS.to_string(), FieldValue::Number(Some(weighted_points)));
        fields.insert(
            record::WORK_PERIOD.to_string(),
            FieldValue::Date(Some(DateRange::between(facts.start_time, facts.end_time))),
        );
        fields.insert(record::AGGREGATED.to_string(), FieldValue::Checkbox(false));
        fields.insert(
            record::RECORDED_AT.to_string(),
            FieldValue::Date(Some(DateRange::at(time::now()))),
        );

        let created = self
            .store
            .create_item(collection_id, fields)
            .await
            .during(format!("create {} record for task {}", stage, task_id))?;

        info!(
            task_id,
            stage = %stage,
            contributor_id = %facts.contributor.id,
            points = weighted_points,
            record_id = %created.id,
            "Created contribution record"
        );
        Ok(LedgerOutcome::Created(created.id))
    }

    /// Every record of `stage` not yet aggregated
    pub async fn pending_records(&self, stage: Stage) -> EngineResult<PendingScan> {
        let collection_id = self.config.record_collection(stage)?;
        let filter = Filter::checkbox_equals(record::AGGREGATED, false);
        let items = query_all(self.store, collection_id, Some(&filter))
            .await
            .during(format!("scan pending {} records", stage))?;

        let mut scan = PendingScan::default();
        for item in &items {
            match ContributionRecord::from_item(item, stage) {
                // A store with lagging filters can still return applied rows
                Ok(record) if record.aggregated => {}
                Ok(record) => scan.records.push(record),
                Err(e) => {
                    warn!(stage = %stage, error = %e, "Skipping undecodable record");
                    scan.invalid.push(e);
                }
            }
        }
        debug!(stage = %stage, pending = scan.records.len(), "Scanned pending records");
        Ok(scan)
    }

    /// Flip a record to applied; never flipped back
    pub async fn mark_applied(&self, record_id: &str) -> EngineResult<()> {
        let mut fields = FieldMap::new();
        fields.insert(record::AGGREGATED.to_string(), FieldValue::Checkbox(true));
        self.store
            .update_item(record_id, fields)
            .await
            .during(format!("mark record {} applied", record_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weigh() {
        assert_eq!(weigh(100.0, 20.0), 20.0);
        assert_eq!(weigh(100.0, 50.0), 50.0);
        assert_eq!(weigh(7.0, 30.0), 2.1);
        assert_eq!(weigh(42.0, 0.0), 0.0);
    }
}
