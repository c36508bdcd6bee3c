//! Incremental aggregation
//!
//! **Per pass:**
//! 1. Scan every stage's ledger collection for records with `Aggregated` unset
//! 2. Fold them per contributor (stage counts, weighted points, record ids)
//! 3. Apply each contributor's delta to its total row: insert when absent,
//!    otherwise re-read the stored values and write back the sums
//! 4. Only then flip that contributor's records to applied
//!
//! A record whose flip fails stays pending and is reported; the next pass
//! applies its points again.

use crate::error::{EngineError, EngineResult, StoreResultExt};
use crate::ledger::Ledger;
use crate::locks::KeyedLocks;
use crate::models::{ContributionRecord, ContributorTotal, Stage, StageCounts};
use crate::project_config::ProjectConfig;
use crate::schema::totals;
use crate::store::{FieldValue, Filter, ItemId, PersonRef, RecordStore};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, warn};

/// Accumulated change for one contributor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContributorDelta {
    pub contributor: Option<PersonRef>,
    pub counts: StageCounts,
    pub points: f64,
    pub record_ids: Vec<ItemId>,
}

/// In-memory fold of pending records, keyed by contributor id
#[derive(Debug, Default)]
pub struct Accumulator {
    deltas: BTreeMap<String, ContributorDelta>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: &ContributionRecord) {
        let delta = self.deltas.entry(record.contributor_id.clone()).or_default();
        delta.counts.increment(record.stage);
        delta.points += record.points;
        delta.record_ids.push(record.record_id.clone());
        if delta.contributor.is_none() {
            delta.contributor = record.contributor.clone();
        }
    }

    pub fn get(&self, contributor_id: &str) -> Option<&ContributorDelta> {
        self.deltas.get(contributor_id)
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn into_deltas(self) -> BTreeMap<String, ContributorDelta> {
        self.deltas
    }
}

/// What happened to one contributor's total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalOutcome {
    Created,
    Updated,
    /// Stored last-update time was not before the pass start
    SkippedByGuard,
}

#[derive(Debug)]
struct ContributorResult {
    contributor_id: String,
    outcome: EngineResult<TotalOutcome>,
    marked: usize,
    unmarked: Vec<ItemId>,
}

/// Outcome of one aggregation pass
#[derive(Debug, Default)]
pub struct AggregationReport {
    pub pending_records: usize,
    pub contributors: usize,
    pub totals_created: usize,
    pub totals_updated: usize,
    pub totals_skipped_by_guard: usize,
    pub records_marked: usize,
    /// Applied to a total but still pending; will be re-applied next pass
    pub unmarked_record_ids: Vec<ItemId>,
    /// Contributors whose existing total was incremented this pass
    pub updated_contributor_ids: Vec<String>,
    pub errors: Vec<EngineError>,
}

pub struct Aggregator<'a> {
    store: &'a dyn RecordStore,
    config: &'a ProjectConfig,
    locks: &'a KeyedLocks,
}

impl<'a> Aggregator<'a> {
    pub fn new(store: &'a dyn RecordStore, config: &'a ProjectConfig, locks: &'a KeyedLocks) -> Self {
        Self { store, config, locks }
    }

    /// Run one aggregation pass; `now` is the pass start time
    pub async fn run(&self, now: DateTime<Utc>) -> AggregationReport {
        let mut report = AggregationReport::default();
        let ledger = Ledger::new(self.store, self.config, self.locks);

        let scans = futures::future::join_all(Stage::ALL.iter().map(|s| ledger.pending_records(*s))).await;

        let mut accumulator = Accumulator::new();
        for (stage, scan) in Stage::ALL.iter().zip(scans) {
            match scan {
                Ok(scan) => {
                    report.pending_records += scan.records.len();
                    scan.records.iter().for_each(|r| accumulator.add(r));
                    report.errors.extend(scan.invalid);
                }
                Err(e) => {
                    warn!(stage = %stage, error = %e, "Could not scan pending records");
                    report.errors.push(e);
                }
            }
        }

        report.contributors = accumulator.len();
        if accumulator.is_empty() {
            debug!("No pending records to aggregate");
            return report;
        }

        let field_ids = match self.totals_field_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Cannot read totals schema; all records stay pending");
                report.errors.push(e);
                return report;
            }
        };

        let results: Vec<ContributorResult> = stream::iter(accumulator.into_deltas())
            .map(|(contributor_id, delta)| {
                let ledger = &ledger;
                let field_ids = &field_ids;
                async move {
                    let outcome = self.apply_delta(&contributor_id, &delta, field_ids, now).await;
                    let (marked, unmarked) = match outcome {
                        Ok(TotalOutcome::Created) | Ok(TotalOutcome::Updated) => {
                            mark_records(ledger, &contributor_id, &delta.record_ids).await
                        }
                        _ => (0, Vec::new()),
                    };
                    ContributorResult {
                        contributor_id,
                        outcome,
                        marked,
                        unmarked,
                    }
                }
            })
            .buffer_unordered(self.config.settings.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            report.records_marked += result.marked;
            report.unmarked_record_ids.extend(result.unmarked);
            match result.outcome {
                Ok(TotalOutcome::Created) => report.totals_created += 1,
                Ok(TotalOutcome::Updated) => {
                    report.totals_updated += 1;
                    report.updated_contributor_ids.push(result.contributor_id);
                }
                Ok(TotalOutcome::SkippedByGuard) => report.totals_skipped_by_guard += 1,
                Err(e) => {
                    error!(
                        contributor_id = %result.contributor_id,
                        error = %e,
                        "Could not apply contributor delta; records stay pending"
                    );
                    report.errors.push(e);
                }
            }
        }
        report.updated_contributor_ids.sort();
        report.unmarked_record_ids.sort();

        info!(
            pending = report.pending_records,
            contributors = report.contributors,
            created = report.totals_created,
            updated = report.totals_updated,
            skipped_by_guard = report.totals_skipped_by_guard,
            marked = report.records_marked,
            unmarked = report.unmarked_record_ids.len(),
            "Aggregation pass finished"
        );
        report
    }

    async fn totals_field_ids(&self) -> EngineResult<HashMap<String, String>> {
        let fields = self
            .store
            .list_collection_fields(&self.config.totals_collection_id)
            .await
            .during("list totals fields")?;
        Ok(fields.into_iter().map(|f| (f.name, f.id)).collect())
    }

    async fn apply_delta(
        &self,
        contributor_id: &str,
        delta: &ContributorDelta,
        field_ids: &HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> EngineResult<TotalOutcome> {
        let _guard = self.locks.acquire(&format!("total:{}", contributor_id)).await;

        let filter = Filter::title_equals(totals::CONTRIBUTOR_ID, contributor_id);
        let existing = self
            .store
            .query_collection(&self.config.totals_collection_id, Some(&filter), None)
            .await
            .during(format!("look up total for {}", contributor_id))?;

        let Some(row) = existing.items.first() else {
            let total = ContributorTotal {
                contributor_id: contributor_id.to_string(),
                contributor: delta.contributor.clone(),
                counts: delta.counts,
                points: delta.points,
                last_update_time: Some(now),
            };
            self.store
                .create_item(&self.config.totals_collection_id, total.to_fields())
                .await
                .during(format!("create total for {}", contributor_id))?;
            info!(contributor_id, points = delta.points, "Created contributor total");
            return Ok(TotalOutcome::Created);
        };
        if existing.items.len() > 1 {
            warn!(contributor_id, count = existing.items.len(), "Duplicate total rows; updating the first");
        }

        let read = |name: &'static str| self.read_field(&row.id, name, field_ids);

        let last_update = read(totals::LAST_UPDATE_TIME)
            .await?
            .as_date_range()
            .map_err(|e| invariant(contributor_id, totals::LAST_UPDATE_TIME, &e.to_string()))?
            .map(|r| r.start);
        if let Some(last) = last_update {
            if last >= now {
                warn!(
                    contributor_id,
                    last_update = %last,
                    pass_start = %now,
                    "Total updated at or after pass start; skipping"
                );
                return Ok(TotalOutcome::SkippedByGuard);
            }
        }

        let mut stored = StageCounts::default();
        for stage in Stage::ALL {
            let name = totals::count_field(stage);
            stored.set(stage, count(&read(name).await?, contributor_id, name)?);
        }
        let counts = stored.add(&delta.counts);
        let points = number(&read(totals::POINTS).await?, contributor_id, totals::POINTS)? + delta.points;

        let total = ContributorTotal {
            contributor_id: contributor_id.to_string(),
            contributor: delta.contributor.clone(),
            counts,
            points,
            last_update_time: Some(now),
        };
        self.store
            .update_item(&row.id, total.numeric_fields())
            .await
            .during(format!("update total for {}", contributor_id))?;

        info!(
            contributor_id,
            added_points = delta.points,
            points,
            "Updated contributor total"
        );
        Ok(TotalOutcome::Updated)
    }

    async fn read_field(
        &self,
        item_id: &str,
        name: &str,
        field_ids: &HashMap<String, String>,
    ) -> EngineResult<FieldValue> {
        let field_id = field_ids.get(name).ok_or_else(|| {
            EngineError::InvariantViolation(format!("totals collection has no '{}' field", name))
        })?;
        self.store
            .get_item_field_value(item_id, field_id)
            .await
            .during(format!("read {} of total {}", name, item_id))
    }
}

async fn mark_records(ledger: &Ledger<'_>, contributor_id: &str, record_ids: &[ItemId]) -> (usize, Vec<ItemId>) {
    let mut marked = 0;
    let mut unmarked = Vec::new();
    for record_id in record_ids {
        match ledger.mark_applied(record_id).await {
            Ok(()) => marked += 1,
            Err(e) => {
                error!(
                    contributor_id,
                    record_id = %record_id,
                    error = %e,
                    "Record applied to total but not marked; needs manual reconciliation"
                );
                unmarked.push(record_id.clone());
            }
        }
    }
    (marked, unmarked)
}

fn number(value: &FieldValue, contributor_id: &str, name: &str) -> EngineResult<f64> {
    value
        .as_number()
        .map_err(|e| invariant(contributor_id, name, &e.to_string()))?
        .ok_or_else(|| invariant(contributor_id, name, "is empty"))
}

/// Stored counts must be non-negative whole numbers
fn count(value: &FieldValue, contributor_id: &str, name: &str) -> EngineResult<u64> {
    let value = number(value, contributor_id, name)?;
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
        return Err(invariant(contributor_id, name, &format!("holds an invalid count {}", value)));
    }
    Ok(value as u64)
}

fn invariant(contributor_id: &str, field: &str, reason: &str) -> EngineError {
    EngineError::InvariantViolation(format!("total for {} field '{}' {}", contributor_id, field, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, contributor: &str, stage: Stage, points: f64) -> ContributionRecord {
        ContributionRecord {
            record_id: id.into(),
            task_id: format!("task-{}", id),
            source_collection_id: "src".into(),
            stage,
            contributor_id: contributor.into(),
            contributor: Some(PersonRef::person(contributor, contributor)),
            points,
            start_time: None,
            end_time: None,
            aggregated: false,
        }
    }

    #[test]
    fn test_accumulator_groups_by_contributor() {
        let mut acc = Accumulator::new();
        acc.add(&record("r1", "alice", Stage::Source, 20.0));
        acc.add(&record("r2", "alice", Stage::Translate, 50.0));
        acc.add(&record("r3", "bob", Stage::Proofread, 30.0));
        acc.add(&record("r4", "alice", Stage::Translate, 5.0));

        assert_eq!(acc.len(), 2);
        let alice = acc.get("alice").unwrap();
        assert_eq!(alice.counts.source, 1);
        assert_eq!(alice.counts.translate, 2);
        assert_eq!(alice.points, 75.0);
        assert_eq!(alice.record_ids, vec!["r1", "r2", "r4"]);
        assert_eq!(acc.get("bob").unwrap().counts.proofread, 1);
    }

    #[test]
    fn test_empty_number_is_invariant_violation() {
        let err = number(&FieldValue::Number(None), "alice", totals::POINTS).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
        assert_eq!(number(&FieldValue::Number(Some(3.0)), "alice", totals::POINTS).unwrap(), 3.0);
    }

    #[test]
    fn test_count_rejects_negative_and_fractional() {
        let name = totals::count_field(Stage::Source);
        assert_eq!(count(&FieldValue::Number(Some(4.0)), "alice", name).unwrap(), 4);
        assert_eq!(count(&FieldValue::Formula(Some(0.0)), "alice", name).unwrap(), 0);

        for bad in [-1.0, 1.5, f64::NAN, f64::INFINITY] {
            let err = count(&FieldValue::Number(Some(bad)), "alice", name).unwrap_err();
            assert!(matches!(err, EngineError::InvariantViolation(_)), "{} accepted", bad);
        }
    }
}
