//! Per-pass run summary
//!
//! Display: "N items, R records created (E existing), T totals updated (C created, G guarded), M marked"

use crate::error::EngineError;
use crate::models::Stage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

/// A stage or item that was not turned into a record, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub item_id: String,
    pub task_id: Option<String>,
    pub stage: Option<Stage>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_ms: u64,

    // Reconciliation
    pub source_collections_read: usize,
    pub items_read: usize,
    pub ids_minted: usize,
    pub ids_unpersisted: usize,
    pub records_created: BTreeMap<Stage, usize>,
    pub records_existing: usize,
    pub skipped: Vec<SkippedItem>,

    // Aggregation
    pub pending_records: usize,
    pub totals_created: usize,
    pub totals_updated: usize,
    pub totals_skipped_by_guard: usize,
    pub records_marked: usize,
    pub updated_contributor_ids: Vec<String>,
    /// Applied to a total but not marked; flagged for manual reconciliation
    pub unmarked_record_ids: Vec<String>,

    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl RunSummary {
    pub fn records_created_total(&self) -> usize {
        self.records_created.values().sum()
    }

    pub fn record_created(&mut self, stage: Stage) {
        *self.records_created.entry(stage).or_insert(0) += 1;
    }

    pub fn skip(&mut self, item_id: &str, task_id: Option<&str>, stage: Option<Stage>, reason: impl Into<String>) {
        self.skipped.push(SkippedItem {
            item_id: item_id.to_string(),
            task_id: task_id.map(str::to_string),
            stage,
            reason: reason.into(),
        });
    }

    /// File a non-fatal engine error under warnings or errors
    pub fn note(&mut self, err: &EngineError) {
        match err {
            EngineError::InvariantViolation(_) => self.warnings.push(err.to_string()),
            _ => self.errors.push(err.to_string()),
        }
    }

    pub fn display_string(&self) -> String {
        format!(
            "{} items, {} records created ({} existing), {} totals updated ({} created, {} guarded), {} marked",
            self.items_read,
            self.records_created_total(),
            self.records_existing,
            self.totals_updated,
            self.totals_created,
            self.totals_skipped_by_guard,
            self.records_marked,
        )
    }

    pub fn log(&self) {
        info!(
            duration_ms = self.duration_ms,
            skipped = self.skipped.len(),
            warnings = self.warnings.len(),
            errors = self.errors.len(),
            "Pass complete: {}",
            self.display_string()
        );
        for skipped in &self.skipped {
            warn!(
                item_id = %skipped.item_id,
                task_id = ?skipped.task_id,
                stage = ?skipped.stage,
                reason = %skipped.reason,
                "Skipped"
            );
        }
        for warning in &self.warnings {
            warn!(warning = %warning, "Pass warning");
        }
        if !self.unmarked_record_ids.is_empty() {
            error!(
                record_ids = ?self.unmarked_record_ids,
                "Records applied to totals but not marked; they will be applied again next pass unless marked by hand"
            );
        }
    }
}
