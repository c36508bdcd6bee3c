//! Engine data model
//!
//! [`WorkItem`] is read fresh from a source collection on every pass.
//! [`ContributionRecord`] and [`ContributorTotal`] mirror rows the engine
//! owns in the store (see [`crate::schema`] for their field layout).

use crate::error::{EngineError, EngineResult};
use crate::schema::{record, totals};
use crate::store::{FieldMap, FieldValue, Item, ItemId, PersonRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Contribution stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Source,
    Translate,
    Proofread,
    Bounty,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Source, Stage::Translate, Stage::Proofread, Stage::Bounty];

    /// Stages created from source collections; Bounty records are only aggregated
    pub const RECONCILED: [Stage; 3] = [Stage::Source, Stage::Translate, Stage::Proofread];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Source => "source",
            Stage::Translate => "translate",
            Stage::Proofread => "proofread",
            Stage::Bounty => "bounty",
        }
    }

    /// Human-readable collection name fragment
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Source => "Source",
            Stage::Translate => "Translation",
            Stage::Proofread => "Proofreading",
            Stage::Bounty => "Bounty",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field of a source item, independent of what the collection calls it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogicalField {
    TaskId,
    TotalPoints,
    Contributors(Stage),
    StartTime(Stage),
    EndTime(Stage),
}

/// One row of a source collection, keyed by logical field
///
/// A logical field the collection does not have is simply absent from
/// `fields`.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub item_id: ItemId,
    pub source_collection_id: String,
    pub fields: BTreeMap<LogicalField, FieldValue>,
    /// Stored name of the task id field, when the collection has one
    pub task_id_field: Option<String>,
    /// Stored names of the mapped fields, for error messages
    pub field_names: BTreeMap<LogicalField, String>,
}

impl WorkItem {
    pub fn get(&self, field: LogicalField) -> Option<&FieldValue> {
        self.fields.get(&field)
    }

    /// Stored name of a logical field, falling back to a debug rendering
    pub fn field_name(&self, field: LogicalField) -> String {
        self.field_names
            .get(&field)
            .cloned()
            .unwrap_or_else(|| format!("{:?}", field))
    }
}

/// What a stage of one work item contributes, before weighting
#[derive(Debug, Clone, PartialEq)]
pub struct StageFacts {
    pub contributor: PersonRef,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub raw_points: f64,
}

/// One ledger row
#[derive(Debug, Clone, PartialEq)]
pub struct ContributionRecord {
    pub record_id: ItemId,
    pub task_id: String,
    pub source_collection_id: String,
    pub stage: Stage,
    pub contributor_id: String,
    pub contributor: Option<PersonRef>,
    /// Already stage-weighted
    pub points: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub aggregated: bool,
}

impl ContributionRecord {
    /// Decode a record row
    ///
    /// A row without a contributor id is an invariant violation: it cannot be
    /// credited to anyone.
    pub fn from_item(item: &Item, stage: Stage) -> EngineResult<Self> {
        let text = |name: &str| -> EngineResult<String> {
            match item.field(name) {
                Some(value) => value
                    .as_text()
                    .map(|t| t.unwrap_or_default().to_string())
                    .map_err(|e| invalid(item, name, &e.to_string())),
                None => Ok(String::new()),
            }
        };

        let task_id = text(record::TASK_ID)?;
        let contributor_id = text(record::CONTRIBUTOR_ID)?;
        if contributor_id.is_empty() {
            return Err(invalid(item, record::CONTRIBUTOR_ID, "is empty"));
        }

        let points = match item.field(record::POINTS) {
            Some(value) => value
                .as_number()
                .map_err(|e| invalid(item, record::POINTS, &e.to_string()))?
                .ok_or_else(|| invalid(item, record::POINTS, "is empty"))?,
            None => return Err(invalid(item, record::POINTS, "is absent")),
        };

        let contributor = item
            .field(record::CONTRIBUTOR)
            .and_then(|v| v.as_people().ok())
            .and_then(|p| p.first().cloned());

        let period = item
            .field(record::WORK_PERIOD)
            .and_then(|v| v.as_date_range().ok().flatten())
            .copied();

        let aggregated = item
            .field(record::AGGREGATED)
            .map(|v| v.as_bool().unwrap_or(false))
            .unwrap_or(false);

        Ok(Self {
            record_id: item.id.clone(),
            task_id,
            source_collection_id: text(record::SOURCE_COLLECTION_ID)?,
            stage,
            contributor_id,
            contributor,
            points,
            start_time: period.map(|p| p.start),
            end_time: period.and_then(|p| p.end),
            aggregated,
        })
    }
}

fn invalid(item: &Item, field: &str, reason: &str) -> EngineError {
    EngineError::InvariantViolation(format!("record {} field '{}' {}", item.id, field, reason))
}

/// Per-stage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub source: u64,
    pub translate: u64,
    pub proofread: u64,
    pub bounty: u64,
}

impl StageCounts {
    pub fn get(&self, stage: Stage) -> u64 {
        match stage {
            Stage::Source => self.source,
            Stage::Translate => self.translate,
            Stage::Proofread => self.proofread,
            Stage::Bounty => self.bounty,
        }
    }

    pub fn increment(&mut self, stage: Stage) {
        match stage {
            Stage::Source => self.source += 1,
            Stage::Translate => self.translate += 1,
            Stage::Proofread => self.proofread += 1,
            Stage::Bounty => self.bounty += 1,
        }
    }

    pub fn set(&mut self, stage: Stage, value: u64) {
        match stage {
            Stage::Source => self.source = value,
            Stage::Translate => self.translate = value,
            Stage::Proofread => self.proofread = value,
            Stage::Bounty => self.bounty = value,
        }
    }

    pub fn add(&self, other: &StageCounts) -> StageCounts {
        StageCounts {
            source: self.source + other.source,
            translate: self.translate + other.translate,
            proofread: self.proofread + other.proofread,
            bounty: self.bounty + other.bounty,
        }
    }

    pub fn total(&self) -> u64 {
        self.source + self.translate + self.proofread + self.bounty
    }
}

/// One row of the totals collection
#[derive(Debug, Clone, PartialEq)]
pub struct ContributorTotal {
    pub contributor_id: String,
    pub contributor: Option<PersonRef>,
    pub counts: StageCounts,
    pub points: f64,
    pub last_update_time: Option<DateTime<Utc>>,
}

impl ContributorTotal {
    /// Full field set, used when the row is first created
    pub fn to_fields(&self) -> FieldMap {
        let mut fields = self.numeric_fields();
        fields.insert(
            totals::CONTRIBUTOR_ID.to_string(),
            FieldValue::Title(self.contributor_id.clone()),
        );
        if let Some(person) = &self.contributor {
            fields.insert(
                totals::CONTRIBUTOR.to_string(),
                FieldValue::People(vec![person.clone()]),
            );
        }
        fields
    }

    /// Counters, points and last update time
    pub fn numeric_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        for stage in Stage::ALL {
            fields.insert(
                totals::count_field(stage).to_string(),
                FieldValue::Number(Some(self.counts.get(stage) as f64)),
            );
        }
        fields.insert(totals::POINTS.to_string(), FieldValue::Number(Some(self.points)));
        fields.insert(
            totals::LAST_UPDATE_TIME.to_string(),
            FieldValue::Date(self.last_update_time.map(crate::store::DateRange::at)),
        );
        fields
    }
}
