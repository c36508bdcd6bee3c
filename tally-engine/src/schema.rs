//! Collections owned by the engine
//!
//! Field names and creation schemas for the Configuration collection, the
//! per-stage ledger collections and the totals collection.

use crate::models::Stage;
use crate::store::{CollectionSchema, FieldKind, FieldSpec};

/// Ledger (ContributionRecord) collection fields
pub mod record {
    pub const TASK_ID: &str = "TaskId";
    pub const SOURCE_COLLECTION_ID: &str = "SourceCollectionId";
    pub const CONTRIBUTOR_ID: &str = "ContributorId";
    pub const CONTRIBUTOR: &str = "Contributor";
    pub const POINTS: &str = "Points";
    pub const WORK_PERIOD: &str = "WorkPeriod";
    pub const AGGREGATED: &str = "Aggregated";
    pub const RECORDED_AT: &str = "RecordedAt";
}

/// ContributorTotal collection fields
pub mod totals {
    use crate::models::Stage;

    pub const CONTRIBUTOR_ID: &str = "ContributorId";
    pub const CONTRIBUTOR: &str = "Contributor";
    pub const SOURCE_COUNT: &str = "SourceCount";
    pub const TRANSLATE_COUNT: &str = "TranslateCount";
    pub const PROOFREAD_COUNT: &str = "ProofreadCount";
    pub const BOUNTY_COUNT: &str = "BountyCount";
    pub const POINTS: &str = "Points";
    pub const LAST_UPDATE_TIME: &str = "LastUpdateTime";

    pub fn count_field(stage: Stage) -> &'static str {
        match stage {
            Stage::Source => SOURCE_COUNT,
            Stage::Translate => TRANSLATE_COUNT,
            Stage::Proofread => PROOFREAD_COUNT,
            Stage::Bounty => BOUNTY_COUNT,
        }
    }
}

/// Configuration collection fields
pub mod config {
    pub const KEY: &str = "Key";
    pub const VALUE: &str = "Value";
    pub const DESCRIPTION: &str = "Description";
}

pub const CONFIGURATION_TITLE: &str = "Tally Configuration";
pub const TOTALS_TITLE: &str = "Contributor Totals";

pub fn configuration_schema(parent_id: &str) -> CollectionSchema {
    CollectionSchema {
        title: CONFIGURATION_TITLE.to_string(),
        description: "Settings for the contribution tally engine".to_string(),
        parent_id: parent_id.to_string(),
        fields: vec![
            FieldSpec::new(config::KEY, FieldKind::Title),
            FieldSpec::new(config::VALUE, FieldKind::Text),
            FieldSpec::new(config::DESCRIPTION, FieldKind::Text),
        ],
    }
}

pub fn record_schema(parent_id: &str, stage: Stage) -> CollectionSchema {
    CollectionSchema {
        title: format!("{} Records", stage.label()),
        description: format!("One row per task credited for {} work", stage),
        parent_id: parent_id.to_string(),
        fields: vec![
            FieldSpec::new(record::TASK_ID, FieldKind::Title),
            FieldSpec::new(record::SOURCE_COLLECTION_ID, FieldKind::Text),
            FieldSpec::new(record::CONTRIBUTOR_ID, FieldKind::Text),
            FieldSpec::new(record::CONTRIBUTOR, FieldKind::People),
            FieldSpec::new(record::POINTS, FieldKind::Number),
            FieldSpec::new(record::WORK_PERIOD, FieldKind::Date),
            FieldSpec::new(record::AGGREGATED, FieldKind::Checkbox),
            FieldSpec::new(record::RECORDED_AT, FieldKind::Date),
        ],
    }
}

pub fn totals_schema(parent_id: &str) -> CollectionSchema {
    let mut fields = vec![
        FieldSpec::new(totals::CONTRIBUTOR_ID, FieldKind::Title),
        FieldSpec::new(totals::CONTRIBUTOR, FieldKind::People),
    ];
    fields.extend(
        Stage::ALL
            .iter()
            .map(|s| FieldSpec::new(totals::count_field(*s), FieldKind::Number)),
    );
    fields.push(FieldSpec::new(totals::POINTS, FieldKind::Number));
    fields.push(FieldSpec::new(totals::LAST_UPDATE_TIME, FieldKind::Date));

    CollectionSchema {
        title: TOTALS_TITLE.to_string(),
        description: "Running points and stage counts per contributor".to_string(),
        parent_id: parent_id.to_string(),
        fields,
    }
}
