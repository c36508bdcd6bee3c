//! Project configuration stored in the external store
//!
//! The Configuration collection holds one `Key`/`Value`/`Description` row per
//! setting. [`ConfigResolver::resolve`] reads it once per pass into an
//! immutable [`ProjectConfig`], seeding missing rows and creating the
//! engine-owned collections on first use.
//!
//! **Fatal conditions:** unreadable configuration, invalid or missing point
//! ratios, an empty contribution source list, or an engine-owned collection
//! that cannot be created.

use crate::error::{EngineError, EngineResult};
use crate::models::{LogicalField, Stage};
use crate::schema;
use crate::store::{query_all, FieldMap, FieldValue, Item, RecordStore};
use std::collections::{BTreeMap, HashMap};
use tally_common::config::EngineSettings;
use tally_common::uuid_utils;
use tracing::{debug, error, info, warn};

const AUTO_DESCRIPTION: &str = "Filled in automatically. Only edit if the value is empty.";

/// Role of a per-stage source field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageRole {
    Contributors,
    StartTime,
    EndTime,
}

impl StageRole {
    const ALL: [StageRole; 3] = [StageRole::Contributors, StageRole::StartTime, StageRole::EndTime];

    fn as_str(&self) -> &'static str {
        match self {
            StageRole::Contributors => "contributors",
            StageRole::StartTime => "start_time",
            StageRole::EndTime => "end_time",
        }
    }
}

/// Keys of the Configuration collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    TotalsCollection,
    RecordCollection(Stage),
    ContributionSources,
    BountySources,
    Ratio(Stage),
    TaskIdField,
    TotalPointsField,
    StageField(Stage, StageRole),
}

impl ConfigKey {
    /// Every key, in seeding order
    pub fn all() -> Vec<ConfigKey> {
        let mut keys = vec![ConfigKey::TotalsCollection];
        keys.extend(Stage::ALL.iter().map(|s| ConfigKey::RecordCollection(*s)));
        keys.push(ConfigKey::ContributionSources);
        keys.push(ConfigKey::BountySources);
        keys.extend(Stage::RECONCILED.iter().map(|s| ConfigKey::Ratio(*s)));
        keys.push(ConfigKey::TaskIdField);
        keys.push(ConfigKey::TotalPointsField);
        for stage in Stage::RECONCILED {
            keys.extend(StageRole::ALL.iter().map(|r| ConfigKey::StageField(stage, *r)));
        }
        keys
    }

    pub fn key(&self) -> String {
        match self {
            ConfigKey::TotalsCollection => "auto.totals_collection_id".to_string(),
            ConfigKey::RecordCollection(stage) => format!("auto.record_collection.{}", stage),
            ConfigKey::ContributionSources => "sources.contribution_collections".to_string(),
            ConfigKey::BountySources => "sources.bounty_collections".to_string(),
            ConfigKey::Ratio(stage) => format!("ratio.{}", stage),
            ConfigKey::TaskIdField => "field.task_id".to_string(),
            ConfigKey::TotalPointsField => "field.total_points".to_string(),
            ConfigKey::StageField(stage, role) => format!("field.{}.{}", stage, role.as_str()),
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            ConfigKey::TotalsCollection
            | ConfigKey::RecordCollection(_)
            | ConfigKey::ContributionSources
            | ConfigKey::BountySources => "",
            ConfigKey::Ratio(Stage::Source) => "20",
            ConfigKey::Ratio(Stage::Translate) => "50",
            ConfigKey::Ratio(Stage::Proofread) => "30",
            ConfigKey::Ratio(Stage::Bounty) => "100",
            ConfigKey::TaskIdField => "TaskId",
            ConfigKey::TotalPointsField => "Points",
            ConfigKey::StageField(stage, role) => match (stage, role) {
                (Stage::Source, StageRole::Contributors) => "Source",
                // Sourcing is a single event; start and end share one date
                (Stage::Source, _) => "Sourced At",
                (Stage::Translate, StageRole::Contributors) => "Translator",
                (Stage::Translate, StageRole::StartTime) => "Translation Started",
                (Stage::Translate, StageRole::EndTime) => "Translation Done",
                (Stage::Proofread, StageRole::Contributors) => "Proofreader",
                (Stage::Proofread, StageRole::StartTime) => "Proofread Started",
                (Stage::Proofread, StageRole::EndTime) => "Proofread Done",
                (Stage::Bounty, _) => "",
            },
        }
    }

    pub fn description(&self) -> String {
        match self {
            ConfigKey::TotalsCollection | ConfigKey::RecordCollection(_) => AUTO_DESCRIPTION.to_string(),
            ConfigKey::ContributionSources => {
                "Ids of the collections to tally work from, separated by ','".to_string()
            }
            ConfigKey::BountySources => {
                "Ids of the bounty task collections, separated by ','".to_string()
            }
            ConfigKey::Ratio(stage) => format!(
                "Percentage of a task's points credited for {} work (source + translate + proofread = 100)",
                stage
            ),
            ConfigKey::TaskIdField => {
                "Name of the task id field in the source collections (title or text)".to_string()
            }
            ConfigKey::TotalPointsField => {
                "Name of the task points field in the source collections (number)".to_string()
            }
            ConfigKey::StageField(stage, StageRole::Contributors) => {
                format!("Name of the {} contributor field (people)", stage)
            }
            ConfigKey::StageField(stage, StageRole::StartTime) => {
                format!("Name of the {} start time field (date)", stage)
            }
            ConfigKey::StageField(stage, StageRole::EndTime) => {
                format!("Name of the {} end time field (date)", stage)
            }
        }
    }
}

/// Stage point ratios in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointRatios {
    pub source: f64,
    pub translate: f64,
    pub proofread: f64,
}

impl PointRatios {
    /// Validate that every ratio is within 0..=100 and the three sum to 100
    pub fn new(source: f64, translate: f64, proofread: f64) -> EngineResult<Self> {
        for (stage, value) in [
            (Stage::Source, source),
            (Stage::Translate, translate),
            (Stage::Proofread, proofread),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(EngineError::Configuration(format!(
                    "{} point ratio {} is outside 0..=100",
                    stage, value
                )));
            }
        }

        let sum = source + translate + proofread;
        if (sum - 100.0).abs() > 1e-9 {
            return Err(EngineError::Configuration(format!(
                "point ratios must sum to 100, got {} + {} + {} = {}",
                source, translate, proofread, sum
            )));
        }

        Ok(Self {
            source,
            translate,
            proofread,
        })
    }

    /// Ratio for a stage; bounty points are credited as stored
    pub fn ratio(&self, stage: Stage) -> f64 {
        match stage {
            Stage::Source => self.source,
            Stage::Translate => self.translate,
            Stage::Proofread => self.proofread,
            Stage::Bounty => 100.0,
        }
    }
}

impl Default for PointRatios {
    fn default() -> Self {
        Self {
            source: 20.0,
            translate: 50.0,
            proofread: 30.0,
        }
    }
}

/// Stored field names for one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFieldNames {
    pub contributors: String,
    pub start_time: String,
    pub end_time: String,
}

/// Logical field → stored field name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub task_id: String,
    pub total_points: String,
    pub stages: BTreeMap<Stage, StageFieldNames>,
}

impl FieldMapping {
    pub fn name_of(&self, field: LogicalField) -> Option<&str> {
        match field {
            LogicalField::TaskId => Some(&self.task_id),
            LogicalField::TotalPoints => Some(&self.total_points),
            LogicalField::Contributors(s) => self.stages.get(&s).map(|n| n.contributors.as_str()),
            LogicalField::StartTime(s) => self.stages.get(&s).map(|n| n.start_time.as_str()),
            LogicalField::EndTime(s) => self.stages.get(&s).map(|n| n.end_time.as_str()),
        }
    }

    /// Every mapped logical field with its stored name
    pub fn entries(&self) -> Vec<(LogicalField, &str)> {
        let mut entries = vec![
            (LogicalField::TaskId, self.task_id.as_str()),
            (LogicalField::TotalPoints, self.total_points.as_str()),
        ];
        for (stage, names) in &self.stages {
            entries.push((LogicalField::Contributors(*stage), names.contributors.as_str()));
            entries.push((LogicalField::StartTime(*stage), names.start_time.as_str()));
            entries.push((LogicalField::EndTime(*stage), names.end_time.as_str()));
        }
        entries
    }
}

impl Default for FieldMapping {
    fn default() -> Self {
        let value = |key: ConfigKey| key.default_value().to_string();
        Self {
            task_id: value(ConfigKey::TaskIdField),
            total_points: value(ConfigKey::TotalPointsField),
            stages: Stage::RECONCILED
                .iter()
                .map(|s| {
                    (
                        *s,
                        StageFieldNames {
                            contributors: value(ConfigKey::StageField(*s, StageRole::Contributors)),
                            start_time: value(ConfigKey::StageField(*s, StageRole::StartTime)),
                            end_time: value(ConfigKey::StageField(*s, StageRole::EndTime)),
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Resolved, immutable configuration for one pass
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub configuration_collection_id: String,
    pub totals_collection_id: String,
    pub record_collections: BTreeMap<Stage, String>,
    pub contribution_sources: Vec<String>,
    pub bounty_sources: Vec<String>,
    pub ratios: PointRatios,
    pub fields: FieldMapping,
    pub settings: EngineSettings,
}

impl ProjectConfig {
    pub fn record_collection(&self, stage: Stage) -> EngineResult<&str> {
        self.record_collections
            .get(&stage)
            .map(String::as_str)
            .ok_or_else(|| {
                EngineError::Configuration(format!("no record collection for {} stage", stage))
            })
    }
}

/// Parse a comma-separated collection id list
///
/// Everything except ASCII alphanumerics, `-` and `,` is dropped first, so
/// pasted URLs fragments and stray whitespace are tolerated.
pub fn parse_id_list(raw: &str) -> Vec<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == ',')
        .collect();

    let mut ids: Vec<String> = Vec::new();
    for id in cleaned.split(',').filter(|s| !s.is_empty()) {
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// Create the Configuration collection and seed it with default rows
pub async fn bootstrap_configuration(store: &dyn RecordStore, parent_page_id: &str) -> EngineResult<String> {
    let collection_id = store
        .create_collection(&schema::configuration_schema(parent_page_id))
        .await
        .map_err(|e| {
            EngineError::Configuration(format!("cannot create configuration collection: {}", e))
        })?;

    for key in ConfigKey::all() {
        store
            .create_item(&collection_id, config_row(&key, key.default_value()))
            .await
            .map_err(|e| {
                EngineError::Configuration(format!("cannot seed configuration row {}: {}", key.key(), e))
            })?;
    }

    warn!(
        configuration_collection_id = %collection_id,
        "Created configuration collection; set [store] configuration_collection_id to reuse it"
    );
    Ok(collection_id)
}

fn config_row(key: &ConfigKey, value: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(schema::config::KEY.to_string(), FieldValue::Title(key.key()));
    fields.insert(schema::config::VALUE.to_string(), FieldValue::Text(value.to_string()));
    fields.insert(
        schema::config::DESCRIPTION.to_string(),
        FieldValue::Text(key.description()),
    );
    fields
}

struct ConfigRow {
    item_id: Option<String>,
    value: String,
}

/// Reads the Configuration collection into a [`ProjectConfig`]
pub struct ConfigResolver<'a> {
    store: &'a dyn RecordStore,
    configuration_collection_id: &'a str,
    parent_page_id: Option<&'a str>,
}

impl<'a> ConfigResolver<'a> {
    pub fn new(
        store: &'a dyn RecordStore,
        configuration_collection_id: &'a str,
        parent_page_id: Option<&'a str>,
    ) -> Self {
        Self {
            store,
            configuration_collection_id,
            parent_page_id,
        }
    }

    pub async fn resolve(&self, settings: &EngineSettings) -> EngineResult<ProjectConfig> {
        let mut rows = self.read_rows().await?;
        self.seed_missing(&mut rows).await;

        let rows = &rows;
        let value = |key: ConfigKey| rows.get(&key.key()).map(|r| r.value.trim()).unwrap_or("");

        let ratio = |stage: Stage| -> EngineResult<f64> {
            let raw = value(ConfigKey::Ratio(stage));
            raw.trim_end_matches('%').trim().parse::<f64>().map_err(|_| {
                EngineError::Configuration(format!(
                    "point ratio {} is missing or not a number: '{}'",
                    ConfigKey::Ratio(stage).key(),
                    raw
                ))
            })
        };
        let ratios = PointRatios::new(
            ratio(Stage::Source)?,
            ratio(Stage::Translate)?,
            ratio(Stage::Proofread)?,
        )?;

        let contribution_sources = parse_id_list(value(ConfigKey::ContributionSources));
        if contribution_sources.is_empty() {
            return Err(EngineError::Configuration(format!(
                "{} lists no source collections",
                ConfigKey::ContributionSources.key()
            )));
        }
        let bounty_sources = parse_id_list(value(ConfigKey::BountySources));

        let field = |key: ConfigKey| -> String {
            let v = value(key);
            if v.is_empty() {
                key.default_value().to_string()
            } else {
                v.to_string()
            }
        };
        let fields = FieldMapping {
            task_id: field(ConfigKey::TaskIdField),
            total_points: field(ConfigKey::TotalPointsField),
            stages: Stage::RECONCILED
                .iter()
                .map(|s| {
                    (
                        *s,
                        StageFieldNames {
                            contributors: field(ConfigKey::StageField(*s, StageRole::Contributors)),
                            start_time: field(ConfigKey::StageField(*s, StageRole::StartTime)),
                            end_time: field(ConfigKey::StageField(*s, StageRole::EndTime)),
                        },
                    )
                })
                .collect(),
        };

        let totals_collection_id = self
            .get_or_create(rows, ConfigKey::TotalsCollection, || {
                schema::totals_schema(self.parent_page_id.unwrap_or_default())
            })
            .await?;

        let mut record_collections = BTreeMap::new();
        for stage in Stage::ALL {
            let id = self
                .get_or_create(rows, ConfigKey::RecordCollection(stage), || {
                    schema::record_schema(self.parent_page_id.unwrap_or_default(), stage)
                })
                .await?;
            record_collections.insert(stage, id);
        }

        info!(
            sources = contribution_sources.len(),
            bounty_sources = bounty_sources.len(),
            source_ratio = ratios.source,
            translate_ratio = ratios.translate,
            proofread_ratio = ratios.proofread,
            "Project configuration resolved"
        );

        Ok(ProjectConfig {
            configuration_collection_id: self.configuration_collection_id.to_string(),
            totals_collection_id,
            record_collections,
            contribution_sources,
            bounty_sources,
            ratios,
            fields,
            settings: settings.clone(),
        })
    }

    async fn read_rows(&self) -> EngineResult<HashMap<String, ConfigRow>> {
        let items = query_all(self.store, self.configuration_collection_id, None)
            .await
            .map_err(|e| EngineError::Configuration(format!("cannot read configuration collection: {}", e)))?;

        let mut rows = HashMap::new();
        for item in items {
            let Some(key) = text_of(&item, schema::config::KEY) else {
                continue;
            };
            if rows.contains_key(&key) {
                warn!(key = %key, item_id = %item.id, "Duplicate configuration row ignored");
                continue;
            }
            rows.insert(
                key,
                ConfigRow {
                    item_id: Some(item.id.clone()),
                    value: text_of(&item, schema::config::VALUE).unwrap_or_default(),
                },
            );
        }
        debug!(rows = rows.len(), "Read configuration rows");
        Ok(rows)
    }

    /// Create rows for keys added since the collection was seeded
    async fn seed_missing(&self, rows: &mut HashMap<String, ConfigRow>) {
        for key in ConfigKey::all() {
            if rows.contains_key(&key.key()) {
                continue;
            }
            let item_id = match self
                .store
                .create_item(self.configuration_collection_id, config_row(&key, key.default_value()))
                .await
            {
                Ok(item) => {
                    info!(key = %key.key(), "Seeded missing configuration row");
                    Some(item.id)
                }
                Err(e) => {
                    warn!(key = %key.key(), error = %e, "Could not seed configuration row, using default");
                    None
                }
            };
            rows.insert(
                key.key(),
                ConfigRow {
                    item_id,
                    value: key.default_value().to_string(),
                },
            );
        }
    }

    async fn get_or_create(
        &self,
        rows: &HashMap<String, ConfigRow>,
        key: ConfigKey,
        schema: impl FnOnce() -> crate::store::CollectionSchema,
    ) -> EngineResult<String> {
        let row = rows.get(&key.key());
        let existing = row.map(|r| uuid_utils::compact(&r.value)).unwrap_or_default();
        if !existing.is_empty() {
            return Ok(existing);
        }

        if self.parent_page_id.is_none() {
            return Err(EngineError::Configuration(format!(
                "{} is empty and no parent page is configured to create it under",
                key.key()
            )));
        }

        let created = self.store.create_collection(&schema()).await.map_err(|e| {
            EngineError::Configuration(format!("cannot create collection for {}: {}", key.key(), e))
        })?;
        let id = uuid_utils::compact(&created);
        info!(key = %key.key(), collection_id = %id, "Created engine collection");

        let mut patch = FieldMap::new();
        patch.insert(schema::config::VALUE.to_string(), FieldValue::Text(id.clone()));
        let written = match row.and_then(|r| r.item_id.as_deref()) {
            Some(item_id) => self.store.update_item(item_id, patch).await.map(|_| ()),
            None => self
                .store
                .create_item(self.configuration_collection_id, config_row(&key, &id))
                .await
                .map(|_| ()),
        };
        if let Err(e) = written {
            error!(
                key = %key.key(),
                collection_id = %id,
                error = %e,
                "Created collection but could not record its id; the next pass will create another"
            );
        }

        Ok(id)
    }
}

fn text_of(item: &Item, field: &str) -> Option<String> {
    item.field(field)
        .and_then(|v| v.as_text().ok().flatten())
        .map(str::to_string)
}
