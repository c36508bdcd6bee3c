//! Test Helper Utilities
//!
//! Builds an in-memory store with a seeded Configuration collection and one
//! source collection laid out with the default field names.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tally_common::config::{EngineSettings, StoreSettings, TomlConfig};
use tally_engine::models::{Stage, StageCounts};
use tally_engine::project_config::{bootstrap_configuration, ProjectConfig};
use tally_engine::schema::{config, record, totals};
use tally_engine::store::memory::MemoryStore;
use tally_engine::store::{
    query_all, CollectionSchema, DateRange, FieldKind, FieldMap, FieldSpec, FieldValue, Item,
    PersonRef, RecordStore,
};
use tally_engine::Engine;

pub const PARENT_PAGE: &str = "parent-page";

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub engine: Engine,
    pub config_id: String,
    pub source_id: String,
}

impl Fixture {
    pub async fn project(&self) -> ProjectConfig {
        self.engine.project_config().await.unwrap()
    }

    pub async fn records(&self, stage: Stage) -> Vec<Item> {
        let project = self.project().await;
        self.store
            .items(project.record_collection(stage).unwrap())
            .await
    }

    pub async fn pending(&self, stage: Stage) -> Vec<Item> {
        self.records(stage)
            .await
            .into_iter()
            .filter(|r| r.field(record::AGGREGATED) == Some(&FieldValue::Checkbox(false)))
            .collect()
    }

    pub async fn total_rows(&self) -> Vec<Item> {
        let project = self.project().await;
        self.store.items(&project.totals_collection_id).await
    }

    /// (counts, points) for a contributor, if a total row exists
    pub async fn total(&self, contributor_id: &str) -> Option<(StageCounts, f64)> {
        self.total_rows()
            .await
            .into_iter()
            .find(|row| row.field(totals::CONTRIBUTOR_ID) == Some(&FieldValue::Title(contributor_id.into())))
            .map(|row| {
                let n = |name: &str| row.field(name).unwrap().as_number().unwrap().unwrap();
                (
                    StageCounts {
                        source: n(totals::SOURCE_COUNT) as u64,
                        translate: n(totals::TRANSLATE_COUNT) as u64,
                        proofread: n(totals::PROOFREAD_COUNT) as u64,
                        bounty: n(totals::BOUNTY_COUNT) as u64,
                    },
                    n(totals::POINTS),
                )
            })
    }

    pub async fn add_task(&self, fields: FieldMap) -> String {
        self.store.create_item(&self.source_id, fields).await.unwrap().id
    }

    pub async fn set_config(&self, key: &str, value: &str) {
        set_config(&self.store, &self.config_id, key, value).await;
    }
}

pub async fn fixture() -> Fixture {
    fixture_with(EngineSettings::default(), source_fields()).await
}

pub async fn fixture_with_settings(settings: EngineSettings) -> Fixture {
    fixture_with(settings, source_fields()).await
}

pub async fn fixture_with(settings: EngineSettings, fields: Vec<FieldSpec>) -> Fixture {
    // Small pages force every query through the cursor loop
    let store = Arc::new(MemoryStore::with_page_size(3));
    let config_id = bootstrap_configuration(store.as_ref(), PARENT_PAGE).await.unwrap();

    let source_id = store
        .create_collection(&CollectionSchema {
            title: "Articles".into(),
            description: String::new(),
            parent_id: PARENT_PAGE.into(),
            fields,
        })
        .await
        .unwrap();
    set_config(&store, &config_id, "sources.contribution_collections", &source_id).await;

    let toml = TomlConfig {
        store: StoreSettings {
            parent_page_id: Some(PARENT_PAGE.into()),
            configuration_collection_id: Some(config_id.clone()),
            ..StoreSettings::default()
        },
        engine: settings,
        ..TomlConfig::default()
    };
    let engine = Engine::new(store.clone() as Arc<dyn RecordStore>, &toml);

    Fixture {
        store,
        engine,
        config_id,
        source_id,
    }
}

/// Source collection schema using the default configured field names
pub fn source_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::new("Name", FieldKind::Title),
        FieldSpec::new("TaskId", FieldKind::Text),
        FieldSpec::new("Points", FieldKind::Number),
        FieldSpec::new("Source", FieldKind::People),
        FieldSpec::new("Sourced At", FieldKind::Date),
        FieldSpec::new("Translator", FieldKind::People),
        FieldSpec::new("Translation Started", FieldKind::Date),
        FieldSpec::new("Translation Done", FieldKind::Date),
        FieldSpec::new("Proofreader", FieldKind::People),
        FieldSpec::new("Proofread Started", FieldKind::Date),
        FieldSpec::new("Proofread Done", FieldKind::Date),
    ]
}

pub async fn set_config(store: &MemoryStore, config_id: &str, key: &str, value: &str) {
    let rows = query_all(store, config_id, None).await.unwrap();
    let row = rows
        .iter()
        .find(|r| r.field(config::KEY) == Some(&FieldValue::Title(key.into())))
        .unwrap_or_else(|| panic!("no config row {}", key));
    let mut patch = FieldMap::new();
    patch.insert(config::VALUE.into(), FieldValue::Text(value.into()));
    store.update_item(&row.id, patch).await.unwrap();
}

pub fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 10, d, 9, 0, 0).unwrap()
}

pub fn person(id: &str) -> PersonRef {
    PersonRef::person(id, id)
}

fn date(ts: DateTime<Utc>) -> FieldValue {
    FieldValue::Date(Some(DateRange::at(ts)))
}

/// Task where one person did every stage
pub fn task(name: &str, who: &str, points: f64) -> FieldMap {
    task_by(name, who, who, who, points)
}

pub fn task_by(name: &str, sourcer: &str, translator: &str, proofreader: &str, points: f64) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("Name".into(), FieldValue::Title(name.into()));
    fields.insert("Points".into(), FieldValue::Number(Some(points)));
    fields.insert("Source".into(), FieldValue::People(vec![person(sourcer)]));
    fields.insert("Sourced At".into(), date(day(1)));
    fields.insert("Translator".into(), FieldValue::People(vec![person(translator)]));
    fields.insert("Translation Started".into(), date(day(2)));
    fields.insert("Translation Done".into(), date(day(4)));
    fields.insert("Proofreader".into(), FieldValue::People(vec![person(proofreader)]));
    fields.insert("Proofread Started".into(), date(day(5)));
    fields.insert("Proofread Done".into(), date(day(6)));
    fields
}

/// Sum of record points and per-stage counts per contributor over applied records
pub async fn applied_sums(fixture: &Fixture) -> HashMap<String, (StageCounts, f64)> {
    let mut sums: HashMap<String, (StageCounts, f64)> = HashMap::new();
    for stage in Stage::ALL {
        for rec in fixture.records(stage).await {
            if rec.field(record::AGGREGATED) != Some(&FieldValue::Checkbox(true)) {
                continue;
            }
            let contributor = rec
                .field(record::CONTRIBUTOR_ID)
                .unwrap()
                .as_text()
                .unwrap()
                .unwrap()
                .to_string();
            let points = rec.field(record::POINTS).unwrap().as_number().unwrap().unwrap();
            let entry = sums.entry(contributor).or_default();
            entry.0.increment(stage);
            entry.1 += points;
        }
    }
    sums
}
