//! Integration tests for reconciliation + aggregation passes
//!
//! Drives the engine against the in-memory store, including injected store
//! failures.

mod helpers;

use chrono::Duration;
use helpers::*;
use tally_common::config::{EngineSettings, WriteBackPolicy, ZeroPointsPolicy};
use tally_engine::models::{Stage, StageCounts};
use tally_engine::schema::{record, totals};
use tally_engine::store::memory::Operation;
use tally_engine::store::{DateRange, FieldKind, FieldMap, FieldSpec, FieldValue, PersonRef, RecordStore};
use tally_engine::{EngineError, PassOptions};

fn points_of(item: &tally_engine::store::Item) -> f64 {
    item.field(record::POINTS).unwrap().as_number().unwrap().unwrap()
}

const RECONCILE_ONLY: PassOptions = PassOptions {
    reconcile: true,
    aggregate: false,
};

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_single_contributor_all_stages() {
    let fx = fixture().await;
    fx.add_task(task("Rust 2024 roadmap", "alice", 100.0)).await;

    let summary = fx.engine.run_pass(PassOptions::default()).await.unwrap();

    assert_eq!(summary.items_read, 1);
    assert_eq!(summary.ids_minted, 1);
    assert_eq!(summary.records_created_total(), 3);
    assert!(summary.skipped.is_empty());

    let expected = [(Stage::Source, 20.0), (Stage::Translate, 50.0), (Stage::Proofread, 30.0)];
    for (stage, points) in expected {
        let records = fx.records(stage).await;
        assert_eq!(records.len(), 1, "{} records", stage);
        assert_eq!(points_of(&records[0]), points);
        assert_eq!(
            records[0].field(record::AGGREGATED),
            Some(&FieldValue::Checkbox(true))
        );
    }

    let (counts, points) = fx.total("alice").await.unwrap();
    assert_eq!(
        counts,
        StageCounts {
            source: 1,
            translate: 1,
            proofread: 1,
            bounty: 0
        }
    );
    assert_eq!(points, 100.0);
    assert_eq!(summary.totals_created, 1);
    assert_eq!(summary.records_marked, 3);
}

#[tokio::test]
async fn test_missing_translate_end_time_skips_only_that_stage() {
    let fx = fixture().await;
    let mut fields = task("Async closures", "alice", 100.0);
    fields.remove("Translation Done");
    fx.add_task(fields).await;

    let summary = fx.engine.run_pass(PassOptions::default()).await.unwrap();

    assert_eq!(fx.records(Stage::Source).await.len(), 1);
    assert_eq!(fx.records(Stage::Translate).await.len(), 0);
    assert_eq!(fx.records(Stage::Proofread).await.len(), 1);

    assert_eq!(summary.skipped.len(), 1);
    let skipped = &summary.skipped[0];
    assert_eq!(skipped.stage, Some(Stage::Translate));
    assert!(skipped.reason.contains("Translation Done"));

    let (counts, points) = fx.total("alice").await.unwrap();
    assert_eq!(counts.translate, 0);
    assert_eq!(points, 50.0);
}

#[tokio::test]
async fn test_second_pass_without_new_records_changes_nothing() {
    let fx = fixture().await;
    fx.add_task(task("One", "alice", 10.0)).await;
    fx.add_task(task_by("Two", "bob", "carol", "alice", 40.0)).await;

    fx.engine.run_pass(PassOptions::default()).await.unwrap();
    let before = fx.total_rows().await;
    let updates_before = fx.store.calls(Operation::UpdateItem);

    let second = fx.engine.run_pass(PassOptions::default()).await.unwrap();

    assert_eq!(second.pending_records, 0);
    assert_eq!(second.totals_updated, 0);
    assert_eq!(second.totals_created, 0);
    assert_eq!(second.records_marked, 0);
    assert_eq!(second.records_created_total(), 0);
    assert_eq!(second.records_existing, 6);
    assert_eq!(fx.store.calls(Operation::UpdateItem), updates_before);

    let after = fx.total_rows().await;
    assert_eq!(before, after);
}

// ============================================================================
// Ledger dedup
// ============================================================================

#[tokio::test]
async fn test_reconcile_twice_creates_one_record_per_stage() {
    let fx = fixture().await;
    for i in 0..5 {
        fx.add_task(task(&format!("Task {}", i), "alice", 10.0)).await;
    }

    let first = fx.engine.run_pass(RECONCILE_ONLY).await.unwrap();
    assert_eq!(first.records_created_total(), 15);

    let second = fx.engine.run_pass(RECONCILE_ONLY).await.unwrap();
    assert_eq!(second.records_created_total(), 0);
    assert_eq!(second.records_existing, 15);
    assert_eq!(second.ids_minted, 0);

    for stage in Stage::RECONCILED {
        assert_eq!(fx.records(stage).await.len(), 5);
    }
}

#[tokio::test]
async fn test_existing_task_id_is_used_as_record_key() {
    let fx = fixture().await;
    let id = "0b6f8f0e-7d1c-4a58-9d8f-2f0a4c3b1e77";
    let mut fields = task("Pinned", "alice", 10.0);
    fields.insert("TaskId".into(), FieldValue::Text(id.into()));
    fx.add_task(fields).await;

    let summary = fx.engine.run_pass(RECONCILE_ONLY).await.unwrap();
    assert_eq!(summary.ids_minted, 0);

    let records = fx.records(Stage::Source).await;
    assert_eq!(records[0].field(record::TASK_ID), Some(&FieldValue::Title(id.into())));
}

#[tokio::test]
async fn test_items_sharing_a_task_id_get_one_record_per_stage() {
    let fx = fixture().await;
    assert!(fx.engine.settings().concurrency > 1);

    let id = "5d1c7a2e-93b4-4c0f-8e6a-1f2b3c4d5e6f";
    for title in ["Original", "Duplicate"] {
        let mut fields = task(title, "alice", 100.0);
        fields.insert("TaskId".into(), FieldValue::Text(id.into()));
        fx.add_task(fields).await;
    }

    let summary = fx.engine.run_pass(RECONCILE_ONLY).await.unwrap();

    assert_eq!(summary.items_read, 2);
    assert_eq!(summary.records_created_total(), 3);
    assert_eq!(summary.records_existing, 3);
    for stage in [Stage::Source, Stage::Translate, Stage::Proofread] {
        let records = fx.records(stage).await;
        assert_eq!(records.len(), 1, "{} records", stage);
        assert_eq!(records[0].field(record::TASK_ID), Some(&FieldValue::Title(id.into())));
    }
}

// ============================================================================
// Aggregation conservation and idempotency
// ============================================================================

#[tokio::test]
async fn test_totals_equal_sum_of_applied_records() {
    let fx = fixture().await;
    fx.add_task(task_by("A", "alice", "bob", "carol", 100.0)).await;
    fx.add_task(task_by("B", "bob", "bob", "alice", 60.0)).await;
    fx.add_task(task_by("C", "carol", "alice", "bob", 35.0)).await;

    fx.engine.run_pass(PassOptions::default()).await.unwrap();

    // New work between passes goes through the read-modify-write path
    fx.add_task(task_by("D", "alice", "alice", "bob", 20.0)).await;
    let second = fx.engine.run_pass(PassOptions::default()).await.unwrap();
    assert_eq!(second.totals_updated, 2);
    assert_eq!(second.updated_contributor_ids, vec!["alice", "bob"]);

    let sums = applied_sums(&fx).await;
    assert_eq!(sums.len(), 3);
    for (contributor, (counts, points)) in sums {
        let (total_counts, total_points) = fx.total(&contributor).await.unwrap();
        assert_eq!(total_counts, counts, "{} counts", contributor);
        assert!((total_points - points).abs() < 1e-9, "{} points", contributor);
    }

    for stage in Stage::ALL {
        assert!(fx.pending(stage).await.is_empty());
    }
}

#[tokio::test]
async fn test_rerun_on_unchanged_source_is_idempotent() {
    let fx = fixture().await;
    fx.add_task(task_by("A", "alice", "bob", "alice", 80.0)).await;

    fx.engine.run_pass(PassOptions::default()).await.unwrap();
    let first = (fx.total("alice").await, fx.total("bob").await);

    fx.engine.run_pass(PassOptions::default()).await.unwrap();
    let second = (fx.total("alice").await, fx.total("bob").await);

    assert_eq!(first, second);
    assert_eq!(fx.total_rows().await.len(), 2);
}

#[tokio::test]
async fn test_aggregate_only_pass_folds_earlier_records() {
    let fx = fixture().await;
    fx.add_task(task("A", "alice", 50.0)).await;

    fx.engine.run_pass(RECONCILE_ONLY).await.unwrap();
    assert!(fx.total("alice").await.is_none());
    assert_eq!(fx.pending(Stage::Translate).await.len(), 1);

    let summary = fx
        .engine
        .run_pass(PassOptions {
            reconcile: false,
            aggregate: true,
        })
        .await
        .unwrap();
    assert_eq!(summary.pending_records, 3);
    assert_eq!(fx.total("alice").await.unwrap().1, 50.0);
}

// ============================================================================
// Point ratios
// ============================================================================

#[tokio::test]
async fn test_custom_ratios_weight_records() {
    let fx = fixture().await;
    fx.set_config("ratio.source", "10").await;
    fx.set_config("ratio.translate", "60").await;
    fx.set_config("ratio.proofread", "30").await;
    fx.add_task(task("A", "alice", 50.0)).await;

    fx.engine.run_pass(PassOptions::default()).await.unwrap();

    assert_eq!(points_of(&fx.records(Stage::Source).await[0]), 5.0);
    assert_eq!(points_of(&fx.records(Stage::Translate).await[0]), 30.0);
    assert_eq!(points_of(&fx.records(Stage::Proofread).await[0]), 15.0);
    assert_eq!(fx.total("alice").await.unwrap().1, 50.0);
}

#[tokio::test]
async fn test_ratios_not_summing_to_100_abort_the_pass() {
    let fx = fixture().await;
    fx.set_config("ratio.translate", "60").await;
    fx.add_task(task("A", "alice", 50.0)).await;

    let err = fx.engine.run_pass(PassOptions::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
    assert!(err.is_fatal());
    assert!(fx.store.items(&fx.source_id).await[0]
        .field("TaskId")
        .unwrap()
        .as_text()
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_non_numeric_ratio_aborts_the_pass() {
    let fx = fixture().await;
    fx.set_config("ratio.source", "twenty").await;

    let err = fx.engine.run_pass(PassOptions::default()).await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_empty_source_list_aborts_the_pass() {
    let fx = fixture().await;
    fx.set_config("sources.contribution_collections", " ").await;

    let err = fx.engine.run_pass(PassOptions::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
}

// ============================================================================
// Partial failures
// ============================================================================

#[tokio::test]
async fn test_mark_failure_leaves_record_pending_and_reported() {
    let fx = fixture().await;
    fx.add_task(task("A", "alice", 100.0)).await;
    fx.engine.run_pass(RECONCILE_ONLY).await.unwrap();

    let stuck = fx.records(Stage::Translate).await[0].id.clone();
    fx.store.fail_updates_of(&stuck);

    let summary = fx.engine.run_pass(PassOptions::default()).await.unwrap();
    assert_eq!(summary.unmarked_record_ids, vec![stuck.clone()]);
    assert_eq!(summary.records_marked, 2);
    assert_eq!(fx.total("alice").await.unwrap().1, 100.0);
    assert_eq!(fx.pending(Stage::Translate).await.len(), 1);

    // The pending record is applied again once marking works
    fx.store.clear_faults();
    let retry = fx.engine.run_pass(PassOptions::default()).await.unwrap();
    assert_eq!(retry.pending_records, 1);
    assert_eq!(retry.records_marked, 1);
    assert_eq!(fx.total("alice").await.unwrap().1, 150.0);
}

#[tokio::test]
async fn test_total_write_failure_keeps_records_pending() {
    let fx = fixture().await;
    fx.add_task(task("A", "alice", 100.0)).await;
    fx.engine.run_pass(RECONCILE_ONLY).await.unwrap();

    let project = fx.project().await;
    fx.store.fail_creates_in(&project.totals_collection_id);

    let summary = fx.engine.run_pass(PassOptions::default()).await.unwrap();
    assert_eq!(summary.totals_created, 0);
    assert_eq!(summary.records_marked, 0);
    assert!(!summary.errors.is_empty());
    assert_eq!(fx.pending(Stage::Source).await.len(), 1);

    fx.store.clear_faults();
    fx.engine.run_pass(PassOptions::default()).await.unwrap();
    assert_eq!(fx.total("alice").await.unwrap().1, 100.0);
}

#[tokio::test]
async fn test_unreadable_source_collection_is_not_fatal() {
    let fx = fixture().await;
    fx.add_task(task("A", "alice", 100.0)).await;
    fx.store.fail_queries_of(&fx.source_id);

    let summary = fx.engine.run_pass(PassOptions::default()).await.unwrap();
    assert_eq!(summary.items_read, 0);
    assert_eq!(summary.source_collections_read, 0);
    assert_eq!(summary.errors.len(), 1);
}

#[tokio::test]
async fn test_guard_skips_total_updated_after_pass_start() {
    let fx = fixture().await;
    fx.add_task(task("A", "alice", 100.0)).await;
    fx.engine.run_pass(PassOptions::default()).await.unwrap();

    let row = fx.total_rows().await.remove(0);
    let mut patch = FieldMap::new();
    patch.insert(
        totals::LAST_UPDATE_TIME.into(),
        FieldValue::Date(Some(DateRange::at(chrono::Utc::now() + Duration::days(1)))),
    );
    fx.store.update_item(&row.id, patch).await.unwrap();

    fx.add_task(task("B", "alice", 40.0)).await;
    let summary = fx.engine.run_pass(PassOptions::default()).await.unwrap();

    assert_eq!(summary.totals_skipped_by_guard, 1);
    assert_eq!(summary.totals_updated, 0);
    assert_eq!(summary.records_marked, 0);
    assert_eq!(fx.total("alice").await.unwrap().1, 100.0);
    assert_eq!(fx.pending(Stage::Source).await.len(), 1);
}

#[tokio::test]
async fn test_null_total_value_is_reported_not_applied() {
    let fx = fixture().await;
    fx.add_task(task("A", "alice", 100.0)).await;
    fx.engine.run_pass(PassOptions::default()).await.unwrap();

    let row = fx.total_rows().await.remove(0);
    let mut patch = FieldMap::new();
    patch.insert(totals::POINTS.into(), FieldValue::Number(None));
    fx.store.update_item(&row.id, patch).await.unwrap();

    fx.add_task(task("B", "alice", 40.0)).await;
    let summary = fx.engine.run_pass(PassOptions::default()).await.unwrap();

    assert_eq!(summary.totals_updated, 0);
    assert!(summary.warnings.iter().any(|w| w.contains(totals::POINTS)));
    assert_eq!(fx.pending(Stage::Source).await.len(), 1);
}

#[tokio::test]
async fn test_fractional_total_count_is_reported_not_applied() {
    let fx = fixture().await;
    fx.add_task(task("A", "alice", 100.0)).await;
    fx.engine.run_pass(PassOptions::default()).await.unwrap();

    let row = fx.total_rows().await.remove(0);
    let mut patch = FieldMap::new();
    patch.insert(totals::SOURCE_COUNT.into(), FieldValue::Number(Some(1.5)));
    fx.store.update_item(&row.id, patch).await.unwrap();

    fx.add_task(task("B", "alice", 40.0)).await;
    let summary = fx.engine.run_pass(PassOptions::default()).await.unwrap();

    assert_eq!(summary.totals_updated, 0);
    assert!(summary.warnings.iter().any(|w| w.contains(totals::SOURCE_COUNT)));
    assert_eq!(fx.total("alice").await.unwrap().1, 100.0);
    assert_eq!(fx.pending(Stage::Source).await.len(), 1);
}

// ============================================================================
// Identity write-back policies
// ============================================================================

#[tokio::test]
async fn test_required_write_back_failure_skips_item() {
    let fx = fixture().await;
    let item_id = fx.add_task(task("A", "alice", 100.0)).await;
    fx.add_task(task("B", "bob", 10.0)).await;
    fx.store.fail_updates_of(&item_id);

    let summary = fx.engine.run_pass(PassOptions::default()).await.unwrap();

    assert_eq!(summary.records_created_total(), 3);
    assert!(fx.total("alice").await.is_none());
    assert!(fx.total("bob").await.is_some());
    assert!(summary
        .skipped
        .iter()
        .any(|s| s.item_id == item_id && s.stage.is_none()));
}

#[tokio::test]
async fn test_best_effort_write_back_uses_unpersisted_id() {
    let fx = fixture_with_settings(EngineSettings {
        identity_write_back: WriteBackPolicy::BestEffort,
        ..EngineSettings::default()
    })
    .await;
    let item_id = fx.add_task(task("A", "alice", 100.0)).await;
    fx.store.fail_updates_of(&item_id);

    let summary = fx.engine.run_pass(RECONCILE_ONLY).await.unwrap();
    assert_eq!(summary.ids_unpersisted, 1);
    assert_eq!(summary.records_created_total(), 3);

    // Known limitation: the next pass mints another id and records the task again
    let again = fx.engine.run_pass(RECONCILE_ONLY).await.unwrap();
    assert_eq!(again.records_created_total(), 3);
    assert_eq!(fx.records(Stage::Source).await.len(), 2);
}

#[tokio::test]
async fn test_transient_write_back_failure_is_retried() {
    let fx = fixture().await;
    fx.add_task(task("A", "alice", 100.0)).await;
    // Create the engine collections first so the id write-back is the only update
    fx.project().await;
    fx.store.fail_next(Operation::UpdateItem, 2);

    let summary = fx.engine.run_pass(RECONCILE_ONLY).await.unwrap();
    assert_eq!(summary.ids_minted, 1);
    assert_eq!(summary.ids_unpersisted, 0);
    assert_eq!(summary.records_created_total(), 3);
}

// ============================================================================
// Extraction edge cases
// ============================================================================

#[tokio::test]
async fn test_zero_points_default_policy_skips_every_stage() {
    let fx = fixture().await;
    fx.add_task(task("Free", "alice", 0.0)).await;

    let summary = fx.engine.run_pass(PassOptions::default()).await.unwrap();
    assert_eq!(summary.records_created_total(), 0);
    assert_eq!(summary.skipped.len(), 3);
    assert!(summary.skipped.iter().all(|s| s.reason.contains("zero")));
}

#[tokio::test]
async fn test_zero_points_accepted_when_configured() {
    let fx = fixture_with_settings(EngineSettings {
        zero_points: ZeroPointsPolicy::Accept,
        ..EngineSettings::default()
    })
    .await;
    fx.add_task(task("Free", "alice", 0.0)).await;

    let summary = fx.engine.run_pass(PassOptions::default()).await.unwrap();
    assert_eq!(summary.records_created_total(), 3);

    let (counts, points) = fx.total("alice").await.unwrap();
    assert_eq!(counts.total(), 3);
    assert_eq!(points, 0.0);
}

#[tokio::test]
async fn test_bot_contributor_is_not_credited() {
    let fx = fixture().await;
    let mut fields = task("A", "alice", 100.0);
    fields.insert(
        "Translator".into(),
        FieldValue::People(vec![PersonRef::bot("sync-bot", "Sync Bot")]),
    );
    fx.add_task(fields).await;

    let summary = fx.engine.run_pass(PassOptions::default()).await.unwrap();
    assert_eq!(fx.records(Stage::Translate).await.len(), 0);
    assert_eq!(summary.skipped.len(), 1);
    assert!(fx.total("sync-bot").await.is_none());
}

#[tokio::test]
async fn test_collection_missing_configured_field() {
    let fields: Vec<FieldSpec> = source_fields()
        .into_iter()
        .filter(|f| f.name != "Proofread Done")
        .collect();
    let fx = fixture_with(EngineSettings::default(), fields).await;
    let mut task_fields = task("A", "alice", 100.0);
    task_fields.remove("Proofread Done");
    fx.add_task(task_fields).await;

    let summary = fx.engine.run_pass(PassOptions::default()).await.unwrap();
    assert!(summary.warnings.iter().any(|w| w.contains("Proofread Done")));
    assert_eq!(fx.records(Stage::Proofread).await.len(), 0);
    assert_eq!(summary.records_created_total(), 2);
}

// ============================================================================
// Bounty records
// ============================================================================

#[tokio::test]
async fn test_bounty_records_are_aggregated_as_stored() {
    let fx = fixture().await;
    let project = fx.project().await;

    let mut fields = FieldMap::new();
    fields.insert(record::TASK_ID.into(), FieldValue::Title("bounty-1".into()));
    fields.insert(record::CONTRIBUTOR_ID.into(), FieldValue::Text("dave".into()));
    fields.insert(record::POINTS.into(), FieldValue::Number(Some(12.0)));
    fields.insert(record::AGGREGATED.into(), FieldValue::Checkbox(false));
    fx.store
        .create_item(project.record_collection(Stage::Bounty).unwrap(), fields)
        .await
        .unwrap();

    fx.engine.run_pass(PassOptions::default()).await.unwrap();

    let (counts, points) = fx.total("dave").await.unwrap();
    assert_eq!(counts.bounty, 1);
    assert_eq!(points, 12.0);
}

#[tokio::test]
async fn test_engine_collections_created_once() {
    let fx = fixture().await;
    fx.add_task(task("A", "alice", 1.0)).await;

    fx.engine.run_pass(PassOptions::default()).await.unwrap();
    let created = fx.store.calls(Operation::CreateCollection);
    fx.engine.run_pass(PassOptions::default()).await.unwrap();

    assert_eq!(fx.store.calls(Operation::CreateCollection), created);
    // Configuration + source + totals + four record collections
    assert_eq!(created, 7);

    let schema = fx
        .store
        .list_collection_fields(&fx.project().await.totals_collection_id)
        .await
        .unwrap();
    assert!(schema
        .iter()
        .any(|f| f.name == totals::LAST_UPDATE_TIME && f.kind == FieldKind::Date));
}
