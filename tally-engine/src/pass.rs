//! Pass orchestration
//!
//! One pass = resolve project configuration, reconcile every source item
//! into the ledger, then aggregate pending records into totals. Passes are
//! serialised within a process; a second caller waits for the running pass.
//!
//! Only a configuration failure ends a pass early. Everything else lands in
//! the [`RunSummary`].

use crate::aggregator::{AggregationReport, Aggregator};
use crate::error::{EngineError, EngineResult};
use crate::extractor;
use crate::identity::{IdentityResolver, TaskIdentity};
use crate::ledger::{weigh, Ledger, LedgerOutcome};
use crate::locks::KeyedLocks;
use crate::models::{Stage, WorkItem};
use crate::project_config::{bootstrap_configuration, ConfigResolver, ProjectConfig};
use crate::source_reader::SourceReader;
use crate::store::RecordStore;
use crate::summary::RunSummary;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tally_common::config::{EngineSettings, TomlConfig};
use tally_common::time;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Which halves of a pass to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassOptions {
    pub reconcile: bool,
    pub aggregate: bool,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            reconcile: true,
            aggregate: true,
        }
    }
}

/// Per-item reconciliation outcome
#[derive(Debug, Default)]
struct ItemReport {
    minted: bool,
    unpersisted: bool,
    created: Vec<Stage>,
    existing: usize,
    skipped: Vec<(Option<String>, Option<Stage>, String)>,
}

pub struct Engine {
    store: Arc<dyn RecordStore>,
    settings: EngineSettings,
    parent_page_id: Option<String>,
    configuration_collection_id: Mutex<Option<String>>,
    locks: KeyedLocks,
    pass_lock: Mutex<()>,
}

impl Engine {
    pub fn new(store: Arc<dyn RecordStore>, config: &TomlConfig) -> Self {
        Self {
            store,
            settings: config.engine.clone(),
            parent_page_id: config.store.parent_page_id.clone().filter(|p| !p.trim().is_empty()),
            configuration_collection_id: Mutex::new(
                config
                    .store
                    .configuration_collection_id
                    .clone()
                    .filter(|c| !c.trim().is_empty()),
            ),
            locks: KeyedLocks::new(),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Configuration collection id, creating and seeding the collection on first use
    pub async fn configuration_collection_id(&self) -> EngineResult<String> {
        let mut slot = self.configuration_collection_id.lock().await;
        if let Some(id) = slot.as_ref() {
            return Ok(id.clone());
        }

        let parent = self.parent_page_id.as_deref().ok_or_else(|| {
            EngineError::Configuration(
                "neither [store] configuration_collection_id nor parent_page_id is set".to_string(),
            )
        })?;
        let id = bootstrap_configuration(self.store.as_ref(), parent).await?;
        *slot = Some(id.clone());
        Ok(id)
    }

    /// Resolve project configuration for a pass
    pub async fn project_config(&self) -> EngineResult<ProjectConfig> {
        let config_id = self.configuration_collection_id().await?;
        ConfigResolver::new(self.store.as_ref(), &config_id, self.parent_page_id.as_deref())
            .resolve(&self.settings)
            .await
    }

    /// Run one pass
    ///
    /// Returns `Err` only for fatal configuration problems.
    pub async fn run_pass(&self, options: PassOptions) -> EngineResult<RunSummary> {
        let _running = self.pass_lock.lock().await;
        let started = Instant::now();
        let now = time::now();

        let mut summary = RunSummary {
            started_at: Some(now),
            ..Default::default()
        };

        let project = self.project_config().await?;

        if options.reconcile {
            self.reconcile(&project, &mut summary).await;
        }

        if options.aggregate {
            let report = Aggregator::new(self.store.as_ref(), &project, &self.locks)
                .run(now)
                .await;
            merge_aggregation(&mut summary, report);
        }

        self.locks.prune();
        summary.duration_ms = started.elapsed().as_millis() as u64;
        summary.log();
        Ok(summary)
    }

    async fn reconcile(&self, project: &ProjectConfig, summary: &mut RunSummary) {
        let concurrency = project.settings.concurrency.max(1);
        let reader = SourceReader::new(self.store.as_ref(), &project.fields);

        if !project.bounty_sources.is_empty() {
            debug!(
                count = project.bounty_sources.len(),
                "Bounty source collections are not reconciled"
            );
        }

        let batches: Vec<_> = stream::iter(project.contribution_sources.iter())
            .map(|id| reader.read_collection(id))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut items: Vec<WorkItem> = Vec::new();
        for batch in batches {
            match batch {
                Ok(batch) => {
                    summary.source_collections_read += 1;
                    if !batch.missing_fields.is_empty() {
                        summary.note(&EngineError::InvariantViolation(format!(
                            "source collection {} has no field(s) {}",
                            batch.collection_id,
                            batch.missing_fields.join(", ")
                        )));
                    }
                    items.extend(batch.items);
                }
                Err(e) => {
                    warn!(error = %e, "Could not read source collection");
                    summary.note(&e);
                }
            }
        }
        summary.items_read = items.len();

        let identity = IdentityResolver::new(
            self.store.as_ref(),
            project.settings.identity_write_back,
            project.settings.write_back_max_wait_ms,
        );
        let ledger = Ledger::new(self.store.as_ref(), project, &self.locks);

        let reports: Vec<(String, ItemReport)> = stream::iter(items.iter())
            .map(|item| {
                let identity = &identity;
                let ledger = &ledger;
                async move {
                    let report = reconcile_item(item, identity, ledger, project).await;
                    (item.item_id.clone(), report)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (item_id, report) in reports {
            summary.ids_minted += usize::from(report.minted);
            summary.ids_unpersisted += usize::from(report.unpersisted);
            summary.records_existing += report.existing;
            for stage in report.created {
                summary.record_created(stage);
            }
            for (task_id, stage, reason) in report.skipped {
                summary.skip(&item_id, task_id.as_deref(), stage, reason);
            }
        }

        info!(
            items = summary.items_read,
            created = summary.records_created_total(),
            existing = summary.records_existing,
            skipped = summary.skipped.len(),
            "Reconciliation finished"
        );
    }
}

async fn reconcile_item(
    item: &WorkItem,
    identity: &IdentityResolver<'_>,
    ledger: &Ledger<'_>,
    project: &ProjectConfig,
) -> ItemReport {
    let mut report = ItemReport::default();

    let task_id = match identity.resolve(item).await {
        Ok(resolved) => {
            if let TaskIdentity::Minted { persisted, .. } = &resolved {
                report.minted = true;
                report.unpersisted = !persisted;
            }
            resolved.task_id().to_string()
        }
        Err(e) => {
            warn!(item_id = %item.item_id, error = %e, "No task id; skipping item");
            report.skipped.push((None, None, e.to_string()));
            return report;
        }
    };

    for stage in Stage::RECONCILED {
        let facts = match extractor::extract(item, &task_id, stage, project.settings.zero_points) {
            Ok(facts) => facts,
            Err(e) => {
                warn!(task_id = %task_id, stage = %stage, error = %e, "Stage not recorded");
                report.skipped.push((Some(task_id.clone()), Some(stage), e.to_string()));
                continue;
            }
        };

        let points = weigh(facts.raw_points, project.ratios.ratio(stage));
        match ledger
            .ensure_record(&task_id, &item.source_collection_id, stage, &facts, points)
            .await
        {
            Ok(LedgerOutcome::Created(_)) => report.created.push(stage),
            Ok(LedgerOutcome::AlreadyExists) => report.existing += 1,
            Err(e) => {
                warn!(task_id = %task_id, stage = %stage, error = %e, "Could not write record");
                report.skipped.push((Some(task_id.clone()), Some(stage), e.to_string()));
            }
        }
    }

    report
}

fn merge_aggregation(summary: &mut RunSummary, report: AggregationReport) {
    summary.pending_records = report.pending_records;
    summary.totals_created = report.totals_created;
    summary.totals_updated = report.totals_updated;
    summary.totals_skipped_by_guard = report.totals_skipped_by_guard;
    summary.records_marked = report.records_marked;
    summary.updated_contributor_ids = report.updated_contributor_ids;
    summary.unmarked_record_ids = report.unmarked_record_ids;
    for err in &report.errors {
        summary.note(err);
    }
}
