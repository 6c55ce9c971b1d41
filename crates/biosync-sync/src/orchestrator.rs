//! Region-by-region synchronization run.

use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use biosync_core::{Partition, ReferenceTables};
use biosync_fetch::Fetcher;
use biosync_store::{persist, OccurrenceStore};
use biosync_transform::TransformPipeline;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{RegionConfig, SyncMode};
use crate::maintenance::{MaintenanceHandle, MaintenanceResult, MaintenanceScheduler};

/// Ingestion counters for one region or a whole run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    /// Records received from the warehouse.
    pub processed: u64,
    pub inserted: u64,
    /// Records lost to exhausted page retries or failed inserts.
    pub failed: u64,
    pub geometries_repaired: u64,
    pub collections_converted: u64,
    pub dropped: u64,
    pub pages_fetched: u64,
    pub failed_pages: u64,
    pub failed_batches: u64,
    /// Regions whose record count could not be read.
    pub skipped_regions: u64,
}

impl RunCounters {
    /// Nothing was lost or skipped, so the run may advance the last-update time.
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && self.failed_pages == 0 && self.failed_batches == 0 && self.skipped_regions == 0
    }
}

impl AddAssign for RunCounters {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.inserted += other.inserted;
        self.failed += other.failed;
        self.geometries_repaired += other.geometries_repaired;
        self.collections_converted += other.collections_converted;
        self.dropped += other.dropped;
        self.pages_fetched += other.pages_fetched;
        self.failed_pages += other.failed_pages;
        self.failed_batches += other.failed_batches;
        self.skipped_regions += other.skipped_regions;
    }
}

pub struct RegionOutcome {
    pub region: String,
    pub counters: RunCounters,
    pub maintenance: MaintenanceHandle,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionReport {
    pub region: String,
    #[serde(flatten)]
    pub counters: RunCounters,
    pub maintenance: MaintenanceResult,
}

/// Everything a run reports, as plain data.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: u64,
    pub inserted: u64,
    pub failed: u64,
    pub geometries_repaired: u64,
    pub collections_converted: u64,
    pub dropped: u64,
    pub failed_pages: u64,
    pub failed_batches: u64,
    pub skipped_regions: u64,
    pub duplicates_removed: u64,
    pub merged: u64,
    pub total_rows: u64,
    pub tables: Vec<String>,
    pub last_update: Option<DateTime<Utc>>,
    pub regions: Vec<RegionReport>,
    pub reports_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub mode: SyncMode,
    pub batch_pages: u32,
    pub parallel: bool,
    /// Where `reports/<run_id>/` is written; `None` skips report files.
    pub workspace_root: Option<PathBuf>,
}

pub struct Orchestrator {
    settings: RunSettings,
    regions: Vec<RegionConfig>,
    references: Arc<ReferenceTables>,
    fetcher: Fetcher,
    pipeline: TransformPipeline,
    store: Arc<dyn OccurrenceStore>,
}

impl Orchestrator {
    pub fn new(
        settings: RunSettings,
        regions: Vec<RegionConfig>,
        references: Arc<ReferenceTables>,
        fetcher: Fetcher,
        pipeline: TransformPipeline,
        store: Arc<dyn OccurrenceStore>,
    ) -> Self {
        Self {
            settings,
            regions,
            references,
            fetcher,
            pipeline,
            store,
        }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let previous_update = self.store.last_update().await.context("reading last update time")?;
        info!(%run_id, mode = %self.settings.mode, ?previous_update, "sync run started");

        let maintenance = MaintenanceScheduler::start(Arc::clone(&self.store));
        let mut pending: Vec<(RegionReport, MaintenanceHandle)> = Vec::new();
        for region in self.regions.iter().filter(|r| r.enabled) {
            let span = info_span!("region", region = %region.name);
            match self
                .sync_region(region, previous_update, &maintenance)
                .instrument(span)
                .await
            {
                Ok(outcome) => {
                    let report = RegionReport {
                        region: outcome.region,
                        counters: outcome.counters,
                        maintenance: MaintenanceResult::default(),
                    };
                    pending.push((report, outcome.maintenance));
                }
                Err(err) => {
                    maintenance.shutdown().await;
                    return Err(err);
                }
            }
        }

        let mut totals = RunCounters::default();
        let mut maintained = MaintenanceResult::default();
        let mut regions = Vec::with_capacity(pending.len());
        for (mut report, handle) in pending {
            report.maintenance = handle.join().await;
            totals += report.counters;
            maintained += report.maintenance;
            regions.push(report);
        }
        maintenance.shutdown().await;

        let partitions = regions
            .iter()
            .flat_map(|r| Partition::all_for_region(&r.region))
            .collect::<Vec<_>>();
        let total_rows = self
            .store
            .count_rows(&partitions)
            .await
            .context("counting partition rows")?;

        let last_update = match self.settings.mode {
            SyncMode::Full | SyncMode::Incremental if totals.is_complete() => {
                self.store
                    .set_last_update(started_at)
                    .await
                    .context("storing last update time")?;
                Some(started_at)
            }
            SyncMode::Full | SyncMode::Incremental => {
                warn!(
                    failed = totals.failed,
                    failed_pages = totals.failed_pages,
                    failed_batches = totals.failed_batches,
                    skipped_regions = totals.skipped_regions,
                    "run incomplete; last update time left unchanged"
                );
                previous_update
            }
            SyncMode::Pages(_) => previous_update,
        };

        let mut summary = RunSummary {
            run_id,
            mode: self.settings.mode.to_string(),
            started_at,
            finished_at: Utc::now(),
            processed: totals.processed,
            inserted: totals.inserted,
            failed: totals.failed,
            geometries_repaired: totals.geometries_repaired,
            collections_converted: totals.collections_converted,
            dropped: totals.dropped,
            failed_pages: totals.failed_pages,
            failed_batches: totals.failed_batches,
            skipped_regions: totals.skipped_regions,
            duplicates_removed: maintained.duplicates_removed,
            merged: maintained.merged,
            total_rows,
            tables: partitions.iter().map(Partition::table_name).collect(),
            last_update,
            regions,
            reports_dir: None,
        };
        if let Some(root) = &self.settings.workspace_root {
            let dir = write_reports(root, &summary).await?;
            summary.reports_dir = Some(dir.display().to_string());
        }

        info!(
            %run_id,
            processed = summary.processed,
            failed = summary.failed,
            repaired = summary.geometries_repaired,
            converted = summary.collections_converted,
            duplicates_removed = summary.duplicates_removed,
            merged = summary.merged,
            total_rows = summary.total_rows,
            "sync run finished"
        );
        Ok(summary)
    }

    /// Ingest one region in sequential batches and queue its maintenance.
    pub async fn sync_region(
        &self,
        region: &RegionConfig,
        previous_update: Option<DateTime<Utc>>,
        scheduler: &MaintenanceScheduler,
    ) -> Result<RegionOutcome> {
        let partitions = Partition::all_for_region(&region.name);
        let mut query = region.query(&self.references.value_ranges);
        if let (SyncMode::Incremental, Some(since)) = (self.settings.mode, previous_update) {
            query = query.loaded_since(since);
        }

        let mut counters = RunCounters::default();
        let last_page = match self.settings.mode {
            SyncMode::Pages(n) => n,
            _ => match self.fetcher.last_page(&query).await {
                Ok(pages) => pages,
                Err(err) => {
                    error!(error = %err, "could not count records; region skipped");
                    counters.skipped_regions += 1;
                    return Ok(RegionOutcome {
                        region: region.name.clone(),
                        counters,
                        maintenance: scheduler.enqueue(&region.name, partitions),
                    });
                }
            },
        };
        if self.settings.mode == SyncMode::Full {
            self.store
                .drop_partitions(&partitions)
                .await
                .with_context(|| format!("dropping partitions of {}", region.name))?;
        }
        info!(last_page, "region query planned");

        let batch = self.settings.batch_pages.max(1);
        let mut start = 1;
        while start <= last_page {
            let end = start.saturating_add(batch - 1).min(last_page);
            let range = match self
                .fetcher
                .fetch_range(&query, start, end, self.settings.parallel)
                .await
            {
                Ok(range) => range,
                Err(err) => {
                    warn!(start, end, error = %err, "batch query failed; continuing with next batch");
                    counters.failed_batches += 1;
                    start = end.saturating_add(1);
                    continue;
                }
            };
            counters.processed += range.records.len() as u64;
            counters.pages_fetched += u64::from(range.pages_fetched);
            counters.failed_pages += u64::from(range.failed_pages);
            counters.failed += range.failed_count;

            let output = self.pipeline.run(range.records);
            counters.geometries_repaired += output.geometries_repaired;
            counters.collections_converted += output.collections_converted;
            counters.dropped += output.dropped;

            let persisted = persist(self.store.as_ref(), output.records, &region.name).await;
            counters.inserted += persisted.inserted;
            counters.failed += persisted.failed;
            info!(start, end, inserted = persisted.inserted, failed = persisted.failed, "batch persisted");

            if end == u32::MAX {
                break;
            }
            start = end + 1;
        }

        let maintenance = scheduler.enqueue(&region.name, partitions);
        Ok(RegionOutcome {
            region: region.name.clone(),
            counters,
            maintenance,
        })
    }
}

/// Write `summary.json` and a short `summary.md` under `reports/<run_id>/`.
pub async fn write_reports(workspace_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = workspace_root.join("reports").join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;

    let brief = format!(
        "# biosync run {}\n\n- Mode: {}\n- Started: {}\n- Finished: {}\n- Processed: {}\n- Failed: {}\n- Geometries repaired: {}\n- Collections converted: {}\n- Duplicates removed: {}\n- Merged: {}\n- Total rows: {}\n\n## Regions\n{}\n",
        summary.run_id,
        summary.mode,
        summary.started_at,
        summary.finished_at,
        summary.processed,
        summary.failed,
        summary.geometries_repaired,
        summary.collections_converted,
        summary.duplicates_removed,
        summary.merged,
        summary.total_rows,
        summary
            .regions
            .iter()
            .map(|r| format!("- {}: {} processed, {} inserted", r.region, r.counters.processed, r.counters.inserted))
            .collect::<Vec<_>>()
            .join("\n")
    );
    fs::write(reports_dir.join("summary.md"), brief)
        .await
        .context("writing summary.md")?;

    Ok(reports_dir)
}
