//! Sync orchestration: configuration, region runs, background maintenance, scheduling.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use biosync_core::{ReferenceTables, SchemaDescriptor};
use biosync_fetch::{Fetcher, HttpFetcher, HttpPageSource, ReferenceClient};
use biosync_store::{OccurrenceStore, PgStore};
use biosync_transform::{load_area_polygons, TransformPipeline};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub mod config;
pub mod maintenance;
pub mod orchestrator;

pub use config::{RegionConfig, RegionRegistry, SyncConfig, SyncMode};
pub use maintenance::{MaintenanceHandle, MaintenanceResult, MaintenanceScheduler};
pub use orchestrator::{write_reports, Orchestrator, RegionOutcome, RegionReport, RunCounters, RunSettings, RunSummary};

pub const CRATE_NAME: &str = "biosync-sync";

/// Receives top-level run failures.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify(&self, error: &anyhow::Error);
}

#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl FailureNotifier for LogNotifier {
    async fn notify(&self, error: &anyhow::Error) {
        error!(error = %format!("{error:#}"), "sync run failed");
    }
}

impl RunSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            mode: config.mode,
            batch_pages: config.batch_pages,
            parallel: config.parallel_fetch,
            workspace_root: Some(config.workspace_root.clone()),
        }
    }
}

/// Fetch the network dictionaries and read the area polygons, once per run.
pub async fn load_references(config: &SyncConfig, http: Arc<HttpFetcher>) -> Result<ReferenceTables> {
    let client = ReferenceClient::new(http, &config.api_url, &config.access_token, config.retry_policy());
    let value_ranges = client.value_ranges().await.context("loading value ranges")?;
    let collections = client.collection_names().await.context("loading collection names")?;
    let taxonomy = client.taxonomy().await.context("loading informal taxon groups")?;

    let areas_path = config.areas_path();
    let areas = load_area_polygons(&areas_path).with_context(|| format!("loading {}", areas_path.display()))?;
    info!(
        value_ranges = value_ranges.len(),
        collections = collections.len(),
        taxon_groups = taxonomy.len(),
        areas = areas.len(),
        "reference tables loaded"
    );
    Ok(ReferenceTables {
        value_ranges,
        collections,
        taxonomy,
        areas,
        areas_crs: config.areas_crs,
    })
}

/// Assemble an orchestrator against the live warehouse and PostGIS store.
pub async fn build_orchestrator(config: &SyncConfig) -> Result<Orchestrator> {
    let schema_path = config.schema_path();
    let descriptor = Arc::new(
        SchemaDescriptor::from_path(&schema_path).with_context(|| format!("loading {}", schema_path.display()))?,
    );
    let registry = RegionRegistry::load(&config.regions_path()).await?;

    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let references = Arc::new(load_references(config, Arc::clone(&http)).await?);

    let store: Arc<dyn OccurrenceStore> = Arc::new(
        PgStore::connect(&config.database_url, Arc::clone(&descriptor), config.store_config())
            .await
            .context("connecting to the occurrence store")?,
    );

    let source = HttpPageSource::new(http, &config.api_url, &config.access_token, config.crs);
    let fetcher = Fetcher::new(Arc::new(source), config.fetch_settings());
    let pipeline = TransformPipeline::new(descriptor, Arc::clone(&references), config.transform_config())
        .context("building transform pipeline")?;

    Ok(Orchestrator::new(
        RunSettings::from_config(config),
        registry.regions,
        references,
        fetcher,
        pipeline,
        store,
    ))
}

/// Run once, handing a failure to `notifier` before returning it.
pub async fn run_sync_once(config: &SyncConfig, notifier: &dyn FailureNotifier) -> Result<RunSummary> {
    let result = match build_orchestrator(config).await {
        Ok(orchestrator) => orchestrator.run().await,
        Err(err) => Err(err),
    };
    if let Err(err) = &result {
        notifier.notify(err).await;
    }
    result
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    run_sync_once(&SyncConfig::from_env(), &LogNotifier).await
}

/// Cron-driven runs. A trigger that fires while a run is still going is skipped.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));
    let job_config = config.clone();
    let cron = config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let running = Arc::clone(&running);
        let config = job_config.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous sync run still in progress; trigger skipped");
                return;
            };
            match run_sync_once(&config, &LogNotifier).await {
                Ok(summary) => info!(run_id = %summary.run_id, total_rows = summary.total_rows, "scheduled sync finished"),
                Err(_) => warn!("scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn scheduler_is_off_unless_enabled() {
        let config = SyncConfig::from_lookup(|_| None);
        assert!(maybe_build_scheduler(&config).await.expect("scheduler").is_none());
    }

    #[tokio::test]
    async fn startup_failures_reach_the_notifier() {
        struct Counting(std::sync::Mutex<Vec<String>>);

        #[async_trait]
        impl FailureNotifier for Counting {
            async fn notify(&self, error: &anyhow::Error) {
                self.0.lock().unwrap().push(format!("{error:#}"));
            }
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().display().to_string();
        let env = HashMap::from([("BIOSYNC_WORKSPACE_ROOT", root)]);
        let config = SyncConfig::from_lookup(|k| env.get(k).cloned());
        let notifier = Counting(std::sync::Mutex::new(Vec::new()));

        let result = run_sync_once(&config, &notifier).await;
        assert!(result.is_err());
        let messages = notifier.0.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("schema.csv"));
    }
}
