//! Background dedup, merge and reindex, one region at a time.

use std::ops::AddAssign;
use std::sync::Arc;

use biosync_core::Partition;
use biosync_store::{OccurrenceStore, StoreError};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MaintenanceResult {
    pub duplicates_removed: u64,
    pub merged: u64,
}

impl AddAssign for MaintenanceResult {
    fn add_assign(&mut self, other: Self) {
        self.duplicates_removed += other.duplicates_removed;
        self.merged += other.merged;
    }
}

struct Job {
    region: String,
    partitions: Vec<Partition>,
    reply: oneshot::Sender<MaintenanceResult>,
}

/// Result of one enqueued job. Joining never fails; a lost job reads as zero.
#[derive(Debug)]
pub struct MaintenanceHandle {
    region: String,
    receiver: oneshot::Receiver<MaintenanceResult>,
}

impl MaintenanceHandle {
    pub fn region(&self) -> &str {
        &self.region
    }

    pub async fn join(self) -> MaintenanceResult {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => {
                warn!(region = %self.region, "maintenance job dropped before completing");
                MaintenanceResult::default()
            }
        }
    }
}

pub struct MaintenanceScheduler {
    sender: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

impl MaintenanceScheduler {
    /// Spawn the single worker. Jobs run strictly in the order they are enqueued.
    pub fn start(store: Arc<dyn OccurrenceStore>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let span = info_span!("maintenance", region = %job.region);
                let result = run_job(store.as_ref(), &job.partitions)
                    .instrument(span)
                    .await
                    .unwrap_or_else(|err| {
                        warn!(region = %job.region, error = %err, "maintenance job failed");
                        MaintenanceResult::default()
                    });
                let _ = job.reply.send(result);
            }
        });
        Self { sender, worker }
    }

    /// Queue a region's partitions and return immediately.
    pub fn enqueue(&self, region: &str, partitions: Vec<Partition>) -> MaintenanceHandle {
        let (reply, receiver) = oneshot::channel();
        let job = Job {
            region: region.to_string(),
            partitions,
            reply,
        };
        if self.sender.send(job).is_err() {
            warn!(region, "maintenance worker is gone; job not queued");
        }
        MaintenanceHandle {
            region: region.to_string(),
            receiver,
        }
    }

    /// Stop accepting jobs and wait for the queued ones to finish.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(err) = self.worker.await {
            warn!(error = %err, "maintenance worker panicked");
        }
    }
}

async fn run_job(store: &dyn OccurrenceStore, partitions: &[Partition]) -> Result<MaintenanceResult, StoreError> {
    let duplicates_removed = store.remove_duplicates(partitions).await?;
    let merged = store.merge_similar_observations(partitions).await?;
    store.update_indexes(partitions).await?;
    info!(duplicates_removed, merged, "maintenance finished");
    Ok(MaintenanceResult {
        duplicates_removed,
        merged,
    })
}
