//! Partitioned occurrence persistence: append, dedup, merge and index maintenance.

use std::collections::BTreeMap;

use async_trait::async_trait;
use biosync_core::{CanonicalRecord, GeometryKind, Partition};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, PgStoreConfig};

pub const CRATE_NAME: &str = "biosync-store";

/// Joins the members of an AGGREGATE value, merged natural keys included.
pub const MEMBER_SEPARATOR: &str = ", ";

/// Members of an aggregated value in order of appearance, empties skipped.
pub fn member_keys(text: &str) -> impl Iterator<Item = &str> {
    text.split(',').map(str::trim).filter(|token| !token.is_empty())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding geometry: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error("insert into {table} rejected: {reason}")]
    Rejected { table: String, reason: String },
}

/// Storage seam used by the orchestrator and the maintenance worker.
///
/// Operations over several partitions skip partitions whose table does not exist.
#[async_trait]
pub trait OccurrenceStore: Send + Sync {
    async fn ensure_partition(&self, partition: &Partition) -> Result<(), StoreError>;

    /// Append rows; returns the number inserted.
    async fn insert(&self, partition: &Partition, records: &[CanonicalRecord]) -> Result<u64, StoreError>;

    async fn drop_partitions(&self, partitions: &[Partition]) -> Result<(), StoreError>;

    /// Keep only the most recently loaded row per natural key. Returns rows removed.
    async fn remove_duplicates(&self, partitions: &[Partition]) -> Result<u64, StoreError>;

    /// Collapse rows sharing every GROUPBY column. Returns rows eliminated.
    async fn merge_similar_observations(&self, partitions: &[Partition]) -> Result<u64, StoreError>;

    async fn update_indexes(&self, partitions: &[Partition]) -> Result<(), StoreError>;

    async fn count_rows(&self, partitions: &[Partition]) -> Result<u64, StoreError>;

    async fn last_update(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn set_last_update(&self, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistOutcome {
    pub inserted: u64,
    /// Size of every sub-batch whose insert failed.
    pub failed: u64,
}

/// Route records to their region's partitions by geometry kind and insert each
/// kind's sub-batch independently.
pub async fn persist(store: &dyn OccurrenceStore, records: Vec<CanonicalRecord>, region: &str) -> PersistOutcome {
    let mut by_kind: BTreeMap<GeometryKind, Vec<CanonicalRecord>> = BTreeMap::new();
    for record in records {
        by_kind.entry(record.kind()).or_default().push(record);
    }

    let mut outcome = PersistOutcome::default();
    for (kind, batch) in by_kind {
        let partition = Partition::new(region, kind);
        let table = partition.table_name();
        let result = match store.ensure_partition(&partition).await {
            Ok(()) => store.insert(&partition, &batch).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(inserted) => {
                info!(table = %table, inserted, "sub-batch persisted");
                outcome.inserted += inserted;
            }
            Err(err) => {
                warn!(table = %table, rows = batch.len(), error = %err, "sub-batch insert failed");
                outcome.failed += batch.len() as u64;
            }
        }
    }
    outcome
}
