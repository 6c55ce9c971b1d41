//! In-process store with the same dedup and merge semantics as [`crate::PgStore`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use biosync_core::{CanonicalRecord, MergeStrategy, Partition, SchemaDescriptor, Value};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{member_keys, OccurrenceStore, StoreError, MEMBER_SEPARATOR};

#[derive(Debug, Clone)]
struct StoredRow {
    row_id: u64,
    record: CanonicalRecord,
}

pub struct MemoryStore {
    descriptor: Arc<SchemaDescriptor>,
    tables: Mutex<BTreeMap<String, Vec<StoredRow>>>,
    rejecting: Mutex<HashSet<String>>,
    last_update: Mutex<Option<DateTime<Utc>>>,
    next_row_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new(descriptor: Arc<SchemaDescriptor>) -> Self {
        Self {
            descriptor,
            tables: Mutex::new(BTreeMap::new()),
            rejecting: Mutex::new(HashSet::new()),
            last_update: Mutex::new(None),
            next_row_id: AtomicU64::new(1),
        }
    }

    /// Make every later insert into `partition` fail.
    pub fn reject_inserts_into(&self, partition: &Partition) {
        lock(&self.rejecting).insert(partition.table_name());
    }

    /// Snapshot of a partition's rows in insertion order.
    pub fn rows(&self, partition: &Partition) -> Vec<CanonicalRecord> {
        lock(&self.tables)
            .get(&partition.table_name())
            .map(|rows| rows.iter().map(|r| r.record.clone()).collect())
            .unwrap_or_default()
    }

    pub fn table_names(&self) -> Vec<String> {
        lock(&self.tables).keys().cloned().collect()
    }

    fn load_value<'r>(&self, record: &'r CanonicalRecord) -> &'r Value {
        record.attribute(&self.descriptor.roles().load_timestamp)
    }

    /// True when `candidate` outranks `current`: later load first, nulls last,
    /// then more merged members, then the higher row id.
    fn outranks(&self, candidate: &StoredRow, candidate_members: usize, current: &StoredRow, current_members: usize) -> bool {
        let a = self.load_value(&candidate.record);
        let b = self.load_value(&current.record);
        match (a.is_null(), b.is_null()) {
            (false, true) => return true,
            (true, false) => return false,
            _ => {}
        }
        match a.compare(b) {
            Some(Ordering::Greater) => return true,
            Some(Ordering::Less) => return false,
            _ => {}
        }
        match candidate_members.cmp(&current_members) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => candidate.row_id > current.row_id,
        }
    }

    fn merge_group(&self, members: Vec<StoredRow>) -> Result<CanonicalRecord, StoreError> {
        let roles = self.descriptor.roles();
        let mut attributes = BTreeMap::new();
        for column in self.descriptor.columns() {
            let values = members
                .iter()
                .map(|m| m.record.attribute(&column.canonical))
                .collect::<Vec<_>>();
            let merged = if column.canonical == roles.merge_count {
                Value::Int(values.iter().map(|v| v.as_i64().unwrap_or(1)).sum())
            } else {
                merge_values(column.merge, &values)
            };
            attributes.insert(column.canonical.clone(), merged);
        }

        let first = &members[0].record;
        let natural_key = attributes
            .get(&roles.natural_key)
            .and_then(Value::as_text)
            .unwrap_or_else(|| first.natural_key().to_string());
        let local_key = attributes
            .get(&roles.local_key)
            .and_then(Value::as_text)
            .unwrap_or_else(|| first.local_key().to_string());
        CanonicalRecord::new(natural_key, local_key, attributes, first.geometry().clone()).map_err(|err| {
            StoreError::Rejected {
                table: "merge".to_string(),
                reason: err.to_string(),
            }
        })
    }
}

fn merge_values(strategy: MergeStrategy, values: &[&Value]) -> Value {
    match strategy {
        MergeStrategy::GroupBy | MergeStrategy::First => values.first().map(|v| (*v).clone()).unwrap_or_default(),
        MergeStrategy::Aggregate => {
            let texts = values.iter().filter_map(|v| v.as_text()).collect::<Vec<_>>();
            let mut seen = HashSet::new();
            let distinct = texts
                .iter()
                .flat_map(|text| member_keys(text))
                .filter(|token| seen.insert(*token))
                .collect::<Vec<_>>();
            if distinct.is_empty() {
                Value::Null
            } else {
                Value::Str(distinct.join(MEMBER_SEPARATOR))
            }
        }
        MergeStrategy::Sum => {
            let present = values.iter().filter_map(|v| v.as_i64()).collect::<Vec<_>>();
            if present.is_empty() {
                Value::Null
            } else {
                Value::Int(present.iter().sum())
            }
        }
        MergeStrategy::Max => values
            .iter()
            .filter(|v| !v.is_null())
            .fold(None::<&Value>, |best, v| match best {
                Some(b) if b.compare(v) != Some(Ordering::Less) => Some(b),
                _ => Some(*v),
            })
            .cloned()
            .unwrap_or_default(),
    }
}

#[async_trait]
impl OccurrenceStore for MemoryStore {
    async fn ensure_partition(&self, partition: &Partition) -> Result<(), StoreError> {
        lock(&self.tables).entry(partition.table_name()).or_default();
        Ok(())
    }

    async fn insert(&self, partition: &Partition, records: &[CanonicalRecord]) -> Result<u64, StoreError> {
        let table = partition.table_name();
        if lock(&self.rejecting).contains(&table) {
            return Err(StoreError::Rejected {
                table,
                reason: "configured to reject inserts".to_string(),
            });
        }
        let mut tables = lock(&self.tables);
        let rows = tables
            .get_mut(&table)
            .ok_or_else(|| StoreError::MissingTable(table.clone()))?;
        for record in records {
            rows.push(StoredRow {
                row_id: self.next_row_id.fetch_add(1, AtomicOrdering::Relaxed),
                record: record.clone(),
            });
        }
        Ok(records.len() as u64)
    }

    async fn drop_partitions(&self, partitions: &[Partition]) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables);
        for partition in partitions {
            tables.remove(&partition.table_name());
        }
        Ok(())
    }

    async fn remove_duplicates(&self, partitions: &[Partition]) -> Result<u64, StoreError> {
        let mut tables = lock(&self.tables);
        let mut removed = 0;
        for partition in partitions {
            let Some(rows) = tables.get_mut(&partition.table_name()) else {
                continue;
            };
            let members = rows
                .iter()
                .map(|row| member_keys(row.record.natural_key()).collect::<BTreeSet<_>>())
                .collect::<Vec<_>>();
            let mut holders: HashMap<&str, Vec<usize>> = HashMap::new();
            for (index, keys) in members.iter().enumerate() {
                for key in keys {
                    holders.entry(*key).or_default().push(index);
                }
            }

            // a row goes when another row holds all of its members and outranks it
            let covered = members
                .iter()
                .enumerate()
                .map(|(index, keys)| {
                    let Some(first) = keys.iter().next() else {
                        return false;
                    };
                    holders[first].iter().any(|&other| {
                        other != index
                            && members[other].is_superset(keys)
                            && self.outranks(&rows[other], members[other].len(), &rows[index], keys.len())
                    })
                })
                .collect::<Vec<_>>();
            drop(holders);
            drop(members);

            let before = rows.len();
            let mut index = 0;
            rows.retain(|_| {
                let kept = !covered[index];
                index += 1;
                kept
            });
            removed += (before - rows.len()) as u64;
        }
        debug!(removed, "duplicates removed");
        Ok(removed)
    }

    async fn merge_similar_observations(&self, partitions: &[Partition]) -> Result<u64, StoreError> {
        let group_columns = self
            .descriptor
            .with_merge(MergeStrategy::GroupBy)
            .map(|c| c.canonical.clone())
            .collect::<Vec<_>>();
        let mut tables = lock(&self.tables);
        let mut eliminated = 0;
        for partition in partitions {
            let Some(rows) = tables.get_mut(&partition.table_name()) else {
                continue;
            };
            let before = rows.len();
            let mut order = Vec::new();
            let mut groups: HashMap<String, Vec<StoredRow>> = HashMap::new();
            for row in rows.drain(..) {
                let key = group_columns
                    .iter()
                    .map(|c| row.record.attribute(c).group_key())
                    .collect::<Vec<_>>()
                    .join("\u{1f}");
                if !groups.contains_key(&key) {
                    order.push(key.clone());
                }
                groups.entry(key).or_default().push(row);
            }

            let mut merged = Vec::with_capacity(order.len());
            for key in order {
                let Some(members) = groups.remove(&key) else {
                    continue;
                };
                let row_id = members[0].row_id;
                let record = self.merge_group(members)?;
                merged.push(StoredRow { row_id, record });
            }
            eliminated += (before - merged.len()) as u64;
            *rows = merged;
        }
        debug!(eliminated, "similar observations merged");
        Ok(eliminated)
    }

    async fn update_indexes(&self, _partitions: &[Partition]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn count_rows(&self, partitions: &[Partition]) -> Result<u64, StoreError> {
        let tables = lock(&self.tables);
        Ok(partitions
            .iter()
            .filter_map(|p| tables.get(&p.table_name()))
            .map(|rows| rows.len() as u64)
            .sum())
    }

    async fn last_update(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(*lock(&self.last_update))
    }

    async fn set_last_update(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        *lock(&self.last_update) = Some(at);
        Ok(())
    }
}
