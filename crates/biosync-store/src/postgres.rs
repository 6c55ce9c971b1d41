//! PostGIS-backed store. One table per region and geometry kind, plus a
//! single-row table holding the last successful update time.

use std::sync::Arc;

use async_trait::async_trait;
use biosync_core::{CanonicalRecord, ColumnType, MergeStrategy, Partition, SchemaDescriptor, Value};
use chrono::{DateTime, Utc};
use geo::Geometry;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::{OccurrenceStore, StoreError};

const MAX_BIND_PARAMS: usize = 65_535;
const LAST_UPDATE_TABLE: &str = "biosync_last_update";

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub schema: String,
    pub srid: u32,
    pub max_connections: u32,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            srid: 3067,
            max_connections: 5,
        }
    }
}

pub struct PgStore {
    pool: PgPool,
    descriptor: Arc<SchemaDescriptor>,
    config: PgStoreConfig,
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::String => "TEXT",
        ColumnType::Integer => "BIGINT",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Date => "DATE",
    }
}

pub(crate) fn create_table_sql(qualified: &str, descriptor: &SchemaDescriptor, srid: u32) -> String {
    let mut columns = vec!["row_id BIGSERIAL".to_string()];
    columns.extend(
        descriptor
            .columns()
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.canonical), sql_type(c.column_type))),
    );
    columns.push(format!("geom geometry(Geometry, {srid})"));
    format!("CREATE TABLE IF NOT EXISTS {qualified} ({})", columns.join(", "))
}

pub(crate) fn column_list(descriptor: &SchemaDescriptor) -> String {
    descriptor
        .columns()
        .iter()
        .map(|c| quote_ident(&c.canonical))
        .chain(std::iter::once("geom".to_string()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Member keys of a row: its natural key split on the aggregate separator.
fn member_keys_sql(column: &str) -> String {
    format!(r"array_remove(regexp_split_to_array({column}, '\s*,\s*'), '')")
}

/// A row is removed when another row carries all of its member keys and ranks
/// higher: later load (nulls last), then more members, then the higher row id.
pub(crate) fn dedup_sql(qualified: &str, natural_key: &str, load_timestamp: &str) -> String {
    format!(
        r#"
        WITH members AS (
            SELECT row_id, {load} AS loaded, {keys} AS keys
              FROM {qualified}
        ),
        tokens AS (
            SELECT row_id, unnest(keys) AS token FROM members
        ),
        pairs AS (
            SELECT DISTINCT a.row_id AS covered, b.row_id AS covering
              FROM tokens a
              JOIN tokens b ON a.token = b.token AND a.row_id <> b.row_id
        )
        DELETE FROM {qualified} t
         USING pairs p, members a, members b
         WHERE t.row_id = p.covered
           AND a.row_id = p.covered
           AND b.row_id = p.covering
           AND b.keys @> a.keys
           AND (
                (b.loaded IS NOT NULL AND a.loaded IS NULL)
             OR b.loaded > a.loaded
             OR (b.loaded IS NOT DISTINCT FROM a.loaded
                 AND (cardinality(b.keys) > cardinality(a.keys)
                      OR (cardinality(b.keys) = cardinality(a.keys) AND b.row_id > a.row_id)))
           )
        "#,
        keys = member_keys_sql(&quote_ident(natural_key)),
        load = quote_ident(load_timestamp),
    )
}

pub(crate) fn merge_select_sql(qualified: &str, descriptor: &SchemaDescriptor) -> String {
    let merge_count = &descriptor.roles().merge_count;
    let mut select = Vec::new();
    let mut group_by = Vec::new();
    for column in descriptor.columns() {
        let c = quote_ident(&column.canonical);
        let expr = if &column.canonical == merge_count {
            format!("SUM(COALESCE({c}, 1))::bigint")
        } else {
            match column.merge {
                MergeStrategy::GroupBy => {
                    group_by.push(c.clone());
                    c.clone()
                }
                MergeStrategy::First => format!("(array_agg({c} ORDER BY row_id))[1]"),
                MergeStrategy::Aggregate => format!(
                    "NULLIF(array_to_string(ARRAY(SELECT u.token FROM unnest({}) WITH ORDINALITY AS u(token, n) \
                     GROUP BY u.token ORDER BY min(u.n)), ', '), '')",
                    member_keys_sql(&format!("string_agg({c}::text, ', ' ORDER BY row_id)"))
                ),
                MergeStrategy::Sum => format!("SUM({c})::bigint"),
                MergeStrategy::Max => format!("MAX({c})"),
            }
        };
        select.push(expr);
    }
    select.push("(array_agg(geom ORDER BY row_id))[1]".to_string());
    format!(
        "SELECT {} FROM {qualified} GROUP BY {} ORDER BY MIN(row_id)",
        select.join(", "),
        group_by.join(", ")
    )
}

fn geometry_json(geometry: &Geometry<f64>) -> Result<String, StoreError> {
    let geometry = geojson::Geometry::new(geojson::Value::from(geometry));
    Ok(serde_json::to_string(&geometry)?)
}

fn push_typed<'args>(
    row: &mut sqlx::query_builder::Separated<'_, 'args, Postgres, &'static str>,
    value: &Value,
    column_type: ColumnType,
) {
    match column_type {
        ColumnType::String => {
            row.push_bind(value.as_text());
        }
        ColumnType::Integer => {
            row.push_bind(value.as_i64());
        }
        ColumnType::Boolean => {
            row.push_bind(match value {
                Value::Bool(b) => Some(*b),
                _ => None,
            });
        }
        ColumnType::Date => {
            row.push_bind(match value {
                Value::Date(d) => Some(*d),
                _ => None,
            });
        }
    }
}

impl PgStore {
    pub async fn connect(
        database_url: &str,
        descriptor: Arc<SchemaDescriptor>,
        config: PgStoreConfig,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(database_url)
            .await?;
        let store = Self {
            pool,
            descriptor,
            config,
        };
        store.prepare().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn prepare(&self) -> Result<(), StoreError> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS postgis")
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&self.config.schema)
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id SMALLINT PRIMARY KEY CHECK (id = 1),
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            self.qualified(LAST_UPDATE_TABLE)
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.config.schema), quote_ident(table))
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT to_regclass($1::text) IS NOT NULL AS present")
            .bind(self.qualified(table))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }

    async fn existing_tables(&self, partitions: &[Partition]) -> Result<Vec<String>, StoreError> {
        let mut tables = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let table = partition.table_name();
            if self.table_exists(&table).await? {
                tables.push(table);
            } else {
                debug!(table = %table, "partition missing, skipped");
            }
        }
        Ok(tables)
    }

    async fn count_table(&self, qualified: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {qualified}"))
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }
}

#[async_trait]
impl OccurrenceStore for PgStore {
    async fn ensure_partition(&self, partition: &Partition) -> Result<(), StoreError> {
        let sql = create_table_sql(
            &self.qualified(&partition.table_name()),
            &self.descriptor,
            self.config.srid,
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert(&self, partition: &Partition, records: &[CanonicalRecord]) -> Result<u64, StoreError> {
        let table = partition.table_name();
        if !self.table_exists(&table).await? {
            return Err(StoreError::MissingTable(table));
        }
        let columns = self.descriptor.columns();
        let column_list = column_list(&self.descriptor);
        let rows_per_statement = (MAX_BIND_PARAMS / (columns.len() + 1)).max(1);
        let srid = self.config.srid;

        let mut inserted = 0;
        for chunk in records.chunks(rows_per_statement) {
            let geometries = chunk
                .iter()
                .map(|r| geometry_json(r.geometry()))
                .collect::<Result<Vec<_>, _>>()?;
            let mut builder =
                QueryBuilder::<Postgres>::new(format!("INSERT INTO {} ({column_list}) ", self.qualified(&table)));
            builder.push_values(chunk.iter().zip(geometries), |mut row, (record, geometry)| {
                for column in columns {
                    push_typed(&mut row, record.attribute(&column.canonical), column.column_type);
                }
                row.push("ST_SetSRID(ST_GeomFromGeoJSON(")
                    .push_bind_unseparated(geometry)
                    .push_unseparated(format!("), {srid})"));
            });
            let result = builder.build().execute(&self.pool).await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn drop_partitions(&self, partitions: &[Partition]) -> Result<(), StoreError> {
        for partition in partitions {
            let qualified = self.qualified(&partition.table_name());
            sqlx::query(&format!("DROP TABLE IF EXISTS {qualified}"))
                .execute(&self.pool)
                .await?;
            info!(table = %qualified, "partition dropped");
        }
        Ok(())
    }

    async fn remove_duplicates(&self, partitions: &[Partition]) -> Result<u64, StoreError> {
        let roles = self.descriptor.roles();
        let mut removed = 0;
        for table in self.existing_tables(partitions).await? {
            let qualified = self.qualified(&table);
            let result = sqlx::query(&dedup_sql(&qualified, &roles.natural_key, &roles.load_timestamp))
                .execute(&self.pool)
                .await?;
            debug!(table = %table, removed = result.rows_affected(), "duplicates removed");
            removed += result.rows_affected();
        }
        Ok(removed)
    }

    async fn merge_similar_observations(&self, partitions: &[Partition]) -> Result<u64, StoreError> {
        let mut eliminated = 0;
        for table in self.existing_tables(partitions).await? {
            let qualified = self.qualified(&table);
            let merged_name = format!("{table}__merged");
            let merged = self.qualified(&merged_name);
            let before = self.count_table(&qualified).await?;

            let mut tx = self.pool.begin().await?;
            sqlx::query(&format!("DROP TABLE IF EXISTS {merged}"))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&create_table_sql(&merged, &self.descriptor, self.config.srid))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!(
                "INSERT INTO {merged} ({}) {}",
                column_list(&self.descriptor),
                merge_select_sql(&qualified, &self.descriptor)
            ))
            .execute(&mut *tx)
            .await?;
            let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {merged}"))
                .fetch_one(&mut *tx)
                .await?;
            let after: i64 = row.try_get("n")?;
            sqlx::query(&format!("DROP TABLE {qualified}"))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!(
                "ALTER TABLE {merged} RENAME TO {}",
                quote_ident(&table)
            ))
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            let dropped = before.saturating_sub(after as u64);
            debug!(table = %table, before, after, "similar observations merged");
            eliminated += dropped;
        }
        Ok(eliminated)
    }

    async fn update_indexes(&self, partitions: &[Partition]) -> Result<(), StoreError> {
        let area = &self.descriptor.roles().area_label;
        for table in self.existing_tables(partitions).await? {
            let qualified = self.qualified(&table);
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {qualified} USING GIST (geom)",
                quote_ident(&format!("{table}_geom_idx"))
            ))
            .execute(&self.pool)
            .await?;
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {qualified} ({})",
                quote_ident(&format!("{table}_area_idx")),
                quote_ident(area)
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn count_rows(&self, partitions: &[Partition]) -> Result<u64, StoreError> {
        let mut total = 0;
        for table in self.existing_tables(partitions).await? {
            total += self.count_table(&self.qualified(&table)).await?;
        }
        Ok(total)
    }

    async fn last_update(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT updated_at FROM {} WHERE id = 1",
            self.qualified(LAST_UPDATE_TABLE)
        ))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("updated_at")?)),
            None => Ok(None),
        }
    }

    async fn set_last_update(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, updated_at)
            VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET updated_at = EXCLUDED.updated_at
            "#,
            self.qualified(LAST_UPDATE_TABLE)
        ))
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::descriptor;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("uusimaa_points"), "\"uusimaa_points\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn table_definition_follows_descriptor_types() {
        let sql = create_table_sql("\"public\".\"t\"", &descriptor(), 3067);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"public\".\"t\" (row_id BIGSERIAL, "));
        assert!(sql.contains("\"load_date\" DATE"));
        assert!(sql.contains("\"individual_count\" BIGINT"));
        assert!(sql.contains("\"species\" TEXT"));
        assert!(sql.ends_with("geom geometry(Geometry, 3067))"));
    }

    #[test]
    fn merge_statement_maps_strategies() {
        let sql = merge_select_sql("t", &descriptor());
        assert!(sql.contains("string_agg(\"occurrence_id\"::text, ', ' ORDER BY row_id)"));
        assert!(sql.contains("GROUP BY u.token ORDER BY min(u.n)"));
        assert!(sql.contains("MAX(\"load_date\")"));
        assert!(sql.contains("(array_agg(\"municipality\" ORDER BY row_id))[1]"));
        assert!(sql.contains("SUM(COALESCE(\"merged_count\", 1))::bigint"));
        assert!(sql.contains("SUM(\"individual_count\")::bigint"));
        assert!(sql.ends_with("FROM t GROUP BY \"species\" ORDER BY MIN(row_id)"));
    }

    #[test]
    fn dedup_compares_member_keys() {
        let sql = dedup_sql("t", "occurrence_id", "load_date");
        assert!(sql.contains(r#"regexp_split_to_array("occurrence_id", '\s*,\s*')"#));
        assert!(sql.contains("b.keys @> a.keys"));
        assert!(sql.contains("b.loaded > a.loaded"));
        assert!(sql.contains("b.row_id > a.row_id"));
    }

    #[test]
    fn merged_table_keeps_the_partition_layout() {
        let merged = create_table_sql("\"public\".\"t__merged\"", &descriptor(), 3067);
        assert!(merged.contains("row_id BIGSERIAL"));
        assert!(merged.contains("geom geometry(Geometry, 3067)"));
        let columns = column_list(&descriptor());
        assert!(columns.starts_with("\"occurrence_id\", "));
        assert!(columns.ends_with(", geom"));
    }
}
