// catalogtool/src/store/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Executor, PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    quote_ident, BackupRecord, BackupStats, CatalogStore, EntityRecord, ExportCounts,
    ExportLogEntry, MetadataStore, ParentRef, StoreError, TableSnapshot, UpsertOutcome,
};
use crate::utils::sequence_reset::reset_sequences_with_timeout;

const SNAPSHOT_BATCH_SIZE: i64 = 500;
const RESTORE_CHUNK_SIZE: usize = 500;

/// Bookkeeping tables owned by this subsystem. The catalogue tables themselves are
/// managed by the application's migrations.
const METADATA_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS export_logs (
    id UUID PRIMARY KEY,
    operation TEXT NOT NULL,
    format TEXT NOT NULL,
    data_type TEXT NOT NULL,
    status TEXT NOT NULL,
    actor TEXT NOT NULL,
    options JSONB NOT NULL DEFAULT '{}'::jsonb,
    record_count BIGINT NOT NULL DEFAULT 0,
    successful_count BIGINT NOT NULL DEFAULT 0,
    failed_count BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS backups (
    id UUID PRIMARY KEY,
    description TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    record_count BIGINT NOT NULL,
    file_key TEXT,
    size_bytes BIGINT NOT NULL DEFAULT 0,
    checksum TEXT,
    tables JSONB NOT NULL DEFAULT '[]'::jsonb,
    export_log_id UUID NOT NULL
);
"#;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to connect to database: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the `export_logs` and `backups` tables if they are missing.
    pub async fn ensure_metadata_schema(&self) -> Result<(), StoreError> {
        self.pool.execute(METADATA_SCHEMA).await?;
        debug!("✓ Metadata tables present");
        Ok(())
    }
}

/// Splits sqlx failures into row-level rejections and job-level failures.
fn classify(err: sqlx::Error, relation_hint: &str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
        if code == "23503" {
            return StoreError::MissingParent {
                relation: db_err
                    .constraint()
                    .map(str::to_string)
                    .unwrap_or_else(|| relation_hint.to_string()),
                detail: db_err.message().to_string(),
            };
        }
        // Class 23 = integrity constraint, class 22 = bad data for the column type.
        if code.starts_with("23") || code.starts_with("22") {
            return StoreError::Rejected(db_err.message().to_string());
        }
        if code == "42P01" {
            return StoreError::UnknownTable(db_err.message().to_string());
        }
    }
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        other => StoreError::Database(other),
    }
}

/// Insert-unless-present. The natural key is compared with
/// `IS NOT DISTINCT FROM` so an absent optional key column matches another
/// absent one, the same as the in-memory store; unique constraints still apply.
fn upsert_sql(record: &EntityRecord) -> String {
    let table = quote_ident(record.table);
    let names: Vec<String> = record.columns.keys().map(|c| quote_ident(c)).collect();
    let columns = names.join(", ");
    let selected = names.iter().map(|c| format!("r.{}", c)).collect::<Vec<_>>().join(", ");

    let conditions: Vec<String> = record
        .key
        .iter()
        .map(|field| {
            let column = quote_ident(field.column);
            if field.case_insensitive {
                format!("lower(e.{c}::text) IS NOT DISTINCT FROM lower(r.{c}::text)", c = column)
            } else {
                format!("e.{c} IS NOT DISTINCT FROM r.{c}", c = column)
            }
        })
        .collect();
    let existing = if conditions.is_empty() {
        String::new()
    } else {
        format!(
            " WHERE NOT EXISTS (SELECT 1 FROM {} e WHERE {})",
            table,
            conditions.join(" AND ")
        )
    };

    format!(
        "INSERT INTO {table} ({columns}) SELECT {selected} FROM jsonb_populate_record(NULL::{table}, $1) r{existing} ON CONFLICT DO NOTHING"
    )
}

/// Names a foreign-key violation after the parent it refers to, as lookups do.
/// Constraint names follow `<table>_<relation>_id_fkey`.
fn parent_relation(record: &EntityRecord, constraint: &str) -> String {
    let named = record
        .parents
        .iter()
        .find(|parent| constraint.contains(&format!("{}_id", parent.relation)));
    match (named, record.parents.as_slice()) {
        (Some(parent), _) => parent.relation.to_string(),
        (None, [only]) => only.relation.to_string(),
        (None, _) => constraint.to_string(),
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn lookup(&self, parent: &ParentRef) -> Result<Option<Value>, StoreError> {
        let predicate = if parent.case_insensitive {
            format!("lower(t.{}::text) = lower($1)", quote_ident(parent.column))
        } else {
            format!("t.{}::text = $1", quote_ident(parent.column))
        };
        let sql = format!(
            "SELECT to_jsonb(t.\"id\") AS id FROM {} t WHERE {} LIMIT 1",
            quote_ident(parent.table),
            predicate
        );
        let row = sqlx::query(&sql)
            .bind(&parent.value)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify(e, parent.relation))?;
        match row {
            Some(row) => Ok(Some(row.try_get::<Value, _>("id")?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: &EntityRecord) -> Result<UpsertOutcome, StoreError> {
        let result = sqlx::query(&upsert_sql(record))
            .bind(Json(Value::Object(record.columns.clone())))
            .execute(&self.pool)
            .await
            .map_err(|e| match classify(e, record.table) {
                StoreError::MissingParent { relation, detail } => StoreError::MissingParent {
                    relation: parent_relation(record, &relation),
                    detail,
                },
                other => other,
            })?;

        if result.rows_affected() == 0 {
            Ok(UpsertOutcome::Skipped)
        } else {
            Ok(UpsertOutcome::Inserted)
        }
    }

    async fn snapshot_table(&self, table: &str) -> Result<Vec<Value>, StoreError> {
        let row_count = self.count_rows(table).await?;
        debug!(table, row_count, "Snapshotting table");

        // Fetch data in batches
        let mut rows = Vec::with_capacity(row_count as usize);
        let mut offset = 0;
        loop {
            let query = format!(
                "SELECT to_jsonb(t) AS row FROM (SELECT * FROM {} ORDER BY 1 LIMIT {} OFFSET {}) t",
                quote_ident(table),
                SNAPSHOT_BATCH_SIZE,
                offset
            );
            let batch = sqlx::query(&query)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| classify(e, table))?;

            if batch.is_empty() {
                break;
            }
            for row in &batch {
                rows.push(row.try_get::<Value, _>("row")?);
            }
            offset += SNAPSHOT_BATCH_SIZE;
        }
        Ok(rows)
    }

    async fn replace_tables(&self, snapshots: &[TableSnapshot]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for snapshot in snapshots {
            let table = quote_ident(&snapshot.table);
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await
                .map_err(|e| classify(e, &snapshot.table))?;

            for chunk in snapshot.rows.chunks(RESTORE_CHUNK_SIZE) {
                let sql = format!(
                    "INSERT INTO {table} SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1)"
                );
                let result = sqlx::query(&sql)
                    .bind(Json(Value::Array(chunk.to_vec())))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| classify(e, &snapshot.table))?;
                written += result.rows_affected();
            }
            info!(table = %snapshot.table, rows = snapshot.rows.len(), "Table contents replaced");
        }

        tx.commit().await?;

        for snapshot in snapshots {
            if let Err(e) = reset_sequences_with_timeout(&self.pool, &snapshot.table).await {
                warn!(table = %snapshot.table, error = %e, "Sequence reset after restore failed");
            }
        }
        Ok(written)
    }

    async fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        let count: Option<i64> =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
                .fetch_one(&self.pool)
                .await
                .map_err(|e| classify(e, table))?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }
}

const BACKUP_COLUMNS: &str =
    "id, description, created_at, record_count, file_key, size_bytes, checksum, tables, export_log_id";
const EXPORT_LOG_COLUMNS: &str = "id, operation, format, data_type, status, actor, options, record_count, successful_count, failed_count, created_at, updated_at";

fn backup_from_row(row: &PgRow) -> Result<BackupRecord, StoreError> {
    let tables: Json<Vec<String>> = row.try_get("tables")?;
    Ok(BackupRecord {
        id: row.try_get("id")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        record_count: row.try_get("record_count")?,
        file_key: row.try_get("file_key")?,
        size_bytes: row.try_get("size_bytes")?,
        checksum: row.try_get("checksum")?,
        tables: tables.0,
        export_log_id: row.try_get("export_log_id")?,
    })
}

fn export_log_from_row(row: &PgRow) -> Result<ExportLogEntry, StoreError> {
    let operation: String = row.try_get("operation")?;
    Ok(ExportLogEntry {
        id: row.try_get("id")?,
        operation: operation.parse().map_err(StoreError::Rejected)?,
        format: row.try_get("format")?,
        data_type: row.try_get("data_type")?,
        status: row.try_get("status")?,
        actor: row.try_get("actor")?,
        options: row.try_get("options")?,
        record_count: row.try_get("record_count")?,
        successful_count: row.try_get("successful_count")?,
        failed_count: row.try_get("failed_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn insert_backup_row<'e, E>(executor: E, record: &BackupRecord) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(&format!(
        "INSERT INTO backups ({BACKUP_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
    ))
    .bind(record.id)
    .bind(&record.description)
    .bind(record.created_at)
    .bind(record.record_count)
    .bind(&record.file_key)
    .bind(record.size_bytes)
    .bind(&record.checksum)
    .bind(Json(&record.tables))
    .bind(record.export_log_id)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_export_log_row<'e, E>(executor: E, entry: &ExportLogEntry) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(&format!(
        "INSERT INTO export_logs ({EXPORT_LOG_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
    ))
    .bind(entry.id)
    .bind(entry.operation.to_string())
    .bind(&entry.format)
    .bind(&entry.data_type)
    .bind(&entry.status)
    .bind(&entry.actor)
    .bind(Json(&entry.options))
    .bind(entry.record_count)
    .bind(entry.successful_count)
    .bind(entry.failed_count)
    .bind(entry.created_at)
    .bind(entry.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl MetadataStore for PgStore {
    async fn insert_export_log(&self, entry: &ExportLogEntry) -> Result<(), StoreError> {
        insert_export_log_row(&self.pool, entry).await?;
        Ok(())
    }

    async fn update_export_log(
        &self,
        id: Uuid,
        status: &str,
        counts: ExportCounts,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE export_logs SET status = $2, record_count = $3, successful_count = $4, failed_count = $5, updated_at = $6 WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(counts.record_count)
        .bind(counts.successful)
        .bind(counts.failed)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_export_log(&self, id: Uuid) -> Result<Option<ExportLogEntry>, StoreError> {
        let row = sqlx::query(&format!("SELECT {EXPORT_LOG_COLUMNS} FROM export_logs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(export_log_from_row).transpose()
    }

    async fn delete_export_log(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM export_logs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_backup(
        &self,
        record: &BackupRecord,
        entry: &ExportLogEntry,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_export_log_row(&mut *tx, entry).await?;
        insert_backup_row(&mut *tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reinstate_backup(&self, record: &BackupRecord) -> Result<(), StoreError> {
        insert_backup_row(&self.pool, record).await?;
        Ok(())
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(backup_from_row).transpose()
    }

    async fn find_backup_by_export_log(
        &self,
        export_log_id: Uuid,
    ) -> Result<Option<BackupRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups WHERE export_log_id = $1 LIMIT 1"
        ))
        .bind(export_log_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(backup_from_row).transpose()
    }

    async fn list_backups(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<BackupRecord>, i64), StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups ORDER BY created_at DESC, id LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backups")
            .fetch_one(&self.pool)
            .await?;

        let backups = rows.iter().map(backup_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((backups, total))
    }

    async fn backup_stats(&self) -> Result<BackupStats, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count, COALESCE(SUM(record_count), 0)::BIGINT AS total_records, COALESCE(SUM(size_bytes), 0)::BIGINT AS total_size, MAX(created_at) AS latest FROM backups",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(BackupStats {
            count: row.try_get("count")?,
            total_records: row.try_get("total_records")?,
            total_size_bytes: row.try_get("total_size")?,
            latest_created_at: row.try_get::<Option<DateTime<Utc>>, _>("latest")?,
        })
    }

    async fn delete_backup(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM backups WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyField;
    use serde_json::{json, Map};

    const VIEW_KEY: &[KeyField] = &[KeyField::exact("quote_id"), KeyField::exact("session_id")];
    const AUTHOR_KEY: &[KeyField] = &[KeyField::folded("name")];

    fn record(table: &'static str, key: &'static [KeyField], columns: Value, parents: Vec<ParentRef>) -> EntityRecord {
        let columns = match columns {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        EntityRecord { table, key, columns, parents }
    }

    fn parent(relation: &'static str) -> ParentRef {
        ParentRef {
            relation,
            table: "t",
            column: "name",
            value: "x".to_string(),
            case_insensitive: true,
            assign_to: None,
        }
    }

    #[test]
    fn test_upsert_treats_absent_key_columns_as_equal() {
        let view = record("quote_views", VIEW_KEY, json!({ "quote_id": 1 }), Vec::new());
        let sql = upsert_sql(&view);
        assert!(sql.contains("e.\"session_id\" IS NOT DISTINCT FROM r.\"session_id\""));
        assert!(sql.contains("WHERE NOT EXISTS (SELECT 1 FROM \"quote_views\" e"));
        assert!(sql.ends_with("ON CONFLICT DO NOTHING"));

        let author = record("authors", AUTHOR_KEY, json!({ "name": "Ada" }), Vec::new());
        assert!(upsert_sql(&author).contains("lower(e.\"name\"::text) IS NOT DISTINCT FROM lower(r.\"name\"::text)"));

        let keyless = record("sessions", &[], json!({ "id": 1 }), Vec::new());
        assert!(!upsert_sql(&keyless).contains("NOT EXISTS"));
    }

    #[test]
    fn test_foreign_key_violation_names_the_parent() {
        let quote = record(
            "quotes",
            &[],
            json!({ "text": "x" }),
            vec![parent("author"), parent("reference")],
        );
        assert_eq!(parent_relation(&quote, "quotes_author_id_fkey"), "author");
        assert_eq!(parent_relation(&quote, "quotes_reference_id_fkey"), "reference");
        assert_eq!(parent_relation(&quote, "quotes_editor_fkey"), "quotes_editor_fkey");

        let tag = record("quote_tags", &[], json!({ "quote_id": 9 }), vec![parent("quote")]);
        assert_eq!(parent_relation(&tag, "fk_tags_quote"), "quote");
    }
}
