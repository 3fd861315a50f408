// catalogtool/src/store/memory.rs
//! In-process store used by tests and `--dry-run` style tooling.
//!
//! Emulates the Postgres behaviour the pipeline relies on: numeric `id` assignment,
//! conflict-skip on natural key or `id`, all-or-nothing table replacement.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::models::display_value;
use super::{
    BackupRecord, BackupStats, CatalogStore, EntityRecord, ExportCounts, ExportLogEntry,
    KeyField, MetadataStore, ParentRef, StoreError, TableSnapshot, UpsertOutcome,
};

#[derive(Default)]
struct Tables {
    rows: HashMap<String, Vec<Map<String, Value>>>,
}

#[derive(Default)]
struct Metadata {
    export_logs: HashMap<Uuid, ExportLogEntry>,
    backups: HashMap<Uuid, BackupRecord>,
}

#[derive(Default)]
struct Faults {
    unavailable: bool,
    fail_backup_inserts: bool,
    rejections: Vec<(String, String, Value)>,
}

#[derive(Default)]
pub struct MemoryCatalogStore {
    tables: Mutex<Tables>,
    metadata: Mutex<Metadata>,
    faults: Mutex<Faults>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a table so it can be snapshotted and restored before any import touched it.
    pub fn create_table(&self, table: &str) {
        let mut tables = lock(&self.tables);
        tables.rows.entry(table.to_string()).or_default();
    }

    /// Inserts rows directly, bypassing conflict checks.
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        let mut tables = lock(&self.tables);
        let entries = tables.rows.entry(table.to_string()).or_default();
        for row in rows {
            if let Value::Object(mut map) = row {
                if !map.contains_key("id") {
                    let next = next_id(entries);
                    map.insert("id".to_string(), Value::from(next));
                }
                entries.push(map);
            }
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Map<String, Value>> {
        lock(&self.tables).rows.get(table).cloned().unwrap_or_default()
    }

    /// Makes every catalogue operation fail as if the database went away.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.faults).unavailable = unavailable;
    }

    /// Rejects any upsert into `table` whose `column` equals `value`.
    pub fn reject_when(&self, table: &str, column: &str, value: Value) {
        lock(&self.faults)
            .rejections
            .push((table.to_string(), column.to_string(), value));
    }

    /// Makes `record_backup` fail, to exercise the orphan-blob compensation.
    pub fn fail_backup_inserts(&self, fail: bool) {
        lock(&self.faults).fail_backup_inserts = fail;
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if lock(&self.faults).unavailable {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn next_id(rows: &[Map<String, Value>]) -> i64 {
    rows.iter()
        .filter_map(|row| row.get("id").and_then(Value::as_i64))
        .max()
        .unwrap_or(0)
        + 1
}

fn values_match(left: &Value, right: &Value, case_insensitive: bool) -> bool {
    let (l, r) = (display_value(left), display_value(right));
    if case_insensitive {
        l.to_lowercase() == r.to_lowercase()
    } else {
        l == r
    }
}

fn key_matches(existing: &Map<String, Value>, candidate: &Map<String, Value>, key: &[KeyField]) -> bool {
    !key.is_empty()
        && key.iter().all(|field| {
            match (existing.get(field.column), candidate.get(field.column)) {
                (Some(a), Some(b)) if !a.is_null() && !b.is_null() => {
                    values_match(a, b, field.case_insensitive)
                }
                (None | Some(Value::Null), None | Some(Value::Null)) => true,
                _ => false,
            }
        })
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn lookup(&self, parent: &ParentRef) -> Result<Option<Value>, StoreError> {
        self.check_available()?;
        let tables = lock(&self.tables);
        let needle = Value::String(parent.value.clone());
        Ok(tables.rows.get(parent.table).and_then(|rows| {
            rows.iter()
                .find(|row| {
                    row.get(parent.column)
                        .is_some_and(|v| values_match(v, &needle, parent.case_insensitive))
                })
                .map(|row| row.get("id").cloned().unwrap_or(Value::Null))
        }))
    }

    async fn upsert(&self, record: &EntityRecord) -> Result<UpsertOutcome, StoreError> {
        self.check_available()?;
        {
            let faults = lock(&self.faults);
            for (table, column, value) in &faults.rejections {
                if table == record.table && record.columns.get(column) == Some(value) {
                    return Err(StoreError::Rejected(format!(
                        "{} violates a constraint on {}.{}",
                        display_value(value),
                        table,
                        column
                    )));
                }
            }
        }

        let mut tables = lock(&self.tables);
        let rows = tables.rows.entry(record.table.to_string()).or_default();

        let duplicate = rows.iter().any(|existing| {
            key_matches(existing, &record.columns, record.key)
                || match (existing.get("id"), record.columns.get("id")) {
                    (Some(a), Some(b)) if !b.is_null() => values_match(a, b, false),
                    _ => false,
                }
        });
        if duplicate {
            return Ok(UpsertOutcome::Skipped);
        }

        let mut row = record.columns.clone();
        if row.get("id").is_none_or(Value::is_null) {
            row.insert("id".to_string(), Value::from(next_id(rows)));
        }
        rows.push(row);
        Ok(UpsertOutcome::Inserted)
    }

    async fn snapshot_table(&self, table: &str) -> Result<Vec<Value>, StoreError> {
        self.check_available()?;
        let tables = lock(&self.tables);
        let rows = tables
            .rows
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(rows.iter().cloned().map(Value::Object).collect())
    }

    async fn replace_tables(&self, snapshots: &[TableSnapshot]) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut replacements = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let mut rows = Vec::with_capacity(snapshot.rows.len());
            for row in &snapshot.rows {
                match row {
                    Value::Object(map) => rows.push(map.clone()),
                    other => {
                        return Err(StoreError::Rejected(format!(
                            "restore row for {} is not an object: {}",
                            snapshot.table, other
                        )));
                    }
                }
            }
            replacements.push((snapshot.table.clone(), rows));
        }

        // Validated everything first so the swap below cannot partially apply.
        let mut tables = lock(&self.tables);
        let mut written = 0u64;
        for (table, rows) in replacements {
            written += rows.len() as u64;
            tables.rows.insert(table, rows);
        }
        Ok(written)
    }

    async fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let tables = lock(&self.tables);
        tables
            .rows
            .get(table)
            .map(|rows| rows.len() as u64)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }
}

#[async_trait]
impl MetadataStore for MemoryCatalogStore {
    async fn insert_export_log(&self, entry: &ExportLogEntry) -> Result<(), StoreError> {
        self.check_available()?;
        lock(&self.metadata).export_logs.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn update_export_log(
        &self,
        id: Uuid,
        status: &str,
        counts: ExportCounts,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut metadata = lock(&self.metadata);
        if let Some(entry) = metadata.export_logs.get_mut(&id) {
            entry.status = status.to_string();
            entry.record_count = counts.record_count;
            entry.successful_count = counts.successful;
            entry.failed_count = counts.failed;
            entry.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn get_export_log(&self, id: Uuid) -> Result<Option<ExportLogEntry>, StoreError> {
        self.check_available()?;
        Ok(lock(&self.metadata).export_logs.get(&id).cloned())
    }

    async fn delete_export_log(&self, id: Uuid) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(lock(&self.metadata).export_logs.remove(&id).is_some())
    }

    async fn record_backup(
        &self,
        record: &BackupRecord,
        entry: &ExportLogEntry,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        if lock(&self.faults).fail_backup_inserts {
            return Err(StoreError::Unavailable("backup metadata insert failed".to_string()));
        }
        let mut metadata = lock(&self.metadata);
        metadata.export_logs.insert(entry.id, entry.clone());
        metadata.backups.insert(record.id, record.clone());
        Ok(())
    }

    async fn reinstate_backup(&self, record: &BackupRecord) -> Result<(), StoreError> {
        self.check_available()?;
        lock(&self.metadata).backups.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>, StoreError> {
        self.check_available()?;
        Ok(lock(&self.metadata).backups.get(&id).cloned())
    }

    async fn find_backup_by_export_log(
        &self,
        export_log_id: Uuid,
    ) -> Result<Option<BackupRecord>, StoreError> {
        self.check_available()?;
        Ok(lock(&self.metadata)
            .backups
            .values()
            .find(|b| b.export_log_id == export_log_id)
            .cloned())
    }

    async fn list_backups(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<BackupRecord>, i64), StoreError> {
        self.check_available()?;
        let metadata = lock(&self.metadata);
        let mut all: Vec<BackupRecord> = metadata.backups.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        let total = all.len() as i64;
        let page = all
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn backup_stats(&self) -> Result<BackupStats, StoreError> {
        self.check_available()?;
        let metadata = lock(&self.metadata);
        Ok(BackupStats {
            count: metadata.backups.len() as i64,
            total_records: metadata.backups.values().map(|b| b.record_count).sum(),
            total_size_bytes: metadata.backups.values().map(|b| b.size_bytes).sum(),
            latest_created_at: metadata.backups.values().map(|b| b.created_at).max(),
        })
    }

    async fn delete_backup(&self, id: Uuid) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(lock(&self.metadata).backups.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NAME_KEY: &[KeyField] = &[KeyField::folded("name")];

    fn author(name: &str) -> EntityRecord {
        let mut columns = Map::new();
        columns.insert("name".to_string(), json!(name));
        EntityRecord { table: "authors", key: NAME_KEY, columns, parents: vec![] }
    }

    #[tokio::test]
    async fn test_upsert_skips_case_insensitive_duplicates() -> anyhow::Result<()> {
        let store = MemoryCatalogStore::new();
        assert_eq!(store.upsert(&author("Ada Lovelace")).await?, UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&author("ada lovelace")).await?, UpsertOutcome::Skipped);
        assert_eq!(store.count_rows("authors").await?, 1);
        assert_eq!(store.rows("authors")[0]["id"], json!(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_absent_key_column_matches_absent() -> anyhow::Result<()> {
        const VIEW_KEY: &[KeyField] = &[KeyField::exact("quote_id"), KeyField::exact("session_id")];
        let store = MemoryCatalogStore::new();
        let view = |columns: serde_json::Value| EntityRecord {
            table: "quote_views",
            key: VIEW_KEY,
            columns: columns.as_object().cloned().unwrap_or_default(),
            parents: vec![],
        };

        assert_eq!(store.upsert(&view(json!({ "quote_id": 1 }))).await?, UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&view(json!({ "quote_id": 1, "session_id": null }))).await?, UpsertOutcome::Skipped);
        assert_eq!(store.upsert(&view(json!({ "quote_id": 1, "session_id": "s1" }))).await?, UpsertOutcome::Inserted);
        assert_eq!(store.count_rows("quote_views").await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_lookup_returns_parent_id() -> anyhow::Result<()> {
        let store = MemoryCatalogStore::new();
        store.seed("authors", vec![json!({ "id": 7, "name": "Seneca" })]);

        let parent = ParentRef {
            relation: "author",
            table: "authors",
            column: "name",
            value: "SENECA".to_string(),
            case_insensitive: true,
            assign_to: Some("author_id"),
        };
        assert_eq!(store.lookup(&parent).await?, Some(json!(7)));

        let missing = ParentRef { value: "Cato".to_string(), ..parent };
        assert_eq!(store.lookup(&missing).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_replace_tables_is_all_or_nothing() -> anyhow::Result<()> {
        let store = MemoryCatalogStore::new();
        store.seed("quotes", vec![json!({ "text": "old" })]);

        let bad = vec![
            TableSnapshot { table: "quotes".to_string(), rows: vec![json!({ "id": 1, "text": "new" })] },
            TableSnapshot { table: "authors".to_string(), rows: vec![json!("not an object")] },
        ];
        assert!(store.replace_tables(&bad).await.is_err());
        assert_eq!(store.rows("quotes")[0]["text"], json!("old"));

        let good = vec![TableSnapshot {
            table: "quotes".to_string(),
            rows: vec![json!({ "id": 1, "text": "a" }), json!({ "id": 2, "text": "b" })],
        }];
        assert_eq!(store.replace_tables(&good).await?, 2);
        assert_eq!(store.count_rows("quotes").await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_everything() {
        let store = MemoryCatalogStore::new();
        store.set_unavailable(true);
        let err = store.upsert(&author("Ada")).await.unwrap_err();
        assert!(!err.is_row_level());
    }
}
