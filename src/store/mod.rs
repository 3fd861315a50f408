//! Relational store collaborators.
//!
//! `CatalogStore` covers the catalogue tables touched by imports, backups and
//! restores. `MetadataStore` covers the subsystem's own bookkeeping (backup records
//! and the export/import audit log). Both are implemented by `PgStore` for
//! production and `MemoryCatalogStore` for tests and dry runs.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryCatalogStore;
pub use models::{
    BackupRecord, BackupStats, EntityRecord, ExportCounts, ExportLogEntry, ExportOperation,
    KeyField, ParentRef, TableSnapshot, UpsertOutcome,
};
pub use postgres::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The row points at a parent entity that is not in the store.
    #[error("missing parent {relation}: {detail}")]
    MissingParent { relation: String, detail: String },

    /// The store refused this single row (constraint or data error).
    #[error("row rejected: {0}")]
    Rejected(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Row-level failures are absorbed by the importer; everything else aborts the job.
    pub fn is_row_level(&self) -> bool {
        matches!(self, StoreError::MissingParent { .. } | StoreError::Rejected(_))
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Finds the parent row and returns its `id`, or `None` if it does not exist.
    async fn lookup(&self, parent: &ParentRef) -> Result<Option<Value>, StoreError>;

    /// Inserts the record unless a row with the same key exists.
    async fn upsert(&self, record: &EntityRecord) -> Result<UpsertOutcome, StoreError>;

    async fn snapshot_table(&self, table: &str) -> Result<Vec<Value>, StoreError>;

    /// Replaces the full contents of every given table in one unit of work.
    /// Returns the number of rows written.
    async fn replace_tables(&self, tables: &[TableSnapshot]) -> Result<u64, StoreError>;

    async fn count_rows(&self, table: &str) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert_export_log(&self, entry: &ExportLogEntry) -> Result<(), StoreError>;

    async fn update_export_log(
        &self,
        id: Uuid,
        status: &str,
        counts: ExportCounts,
    ) -> Result<(), StoreError>;

    async fn get_export_log(&self, id: Uuid) -> Result<Option<ExportLogEntry>, StoreError>;

    async fn delete_export_log(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Inserts the backup record together with its audit entry, atomically.
    async fn record_backup(
        &self,
        record: &BackupRecord,
        entry: &ExportLogEntry,
    ) -> Result<(), StoreError>;

    /// Puts a previously deleted backup record back (compensation path).
    async fn reinstate_backup(&self, record: &BackupRecord) -> Result<(), StoreError>;

    async fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>, StoreError>;

    async fn find_backup_by_export_log(
        &self,
        export_log_id: Uuid,
    ) -> Result<Option<BackupRecord>, StoreError>;

    /// Newest first. Returns the page and the total number of backups.
    async fn list_backups(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<BackupRecord>, i64), StoreError>;

    async fn backup_stats(&self) -> Result<BackupStats, StoreError>;

    async fn delete_backup(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// Quotes an SQL identifier, doubling embedded quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("quotes"), "\"quotes\"");
        assert_eq!(quote_ident("references"), "\"references\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_row_level_classification() {
        let missing = StoreError::MissingParent {
            relation: "author".to_string(),
            detail: "name=Ada".to_string(),
        };
        assert!(missing.is_row_level());
        assert!(StoreError::Rejected("check violation".to_string()).is_row_level());
        assert!(!StoreError::Unavailable("pool closed".to_string()).is_row_level());
        assert!(!StoreError::UnknownTable("nope".to_string()).is_row_level());
    }
}
