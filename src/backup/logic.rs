// catalogtool/src/backup/logic.rs
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::snapshot::{self, SnapshotDocument};
use super::BackupManager;
use crate::errors::{AppError, Result};
use crate::store::{BackupRecord, BackupStats, ExportLogEntry, ExportOperation, TableSnapshot};

const MAX_PAGE_SIZE: i64 = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupListing {
    pub backups: Vec<BackupRecord>,
    pub total: i64,
    pub has_more: bool,
    pub stats: BackupStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkDeleteResult {
    pub total: usize,
    pub deleted: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl BackupManager {
    /// Snapshots the protected tables, writes the blob, then records the backup.
    /// If recording fails the blob is deleted again so no orphan is left behind.
    pub async fn create_backup(&self, description: &str, actor: &str) -> Result<BackupRecord> {
        let description = description.trim();
        if description.is_empty() {
            return Err(AppError::Validation("backup description cannot be empty".to_string()));
        }

        let mut tables = Vec::with_capacity(self.settings.tables.len());
        for table in &self.settings.tables {
            let rows = self.store.snapshot_table(table).await?;
            info!("✓ Read {} rows from {}", rows.len(), table);
            tables.push(TableSnapshot { table: table.clone(), rows });
        }
        let document = SnapshotDocument::new(tables);
        let encoded = snapshot::encode(&document)
            .map_err(|e| AppError::Backup(format!("failed to serialize snapshot: {}", e)))?;

        let id = Uuid::new_v4();
        let timestamp = Utc::now().format("%Y-%m-%d_%H_%M_%S").to_string();
        let file_key = format!("{}/{}_{}.json.gz", self.settings.key_prefix, timestamp, id);
        let size_bytes = encoded.bytes.len() as i64;

        self.blobs.put(&file_key, encoded.bytes).await?;
        info!("✓ Snapshot written to {} ({})", file_key, self.blobs.describe());

        let mut entry = ExportLogEntry::new(
            ExportOperation::Backup,
            "json.gz",
            document.table_names().join(","),
            actor,
            json!({ "description": description, "tables": document.table_names() }),
        );
        entry.status = "completed".to_string();
        entry.record_count = document.record_count as i64;
        entry.successful_count = document.record_count as i64;

        let record = BackupRecord {
            id,
            description: description.to_string(),
            created_at: document.created_at,
            record_count: document.record_count as i64,
            file_key: Some(file_key.clone()),
            size_bytes,
            checksum: Some(encoded.checksum),
            tables: document.table_names(),
            export_log_id: entry.id,
        };

        if let Err(e) = self.metadata.record_backup(&record, &entry).await {
            warn!(backup_id = %id, error = %e, "Recording backup failed; removing uploaded snapshot");
            if let Err(cleanup) = self.blobs.delete(&file_key).await {
                error!(backup_id = %id, key = %file_key, error = %cleanup, "Orphaned snapshot could not be removed");
            }
            return Err(AppError::Backup(format!("failed to record backup metadata: {}", e)));
        }

        info!(
            backup_id = %id,
            record_count = record.record_count,
            size_bytes,
            "✅ Backup created"
        );
        Ok(record)
    }

    pub async fn list_backups(&self, limit: i64, offset: i64) -> Result<BackupListing> {
        if limit <= 0 || offset < 0 {
            return Err(AppError::Validation(format!(
                "invalid page: limit {} offset {}",
                limit, offset
            )));
        }
        let limit = limit.min(MAX_PAGE_SIZE);

        let (backups, total) = self.metadata.list_backups(limit, offset).await?;
        let stats = self.metadata.backup_stats().await?;
        let has_more = offset + (backups.len() as i64) < total;
        Ok(BackupListing { backups, total, has_more, stats })
    }

    pub async fn get_backup(&self, id: Uuid) -> Result<BackupRecord> {
        self.metadata
            .get_backup(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("backup {}", id)))
    }

    /// Removes the record, then the blob. If the blob cannot be removed the
    /// record is put back, so a record never points at a deleted blob.
    pub async fn delete_backup(&self, id: Uuid) -> Result<()> {
        let record = self.get_backup(id).await?;

        if !self.metadata.delete_backup(id).await? {
            return Err(AppError::NotFound(format!("backup {}", id)));
        }

        if let Some(key) = &record.file_key {
            if let Err(e) = self.blobs.delete(key).await {
                warn!(backup_id = %id, error = %e, "Snapshot delete failed; restoring backup record");
                if let Err(reinstate) = self.metadata.reinstate_backup(&record).await {
                    error!(backup_id = %id, error = %reinstate, "Could not restore backup record after failed delete");
                }
                return Err(e.into());
            }
        }

        info!(backup_id = %id, "✓ Backup deleted");
        Ok(())
    }

    /// Deletes each id independently; one failure never stops the rest.
    pub async fn bulk_delete(&self, ids: &[Uuid]) -> BulkDeleteResult {
        let mut result = BulkDeleteResult { total: ids.len(), ..Default::default() };
        for id in ids {
            match self.delete_backup(*id).await {
                Ok(()) => result.deleted += 1,
                Err(e) => {
                    result.failed += 1;
                    result.errors.push(format!("{}: {}", id, e));
                }
            }
        }
        info!(
            total = result.total,
            deleted = result.deleted,
            failed = result.failed,
            "✓ Bulk delete completed"
        );
        result
    }

    /// Deletes an audit entry. A backup entry takes its backup (blob and record)
    /// with it.
    pub async fn delete_export_entry(&self, export_log_id: Uuid) -> Result<()> {
        let backup = self.metadata.find_backup_by_export_log(export_log_id).await?;
        if let Some(backup) = &backup {
            self.delete_backup(backup.id).await?;
        }

        let removed = self.metadata.delete_export_log(export_log_id).await?;
        if !removed && backup.is_none() {
            return Err(AppError::NotFound(format!("export log entry {}", export_log_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupSettings;
    use crate::storage::{BlobStore, MemoryBlobStore};
    use crate::store::{MemoryCatalogStore, MetadataStore};
    use std::sync::Arc;

    struct Fixture {
        store: Arc<MemoryCatalogStore>,
        blobs: Arc<MemoryBlobStore>,
        manager: BackupManager,
    }

    fn fixture(rows: usize) -> Fixture {
        let store = Arc::new(MemoryCatalogStore::new());
        store.create_table("quotes");
        store.seed(
            "quotes",
            (0..rows).map(|i| json!({ "text": format!("quote {}", i) })).collect(),
        );
        let blobs = Arc::new(MemoryBlobStore::new());
        let manager = BackupManager::new(store.clone(), store.clone(), blobs.clone(), BackupSettings::default());
        Fixture { store, blobs, manager }
    }

    #[tokio::test]
    async fn test_create_backup_writes_blob_and_record() -> anyhow::Result<()> {
        let f = fixture(12);
        let record = f.manager.create_backup("nightly", "cli").await?;

        assert_eq!(record.record_count, 12);
        assert_eq!(record.tables, vec!["quotes".to_string()]);
        let key = record.file_key.clone().unwrap();
        assert!(key.starts_with("backups/"));
        assert!(key.ends_with(".json.gz"));
        assert!(f.blobs.contains(&key));
        assert_eq!(record.size_bytes as usize, f.blobs.get(&key).await?.len());

        let entry = f.store.get_export_log(record.export_log_id).await?.unwrap();
        assert_eq!(entry.operation, ExportOperation::Backup);
        assert_eq!(entry.record_count, 12);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_description_rejected() {
        let f = fixture(1);
        let err = f.manager.create_backup("   ", "cli").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(f.blobs.is_empty());
    }

    #[tokio::test]
    async fn test_failed_metadata_insert_removes_blob() {
        let f = fixture(3);
        f.store.fail_backup_inserts(true);

        let err = f.manager.create_backup("nightly", "cli").await.unwrap_err();
        assert!(matches!(err, AppError::Backup(_)));
        assert!(f.blobs.is_empty());
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_no_record() -> anyhow::Result<()> {
        let f = fixture(3);
        f.blobs.set_fail_puts(true);

        assert!(matches!(f.manager.create_backup("nightly", "cli").await, Err(AppError::Storage(_))));
        assert_eq!(f.manager.list_backups(10, 0).await?.total, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_pages_and_stats() -> anyhow::Result<()> {
        let f = fixture(5);
        for name in ["one", "two", "three"] {
            f.manager.create_backup(name, "cli").await?;
        }

        let first = f.manager.list_backups(2, 0).await?;
        assert_eq!(first.backups.len(), 2);
        assert_eq!(first.total, 3);
        assert!(first.has_more);
        assert_eq!(first.stats.count, 3);
        assert_eq!(first.stats.total_records, 15);
        assert!(first.stats.total_size_bytes > 0);

        let second = f.manager.list_backups(2, 2).await?;
        assert_eq!(second.backups.len(), 1);
        assert!(!second.has_more);

        assert!(f.manager.list_backups(0, 0).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_removes_blob_and_record() -> anyhow::Result<()> {
        let f = fixture(2);
        let record = f.manager.create_backup("nightly", "cli").await?;

        f.manager.delete_backup(record.id).await?;
        assert!(f.blobs.is_empty());
        assert!(matches!(f.manager.get_backup(record.id).await, Err(AppError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_blob_delete_restores_record() -> anyhow::Result<()> {
        let f = fixture(2);
        let record = f.manager.create_backup("nightly", "cli").await?;
        f.blobs.set_fail_deletes(true);

        assert!(f.manager.delete_backup(record.id).await.is_err());
        assert_eq!(f.manager.get_backup(record.id).await?, record);
        assert_eq!(f.blobs.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_deleting_export_entry_cascades_to_backup() -> anyhow::Result<()> {
        let f = fixture(2);
        let record = f.manager.create_backup("nightly", "cli").await?;

        f.manager.delete_export_entry(record.export_log_id).await?;
        assert!(f.blobs.is_empty());
        assert!(f.store.get_backup(record.id).await?.is_none());
        assert!(f.store.get_export_log(record.export_log_id).await?.is_none());

        let err = f.manager.delete_export_entry(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        Ok(())
    }
}
