// catalogtool/src/restore/logic.rs
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup::snapshot::{self, SnapshotDocument};
use crate::backup::BackupManager;
use crate::errors::{AppError, Result};
use crate::storage::BlobError;
use crate::store::BackupRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub backup_id: Uuid,
    pub record_count: u64,
    pub tables: Vec<String>,
}

impl BackupManager {
    /// Replaces the backed-up tables with the snapshot's contents.
    ///
    /// Without `confirmed` nothing is read or written. The replacement runs as
    /// one unit of work in the store.
    pub async fn restore_from_backup(&self, id: Uuid, confirmed: bool) -> Result<RestoreSummary> {
        if !confirmed {
            return Err(AppError::ConfirmationRequired(id.to_string()));
        }

        let record = self.get_backup(id).await?;
        let document = self.load_verified_snapshot(&record).await?;

        info!(backup_id = %id, tables = ?document.table_names(), "Restoring backup");
        let written = self.store.replace_tables(&document.tables).await?;
        let record_count = document.counted_rows();
        if written != record_count {
            warn!(backup_id = %id, written, record_count, "Restored row count differs from snapshot");
        }

        info!(backup_id = %id, record_count, "✅ Restore completed");
        Ok(RestoreSummary {
            backup_id: id,
            record_count,
            tables: document.table_names(),
        })
    }

    /// Reads and decodes the blob, refusing snapshots whose checksum does not
    /// match the stored one.
    async fn load_verified_snapshot(&self, record: &BackupRecord) -> Result<SnapshotDocument> {
        let key = record
            .file_key
            .as_deref()
            .ok_or_else(|| AppError::Restore(format!("backup {} has no snapshot file", record.id)))?;

        let bytes = self.blobs.get(key).await.map_err(|e| match e {
            BlobError::NotFound(_) => {
                AppError::Restore(format!("snapshot for backup {} is missing: {}", record.id, e))
            }
            other => AppError::Storage(other),
        })?;

        let (document, checksum) = snapshot::decode(&bytes)
            .map_err(|e| AppError::Restore(format!("snapshot for backup {} is corrupt: {}", record.id, e)))?;

        if let Some(expected) = &record.checksum {
            if expected != &checksum {
                return Err(AppError::Restore(format!(
                    "snapshot for backup {} failed checksum verification",
                    record.id
                )));
            }
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupSettings;
    use crate::storage::MemoryBlobStore;
    use crate::store::{CatalogStore, MemoryCatalogStore};
    use serde_json::json;
    use std::sync::Arc;

    fn setup(rows: usize) -> (Arc<MemoryCatalogStore>, Arc<MemoryBlobStore>, BackupManager) {
        let store = Arc::new(MemoryCatalogStore::new());
        store.create_table("quotes");
        store.seed("quotes", (0..rows).map(|i| json!({ "text": format!("q{}", i) })).collect());
        let blobs = Arc::new(MemoryBlobStore::new());
        let manager = BackupManager::new(store.clone(), store.clone(), blobs.clone(), BackupSettings::default());
        (store, blobs, manager)
    }

    #[tokio::test]
    async fn test_unconfirmed_restore_touches_nothing() -> anyhow::Result<()> {
        let (store, _, manager) = setup(3);
        let backup = manager.create_backup("before", "cli").await?;
        store.seed("quotes", vec![json!({ "text": "added later" })]);

        let err = manager.restore_from_backup(backup.id, false).await.unwrap_err();
        assert!(matches!(err, AppError::ConfirmationRequired(_)));
        assert_eq!(store.count_rows("quotes").await?, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_confirmed_restore_replaces_table() -> anyhow::Result<()> {
        let (store, _, manager) = setup(3);
        let backup = manager.create_backup("before", "cli").await?;
        store.seed("quotes", vec![json!({ "text": "added later" })]);

        let summary = manager.restore_from_backup(backup.id, true).await?;
        assert_eq!(summary.record_count, 3);
        assert_eq!(summary.record_count as i64, backup.record_count);
        assert_eq!(store.count_rows("quotes").await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_rejects_unknown_missing_and_tampered() -> anyhow::Result<()> {
        let (store, blobs, manager) = setup(2);

        let unknown = manager.restore_from_backup(Uuid::new_v4(), true).await.unwrap_err();
        assert!(matches!(unknown, AppError::NotFound(_)));

        let backup = manager.create_backup("before", "cli").await?;
        let key = backup.file_key.clone().unwrap();

        let other = SnapshotDocument::new(vec![crate::store::TableSnapshot {
            table: "quotes".to_string(),
            rows: vec![json!({ "id": 99, "text": "forged" })],
        }]);
        blobs.tamper(&key, snapshot::encode(&other)?.bytes);
        let tampered = manager.restore_from_backup(backup.id, true).await.unwrap_err();
        assert!(matches!(tampered, AppError::Restore(msg) if msg.contains("checksum")));

        blobs.remove_silently(&key);
        let missing = manager.restore_from_backup(backup.id, true).await.unwrap_err();
        assert!(matches!(missing, AppError::Restore(msg) if msg.contains("missing")));

        assert_eq!(store.count_rows("quotes").await?, 2);
        Ok(())
    }
}
