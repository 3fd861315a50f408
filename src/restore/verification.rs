// catalogtool/src/restore/verification.rs
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup::snapshot;
use crate::backup::BackupManager;
use crate::errors::Result;
use crate::storage::BlobError;
use crate::store::BackupRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Verified,
    /// The snapshot decodes but disagrees with its stored metadata.
    Mismatch { reasons: Vec<String> },
    /// The blob exists but cannot be decoded.
    Corrupt { reason: String },
    /// There is no blob to check.
    Missing { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub backup_id: Uuid,
    pub expected_records: i64,
    pub actual_records: Option<u64>,
    pub checksum_matches: Option<bool>,
    #[serde(flatten)]
    pub outcome: VerificationOutcome,
}

impl VerificationReport {
    pub fn is_verified(&self) -> bool {
        self.outcome == VerificationOutcome::Verified
    }

    fn without_snapshot(record: &BackupRecord, outcome: VerificationOutcome) -> Self {
        Self {
            backup_id: record.id,
            expected_records: record.record_count,
            actual_records: None,
            checksum_matches: None,
            outcome,
        }
    }
}

impl BackupManager {
    /// Checks that a backup's blob is readable and agrees with its record.
    /// Read only: neither the blob, the record nor the catalogue change.
    ///
    /// An unknown id is an error; every problem with the snapshot itself is
    /// reported through the outcome.
    pub async fn verify_backup(&self, id: Uuid) -> Result<VerificationReport> {
        let record = self.get_backup(id).await?;

        let Some(key) = record.file_key.as_deref() else {
            let reason = "backup has no snapshot file".to_string();
            return Ok(VerificationReport::without_snapshot(&record, VerificationOutcome::Missing { reason }));
        };

        let bytes = match self.blobs.get(key).await {
            Ok(bytes) => bytes,
            Err(BlobError::NotFound(_)) => {
                warn!(backup_id = %id, key, "Snapshot missing during verification");
                let reason = format!("snapshot {} not found", key);
                return Ok(VerificationReport::without_snapshot(&record, VerificationOutcome::Missing { reason }));
            }
            Err(e) => {
                warn!(backup_id = %id, key, error = %e, "Snapshot unreadable during verification");
                let outcome = VerificationOutcome::Missing { reason: e.to_string() };
                return Ok(VerificationReport::without_snapshot(&record, outcome));
            }
        };

        let (document, checksum) = match snapshot::decode(&bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(backup_id = %id, error = %e, "Snapshot failed to decode");
                let outcome = VerificationOutcome::Corrupt { reason: e.to_string() };
                return Ok(VerificationReport::without_snapshot(&record, outcome));
            }
        };

        let actual = document.counted_rows();
        let checksum_matches = record.checksum.as_ref().map(|expected| expected == &checksum);

        let mut reasons = Vec::new();
        if actual as i64 != record.record_count {
            reasons.push(format!(
                "record count: expected {}, snapshot holds {}",
                record.record_count, actual
            ));
        }
        if document.record_count != actual {
            reasons.push(format!(
                "snapshot header claims {} records but holds {}",
                document.record_count, actual
            ));
        }
        if checksum_matches == Some(false) {
            reasons.push("checksum does not match".to_string());
        }
        if bytes.len() as i64 != record.size_bytes {
            reasons.push(format!(
                "size: expected {} bytes, found {}",
                record.size_bytes,
                bytes.len()
            ));
        }
        if document.table_names() != record.tables {
            reasons.push(format!(
                "tables: expected {:?}, snapshot has {:?}",
                record.tables,
                document.table_names()
            ));
        }

        let outcome = if reasons.is_empty() {
            info!(backup_id = %id, records = actual, "✓ Backup verified");
            VerificationOutcome::Verified
        } else {
            warn!(backup_id = %id, ?reasons, "Backup failed verification");
            VerificationOutcome::Mismatch { reasons }
        };

        Ok(VerificationReport {
            backup_id: id,
            expected_records: record.record_count,
            actual_records: Some(actual),
            checksum_matches,
            outcome,
        })
    }
}
