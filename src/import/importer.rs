// catalogtool/src/import/importer.rs
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::entities::EntityKind;
use super::progress::{ProgressRepository, ProgressUpdate};
use super::unresolved::UnresolvedRowStore;
use super::JobId;
use crate::errors::{AppError, Result};
use crate::store::{CatalogStore, EntityRecord, StoreError, UpsertOutcome};

/// What happened to one row.
#[derive(Debug, Clone, PartialEq)]
enum RowOutcome {
    Inserted,
    Skipped,
    Unresolved { relation: String },
    Failed(String),
}

/// Totals for one batch, for logging. The authoritative counts live in the
/// progress repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub inserted: u64,
    pub skipped: u64,
    pub unresolved: u64,
    pub failed: u64,
}

/// Upserts validated rows of one entity kind, one row at a time.
///
/// Rows whose parent is missing go to the unresolved store, rows the store
/// rejects are counted as failed, and anything else aborts the batch as a
/// job-level error. Progress is reported after every row.
pub struct EntityImporter {
    kind: EntityKind,
    store: Arc<dyn CatalogStore>,
    progress: Arc<dyn ProgressRepository>,
    unresolved: Arc<dyn UnresolvedRowStore>,
    /// Prepended to error messages, e.g. `[quotes] `, for multi-kind imports.
    label: String,
}

impl EntityImporter {
    pub fn new(
        kind: EntityKind,
        store: Arc<dyn CatalogStore>,
        progress: Arc<dyn ProgressRepository>,
        unresolved: Arc<dyn UnresolvedRowStore>,
    ) -> Self {
        Self { kind, store, progress, unresolved, label: String::new() }
    }

    pub fn labelled(mut self, labelled: bool) -> Self {
        self.label = if labelled { format!("[{}] ", self.kind) } else { String::new() };
        self
    }

    /// `rows` pairs each normalized row with its index in the submission.
    pub async fn import_batch(&self, job_id: JobId, rows: &[(usize, &Value)]) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();

        for (index, row) in rows {
            let outcome = self.import_row(row).await?;
            let update = match &outcome {
                RowOutcome::Inserted => {
                    summary.inserted += 1;
                    ProgressUpdate { successful_delta: 1, ..Default::default() }
                }
                RowOutcome::Skipped => {
                    summary.skipped += 1;
                    ProgressUpdate { successful_delta: 1, skipped_delta: 1, ..Default::default() }
                }
                RowOutcome::Unresolved { relation } => {
                    summary.unresolved += 1;
                    let category = format!("{}.{}", self.kind.table(), relation);
                    self.unresolved.add(job_id, &category, (*row).clone()).await;
                    ProgressUpdate { unresolved_delta: 1, ..Default::default() }
                }
                RowOutcome::Failed(reason) => {
                    summary.failed += 1;
                    ProgressUpdate {
                        failed_delta: 1,
                        errors: vec![format!("{}record {}: {}", self.label, index, reason)],
                        ..Default::default()
                    }
                }
            };
            self.progress.update(job_id, update).await?;
        }

        debug!(
            job_id = %job_id,
            kind = %self.kind,
            inserted = summary.inserted,
            skipped = summary.skipped,
            unresolved = summary.unresolved,
            failed = summary.failed,
            "Batch imported"
        );
        Ok(summary)
    }

    async fn import_row(&self, row: &Value) -> Result<RowOutcome> {
        let Value::Object(map) = row else {
            return Ok(RowOutcome::Failed("expected an object".to_string()));
        };
        let mut record = self.kind.to_record(map);

        if let Some(outcome) = self.resolve_parents(&mut record).await? {
            return Ok(outcome);
        }

        match self.store.upsert(&record).await {
            Ok(UpsertOutcome::Inserted) => Ok(RowOutcome::Inserted),
            Ok(UpsertOutcome::Skipped) => Ok(RowOutcome::Skipped),
            Err(err) => self.classify(&record, err),
        }
    }

    /// Looks up every parent; the first missing one decides the outcome.
    async fn resolve_parents(&self, record: &mut EntityRecord) -> Result<Option<RowOutcome>> {
        let parents = std::mem::take(&mut record.parents);
        for parent in &parents {
            match self.store.lookup(parent).await {
                Ok(Some(id)) => {
                    if let Some(column) = parent.assign_to {
                        record.columns.insert(column.to_string(), id);
                    }
                }
                Ok(None) => {
                    return Ok(Some(RowOutcome::Unresolved { relation: parent.relation.to_string() }));
                }
                Err(err) => return self.classify(record, err).map(Some),
            }
        }
        record.parents = parents;
        Ok(None)
    }

    fn classify(&self, record: &EntityRecord, err: StoreError) -> Result<RowOutcome> {
        match err {
            StoreError::MissingParent { relation, .. } => Ok(RowOutcome::Unresolved { relation }),
            StoreError::Rejected(reason) => Ok(RowOutcome::Failed(format!(
                "{}: {}",
                record.key_description(),
                reason
            ))),
            fatal => Err(AppError::Store(fatal)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::progress::{ImportJob, InMemoryProgressRepository, JobStatus};
    use crate::import::unresolved::InMemoryUnresolvedRowStore;
    use crate::store::MemoryCatalogStore;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryCatalogStore>,
        progress: Arc<InMemoryProgressRepository>,
        unresolved: Arc<InMemoryUnresolvedRowStore>,
        job_id: JobId,
    }

    async fn fixture(total: u64) -> Fixture {
        let progress = InMemoryProgressRepository::arc();
        let job_id = JobId::new();
        progress.create(ImportJob::new(job_id, "quotes", total)).await.unwrap();
        progress.update(job_id, ProgressUpdate::status(JobStatus::Processing)).await.unwrap();
        Fixture {
            store: Arc::new(MemoryCatalogStore::new()),
            progress,
            unresolved: Arc::new(InMemoryUnresolvedRowStore::new()),
            job_id,
        }
    }

    fn importer(f: &Fixture, kind: EntityKind) -> EntityImporter {
        EntityImporter::new(kind, f.store.clone(), f.progress.clone(), f.unresolved.clone())
    }

    fn indexed(rows: &[Value]) -> Vec<(usize, &Value)> {
        rows.iter().enumerate().collect()
    }

    #[tokio::test]
    async fn test_quotes_link_to_existing_author() -> anyhow::Result<()> {
        let f = fixture(2).await;
        f.store.seed("authors", vec![json!({ "id": 5, "name": "Seneca" })]);
        let rows = vec![
            json!({ "text": "Luck is what happens when preparation meets opportunity.", "author": "seneca" }),
            json!({ "text": "We suffer more in imagination than in reality." }),
        ];

        let summary = importer(&f, EntityKind::Quotes).import_batch(f.job_id, &indexed(&rows)).await?;
        assert_eq!(summary.inserted, 2);

        let quotes = f.store.rows("quotes");
        assert_eq!(quotes[0]["author_id"], json!(5));
        assert!(quotes[0].get("author").is_none());
        assert!(quotes[1].get("author_id").is_none());

        let job = f.progress.get(f.job_id).await.unwrap();
        assert_eq!(job.successful_records, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_parent_goes_to_unresolved_not_failed() -> anyhow::Result<()> {
        let f = fixture(2).await;
        let rows = vec![
            json!({ "text": "Orphan", "author": "Nobody" }),
            json!({ "quote_id": 404, "tag": "lost" }),
        ];

        importer(&f, EntityKind::Quotes).import_batch(f.job_id, &[(0, &rows[0])]).await?;
        importer(&f, EntityKind::Tags).import_batch(f.job_id, &[(0, &rows[1])]).await?;

        let job = f.progress.get(f.job_id).await.unwrap();
        assert_eq!(job.failed_records, 0);
        assert_eq!(job.unresolved_records, 2);
        assert!(job.errors.is_empty());

        let parked = f.unresolved.get(f.job_id).await;
        assert_eq!(parked["quotes.author"], vec![rows[0].clone()]);
        assert_eq!(parked["quote_tags.quote"], vec![rows[1].clone()]);
        assert_eq!(f.store.count_rows("quotes").await.unwrap_or(0), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_reimport_skips_existing_rows() -> anyhow::Result<()> {
        let f = fixture(4).await;
        let rows = vec![json!({ "name": "Ada" }), json!({ "name": "Grace" })];
        let importer = importer(&f, EntityKind::Authors);

        importer.import_batch(f.job_id, &indexed(&rows)).await?;
        let second = importer.import_batch(f.job_id, &indexed(&rows)).await?;
        assert_eq!(second.skipped, 2);
        assert_eq!(f.store.rows("authors").len(), 2);

        let job = f.progress.get(f.job_id).await.unwrap();
        assert_eq!(job.successful_records, 4);
        assert_eq!(job.skipped_records, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_row_fails_with_key_and_batch_continues() -> anyhow::Result<()> {
        let f = fixture(3).await;
        f.store.reject_when("messages", "body", json!("spam"));
        let rows = vec![
            json!({ "email": "a@example.com", "body": "hello" }),
            json!({ "email": "b@example.com", "body": "spam" }),
            json!({ "email": "c@example.com", "body": "bye" }),
        ];

        let summary = importer(&f, EntityKind::Messages)
            .labelled(true)
            .import_batch(f.job_id, &indexed(&rows))
            .await?;
        assert_eq!(summary, BatchSummary { inserted: 2, skipped: 0, unresolved: 0, failed: 1 });

        let job = f.progress.get(f.job_id).await.unwrap();
        assert_eq!(job.failed_records, 1);
        assert_eq!(job.errors.len(), 1);
        assert!(job.errors[0].starts_with("[messages] record 1: email=\"b@example.com\""));
        Ok(())
    }

    #[tokio::test]
    async fn test_store_outage_aborts_batch() {
        let f = fixture(1).await;
        f.store.set_unavailable(true);
        let rows = vec![json!({ "name": "Ada" })];

        let result = importer(&f, EntityKind::Authors).import_batch(f.job_id, &indexed(&rows)).await;
        assert!(matches!(result, Err(AppError::Store(StoreError::Unavailable(_)))));
        let job = f.progress.get(f.job_id).await.unwrap();
        assert_eq!(job.processed_records(), 0);
    }
}
