// catalogtool/src/import/coordinator.rs
//! Orchestrates an import job from kickoff to its terminal state.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::entities::EntityKind;
use super::importer::EntityImporter;
use super::payload::{self, EntityRows};
use super::progress::{
    ImportJob, JobStats, JobStatus, ProgressError, ProgressHandle, ProgressRepository,
    ProgressUpdate,
};
use super::scheduler::BackgroundScheduler;
use super::unresolved::{UnresolvedExport, UnresolvedRowStore};
use super::validator;
use super::{DataType, ImportRequest, JobId};
use crate::config::ImportSettings;
use crate::errors::{AppError, Result};
use crate::store::{CatalogStore, ExportCounts, ExportLogEntry, ExportOperation, MetadataStore};

/// Returned by `start_import` before any row is processed.
#[derive(Clone)]
pub struct ImportHandle {
    pub job_id: JobId,
    /// Audit log entry, when it could be recorded.
    pub audit_id: Option<Uuid>,
    pub progress: ProgressHandle,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub removed: Vec<JobId>,
    pub stuck: Vec<JobId>,
}

/// How the batch loop ended when no fatal error occurred.
enum RunEnd {
    Exhausted,
    Cancelled,
}

/// Everything `run` needs, captured at kickoff.
struct JobPlan {
    job_id: JobId,
    groups: Vec<EntityRows>,
    batch_size: usize,
    max_failure_ratio: Option<f64>,
    labelled: bool,
    audit_id: Option<Uuid>,
    token: CancellationToken,
}

pub struct ImportCoordinator {
    store: Arc<dyn CatalogStore>,
    metadata: Arc<dyn MetadataStore>,
    progress: Arc<dyn ProgressRepository>,
    unresolved: Arc<dyn UnresolvedRowStore>,
    scheduler: BackgroundScheduler,
    settings: ImportSettings,
    cancellations: DashMap<JobId, CancellationToken>,
}

impl ImportCoordinator {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        metadata: Arc<dyn MetadataStore>,
        progress: Arc<dyn ProgressRepository>,
        unresolved: Arc<dyn UnresolvedRowStore>,
        settings: ImportSettings,
    ) -> Self {
        let scheduler = BackgroundScheduler::new(progress.clone());
        Self {
            store,
            metadata,
            progress,
            unresolved,
            scheduler,
            settings,
            cancellations: DashMap::new(),
        }
    }

    /// Registers a pending job and hands it to the scheduler. Returns as soon as
    /// the job exists; malformed payloads are rejected here, before any job is
    /// created.
    pub async fn start_import(self: &Arc<Self>, request: ImportRequest, actor: &str) -> Result<ImportHandle> {
        let groups = payload::decode(request.data_type, request.format, &request.payload)?;
        let total: usize = groups.iter().map(|(_, rows)| rows.len()).sum();

        let batch_size = request.options.batch_size.unwrap_or(self.settings.batch_size);
        if batch_size == 0 {
            return Err(AppError::Validation("batch_size must be greater than zero".to_string()));
        }
        let max_failure_ratio = request.options.max_failure_ratio.or(self.settings.max_failure_ratio);
        if max_failure_ratio.is_some_and(|r| !(0.0..=1.0).contains(&r)) {
            return Err(AppError::Validation("max_failure_ratio must be between 0.0 and 1.0".to_string()));
        }

        let job_id = JobId::new();
        let job = ImportJob::new(job_id, request.data_type.to_string(), total as u64)
            .with_filename(request.filename.clone());
        self.progress.create(job).await?;

        let audit_id = self.record_audit(&request, actor, total).await;

        let token = CancellationToken::new();
        self.cancellations.insert(job_id, token.clone());

        let plan = JobPlan {
            job_id,
            groups,
            batch_size,
            max_failure_ratio,
            labelled: request.data_type == DataType::Full,
            audit_id,
            token,
        };

        info!(
            job_id = %job_id,
            data_type = %request.data_type,
            format = %request.format,
            total,
            actor,
            "Import job queued"
        );

        let coordinator = Arc::clone(self);
        self.scheduler.schedule(job_id, async move {
            coordinator.run(plan).await.map(|_| ())
        });

        Ok(ImportHandle {
            job_id,
            audit_id,
            progress: ProgressHandle::new(job_id, self.progress.clone()),
        })
    }

    /// Best-effort: a failing audit insert only logs a warning.
    async fn record_audit(&self, request: &ImportRequest, actor: &str, total: usize) -> Option<Uuid> {
        let options = serde_json::json!({
            "batch_size": request.options.batch_size,
            "max_failure_ratio": request.options.max_failure_ratio,
            "filename": request.filename,
        });
        let mut entry = ExportLogEntry::new(
            ExportOperation::Import,
            request.format.to_string(),
            request.data_type.to_string(),
            actor,
            options,
        );
        entry.record_count = total as i64;

        match self.metadata.insert_export_log(&entry).await {
            Ok(()) => Some(entry.id),
            Err(e) => {
                warn!(error = %e, "Could not record import audit entry; continuing");
                None
            }
        }
    }

    /// Drives a queued job to a terminal state. Fatal errors are recorded on the
    /// job (once) rather than returned; `Err` only means the final state could
    /// not be written.
    async fn run(&self, plan: JobPlan) -> Result<JobStatus> {
        let job_id = plan.job_id;
        let outcome = match self.progress.update(job_id, ProgressUpdate::status(JobStatus::Processing)).await {
            Ok(_) => self.process(&plan).await,
            // Cancelled before it started.
            Err(ProgressError::TerminalState { status, .. }) => {
                self.cancellations.remove(&job_id);
                return Ok(status);
            }
            Err(e) => Err(e.into()),
        };

        let final_update = match outcome {
            Ok(RunEnd::Cancelled) => ProgressUpdate::status(JobStatus::Cancelled),
            Ok(RunEnd::Exhausted) => {
                let job = self.progress.get(job_id).await.ok_or(ProgressError::NotFound(job_id))?;
                if within_tolerance(&job, plan.max_failure_ratio) {
                    ProgressUpdate::status(JobStatus::Completed)
                } else {
                    ProgressUpdate::fail(format!(
                        "{} of {} records failed, above the allowed failure ratio",
                        job.failed_records, job.total_records
                    ))
                }
            }
            Err(AppError::Progress(ProgressError::TerminalState { status, .. })) => {
                // Finalized elsewhere, e.g. by stuck-job detection.
                self.cancellations.remove(&job_id);
                return Ok(status);
            }
            Err(e) => ProgressUpdate::fail(format!("fatal error: {}", e)),
        };

        let result = self.progress.update(job_id, final_update).await;
        self.cancellations.remove(&job_id);
        let job = match result {
            Ok(job) => job,
            Err(ProgressError::TerminalState { status, .. }) => return Ok(status),
            Err(e) => return Err(e.into()),
        };

        info!(
            job_id = %job_id,
            status = %job.status,
            total = job.total_records,
            successful = job.successful_records,
            skipped = job.skipped_records,
            failed = job.failed_records,
            unresolved = job.unresolved_records,
            "✓ Import job finished"
        );

        if let Some(audit_id) = plan.audit_id {
            let counts = ExportCounts {
                record_count: job.total_records as i64,
                successful: job.successful_records as i64,
                failed: job.failed_records as i64,
            };
            if let Err(e) = self.metadata.update_export_log(audit_id, job.status.as_str(), counts).await {
                warn!(job_id = %job_id, error = %e, "Could not update import audit entry");
            }
        }
        Ok(job.status)
    }

    /// Validates and imports every batch in dependency order, checking for
    /// cancellation before the first batch and after each one.
    async fn process(&self, plan: &JobPlan) -> Result<RunEnd> {
        if plan.token.is_cancelled() {
            return Ok(RunEnd::Cancelled);
        }

        for (kind, rows) in &plan.groups {
            let importer = EntityImporter::new(
                *kind,
                self.store.clone(),
                self.progress.clone(),
                self.unresolved.clone(),
            )
            .labelled(plan.labelled);
            let label = if plan.labelled { format!("[{}] ", kind) } else { String::new() };
            let normalized: Vec<Value> = rows.iter().map(|row| kind.normalize(row)).collect();

            // Batches only see their own rows, so collisions are found over the whole group.
            let duplicates = validator::duplicate_warnings(*kind, &normalized);
            if !duplicates.is_empty() {
                let update = ProgressUpdate {
                    warnings: duplicates.iter().map(|w| format!("{}{}", label, w)).collect(),
                    ..Default::default()
                };
                self.progress.update(plan.job_id, update).await?;
            }

            for (batch_index, chunk) in normalized.chunks(plan.batch_size).enumerate() {
                let offset = batch_index * plan.batch_size;
                self.import_chunk(plan.job_id, *kind, &importer, &label, chunk, offset).await?;

                if plan.token.is_cancelled() {
                    info!(job_id = %plan.job_id, kind = %kind, "Import cancelled at batch boundary");
                    return Ok(RunEnd::Cancelled);
                }
            }
        }
        Ok(RunEnd::Exhausted)
    }

    async fn import_chunk(
        &self,
        job_id: JobId,
        kind: EntityKind,
        importer: &EntityImporter,
        label: &str,
        chunk: &[Value],
        offset: usize,
    ) -> Result<()> {
        let validation = validator::check_schema(kind, chunk, offset);
        if validation.error_count > 0 || validation.warning_count > 0 {
            let update = ProgressUpdate {
                failed_delta: validation.invalid_records.len() as u64,
                errors: validation.errors.iter().map(|e| format!("{}{}", label, e)).collect(),
                warnings: validation.warnings.iter().map(|w| format!("{}{}", label, w)).collect(),
                ..Default::default()
            };
            self.progress.update(job_id, update).await?;
        }

        let valid: Vec<(usize, &Value)> = chunk
            .iter()
            .enumerate()
            .map(|(position, row)| (offset + position, row))
            .filter(|(index, _)| validation.is_record_valid(*index))
            .collect();
        importer.import_batch(job_id, &valid).await?;
        Ok(())
    }

    pub async fn progress(&self, job_id: JobId) -> Result<ImportJob> {
        self.progress
            .get(job_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("import job {}", job_id)))
    }

    /// Idempotent. A terminal job is returned unchanged.
    pub async fn request_cancel(&self, job_id: JobId) -> Result<ImportJob> {
        let job = self.progress(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        if let Some(token) = self.cancellations.get(&job_id) {
            token.cancel();
        }
        let update = ProgressUpdate { cancellation_requested: Some(true), ..Default::default() };
        match self.progress.update(job_id, update).await {
            Ok(job) => {
                info!(job_id = %job_id, "Cancellation requested");
                Ok(job)
            }
            // Finished while we were asking.
            Err(ProgressError::TerminalState { .. }) => self.progress(job_id).await,
            Err(e) => Err(e.into()),
        }
    }

    pub async fn export_unresolved(&self, job_id: JobId) -> Result<UnresolvedExport> {
        self.progress(job_id).await?;
        Ok(UnresolvedExport::new(job_id, self.unresolved.get(job_id).await))
    }

    pub async fn clear_unresolved(&self, job_id: JobId) -> Result<()> {
        self.progress(job_id).await?;
        self.unresolved.clear(job_id).await;
        Ok(())
    }

    pub async fn list_jobs(&self) -> Vec<ImportJob> {
        self.progress.list().await
    }

    pub async fn stats(&self) -> JobStats {
        self.progress.stats().await
    }

    /// Retention cleanup plus stuck-job recovery, using the configured windows.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let stuck = self.progress.detect_stuck(self.settings.stuck_timeout).await;
        for id in &stuck {
            if let Some((_, token)) = self.cancellations.remove(id) {
                token.cancel();
            }
        }

        let removed = self.progress.cleanup(self.settings.job_retention).await;
        for id in &removed {
            self.unresolved.clear(*id).await;
        }

        if !stuck.is_empty() || !removed.is_empty() {
            info!(stuck = stuck.len(), removed = removed.len(), "✓ Import maintenance completed");
        }
        MaintenanceReport { removed, stuck }
    }

    /// Removes a job and its unresolved rows. Running jobs are cancelled first.
    pub async fn purge(&self, job_id: JobId) -> Result<()> {
        if let Some((_, token)) = self.cancellations.remove(&job_id) {
            token.cancel();
        }
        if !self.progress.remove(job_id).await {
            return Err(AppError::NotFound(format!("import job {}", job_id)));
        }
        self.unresolved.clear(job_id).await;
        Ok(())
    }

    pub fn scheduler(&self) -> &BackgroundScheduler {
        &self.scheduler
    }

    /// Waits for every scheduled import to finish.
    pub async fn drain(&self) {
        self.scheduler.drain().await;
    }
}

/// `Some(r)`: failed/total must not exceed `r`. `None`: only an import where
/// every record failed is a failure.
fn within_tolerance(job: &ImportJob, max_failure_ratio: Option<f64>) -> bool {
    if job.total_records == 0 {
        return true;
    }
    match max_failure_ratio {
        Some(ratio) => (job.failed_records as f64 / job.total_records as f64) <= ratio,
        None => job.failed_records < job.total_records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::progress::InMemoryProgressRepository;
    use crate::import::unresolved::InMemoryUnresolvedRowStore;
    use crate::import::{ImportFormat, ImportOptions, ImportPayload};
    use crate::store::MemoryCatalogStore;
    use serde_json::json;
    use std::time::Duration;

    fn coordinator_with(store: Arc<MemoryCatalogStore>, settings: ImportSettings) -> Arc<ImportCoordinator> {
        Arc::new(ImportCoordinator::new(
            store.clone(),
            store,
            InMemoryProgressRepository::arc(),
            Arc::new(InMemoryUnresolvedRowStore::new()),
            settings,
        ))
    }

    async fn finish(handle: &ImportHandle) -> ImportJob {
        tokio::time::timeout(Duration::from_secs(5), handle.progress.wait_until_terminal(Duration::from_millis(5)))
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_tolerance_policy() {
        let mut job = ImportJob::new(JobId::new(), "quotes", 10);
        job.failed_records = 2;
        assert!(within_tolerance(&job, Some(0.2)));
        assert!(!within_tolerance(&job, Some(0.1)));
        assert!(within_tolerance(&job, None));
        job.failed_records = 10;
        assert!(!within_tolerance(&job, None));
        assert!(within_tolerance(&ImportJob::new(JobId::new(), "quotes", 0), None));
    }

    #[tokio::test]
    async fn test_full_import_resolves_in_dependency_order() -> anyhow::Result<()> {
        let store = Arc::new(MemoryCatalogStore::new());
        let coordinator = coordinator_with(store.clone(), ImportSettings::default());
        // Children listed before parents on purpose.
        let payload = json!({
            "quotes": [{ "id": 1, "text": "Know thyself", "author": "Socrates", "source": "Apology" }],
            "tags": [{ "quote_id": 1, "tag": "wisdom" }],
            "references": [{ "title": "Apology", "type": "book" }],
            "authors": [{ "name": "Socrates" }]
        });

        let handle = coordinator.start_import(ImportRequest::json(DataType::Full, payload), "tester").await?;
        let job = finish(&handle).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total_records, 4);
        assert_eq!(job.successful_records, 4);
        assert_eq!(job.unresolved_records, 0);
        assert_eq!(store.rows("quotes")[0]["author_id"], json!(1));
        assert_eq!(store.rows("quotes")[0]["reference_id"], json!(1));
        assert_eq!(store.rows("quote_tags").len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_full_import_errors_are_labelled() -> anyhow::Result<()> {
        let store = Arc::new(MemoryCatalogStore::new());
        let coordinator = coordinator_with(store, ImportSettings::default());
        let payload = json!({ "authors": [{ "name": "Ada" }, { "bio": "no name" }] });

        let handle = coordinator.start_import(ImportRequest::json(DataType::Full, payload), "tester").await?;
        let job = finish(&handle).await;
        assert_eq!(job.errors, vec!["[authors] record 1: name: required field is missing".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicates_across_batches_are_warned() -> anyhow::Result<()> {
        let store = Arc::new(MemoryCatalogStore::new());
        let coordinator = coordinator_with(store, ImportSettings::default());
        let payload = json!([{ "name": "Ada" }, { "name": "ada" }]);
        let request = ImportRequest::json(DataType::Entity(EntityKind::Authors), payload.clone())
            .with_options(ImportOptions { batch_size: Some(1), ..Default::default() });

        let job = finish(&coordinator.start_import(request, "tester").await?).await;
        let preview = validator::validate_only(EntityKind::Authors, &payload);

        assert_eq!(job.status, JobStatus::Completed);
        assert!(!job.warnings.is_empty());
        assert_eq!(job.warnings, preview.result.warnings);
        assert_eq!(job.skipped_records, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_csv_import() -> anyhow::Result<()> {
        let store = Arc::new(MemoryCatalogStore::new());
        let coordinator = coordinator_with(store.clone(), ImportSettings::default());
        let request = ImportRequest {
            data_type: DataType::Entity(EntityKind::Collections),
            payload: ImportPayload::Text("name,public\nFavourites,yes\nStoics,no\n".to_string()),
            format: ImportFormat::Csv,
            options: ImportOptions::default(),
            filename: Some("collections.csv".to_string()),
        };

        let handle = coordinator.start_import(request, "tester").await?;
        let job = finish(&handle).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.filename.as_deref(), Some("collections.csv"));
        assert_eq!(store.rows("collections")[0]["is_public"], json!(true));
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_ratio_fails_job() -> anyhow::Result<()> {
        let store = Arc::new(MemoryCatalogStore::new());
        let coordinator = coordinator_with(store, ImportSettings::default());
        let payload = json!([{ "name": "Ada" }, {}, {}, {}]);
        let request = ImportRequest::json(DataType::Entity(EntityKind::Authors), payload)
            .with_options(ImportOptions { max_failure_ratio: Some(0.5), ..Default::default() });

        let job = finish(&coordinator.start_import(request, "tester").await?).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_records, 3);
        assert!(job.errors.last().unwrap().contains("3 of 4 records failed"));
        Ok(())
    }

    #[tokio::test]
    async fn test_store_outage_is_fatal_and_recorded_once() -> anyhow::Result<()> {
        let store = Arc::new(MemoryCatalogStore::new());
        let coordinator = coordinator_with(store.clone(), ImportSettings::default());
        let payload = json!([{ "name": "Ada" }, { "name": "Grace" }]);
        // Audit insert fails too, which must not block the import.
        store.set_unavailable(true);

        let handle = coordinator
            .start_import(ImportRequest::json(DataType::Entity(EntityKind::Authors), payload), "tester")
            .await?;
        let job = finish(&handle).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors.len(), 1);
        assert!(job.errors[0].starts_with("fatal error:"));
        assert_eq!(job.successful_records, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_payload_rejected_synchronously() {
        let store = Arc::new(MemoryCatalogStore::new());
        let coordinator = coordinator_with(store, ImportSettings::default());
        let request = ImportRequest::json(DataType::Entity(EntityKind::Quotes), json!("just a string"));

        let err = coordinator.start_import(request, "tester").await.err().unwrap();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(coordinator.list_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_audit_entry_is_finalized() -> anyhow::Result<()> {
        let store = Arc::new(MemoryCatalogStore::new());
        let coordinator = coordinator_with(store.clone(), ImportSettings::default());
        let payload = json!([{ "name": "Ada" }, { "name": "" }]);
        let handle = coordinator
            .start_import(ImportRequest::json(DataType::Entity(EntityKind::Authors), payload), "admin")
            .await?;
        finish(&handle).await;
        coordinator.drain().await;

        let entry = store.get_export_log(handle.audit_id.unwrap()).await?.unwrap();
        assert_eq!(entry.operation, ExportOperation::Import);
        assert_eq!(entry.actor, "admin");
        assert_eq!(entry.data_type, "authors");
        assert_eq!(entry.status, "completed");
        assert_eq!(entry.record_count, 2);
        assert_eq!(entry.successful_count, 1);
        assert_eq!(entry.failed_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_not_found() {
        let store = Arc::new(MemoryCatalogStore::new());
        let coordinator = coordinator_with(store, ImportSettings::default());
        let err = coordinator.request_cancel(JobId::new()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_maintenance_removes_expired_jobs_and_their_rows() -> anyhow::Result<()> {
        let store = Arc::new(MemoryCatalogStore::new());
        let settings = ImportSettings { job_retention: Duration::ZERO, ..ImportSettings::default() };
        let coordinator = coordinator_with(store, settings);
        let payload = json!([{ "quote_id": 3, "user_id": "u1" }]);

        let handle = coordinator
            .start_import(ImportRequest::json(DataType::Entity(EntityKind::Likes), payload), "tester")
            .await?;
        finish(&handle).await;
        coordinator.drain().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = coordinator.run_maintenance().await;
        assert_eq!(report.removed, vec![handle.job_id]);
        assert!(report.stuck.is_empty());
        assert!(coordinator.list_jobs().await.is_empty());
        assert_eq!(coordinator.stats().await.total, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unresolved_rows_export_and_purge() -> anyhow::Result<()> {
        let store = Arc::new(MemoryCatalogStore::new());
        let coordinator = coordinator_with(store, ImportSettings::default());
        let payload = json!([
            { "quote_id": 7, "user_id": "u1" },
            { "quote_id": 8, "user_id": "u2" }
        ]);

        let handle = coordinator
            .start_import(ImportRequest::json(DataType::Entity(EntityKind::Likes), payload), "tester")
            .await?;
        let job = finish(&handle).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.unresolved_records, 2);
        assert_eq!(job.failed_records, 0);

        let export = coordinator.export_unresolved(handle.job_id).await?;
        assert_eq!(export.total_rows, 2);
        assert_eq!(export.categories["likes.quote"].len(), 2);

        coordinator.purge(handle.job_id).await?;
        assert!(matches!(coordinator.progress(handle.job_id).await, Err(AppError::NotFound(_))));
        assert!(matches!(coordinator.purge(handle.job_id).await, Err(AppError::NotFound(_))));
        Ok(())
    }
}
