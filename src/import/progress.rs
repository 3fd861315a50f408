// catalogtool/src/import/progress.rs
//! Import job state: the `ImportJob` record, partial updates, and the repository
//! that holds every job of the process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use super::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProgressError {
    #[error("import job not found: {0}")]
    NotFound(JobId),

    #[error("import job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("import job {id} is already {status}")]
    TerminalState { id: JobId, status: JobStatus },

    #[error("import job {id} cannot move from {from} to {to}")]
    InvalidTransition { id: JobId, from: JobStatus, to: JobStatus },

    #[error("import job {0}: processed records would exceed the total")]
    CountOverflow(JobId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: JobId,
    pub data_type: String,
    pub status: JobStatus,
    pub filename: Option<String>,
    pub total_records: u64,
    pub successful_records: u64,
    pub failed_records: u64,
    /// Rows that hit an existing key; included in `successful_records`.
    pub skipped_records: u64,
    /// Rows parked in the unresolved store; not counted as failed.
    pub unresolved_records: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancellation_requested: bool,
}

impl ImportJob {
    pub fn new(id: JobId, data_type: impl Into<String>, total_records: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            data_type: data_type.into(),
            status: JobStatus::Pending,
            filename: None,
            total_records,
            successful_records: 0,
            failed_records: 0,
            skipped_records: 0,
            unresolved_records: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            cancellation_requested: false,
        }
    }

    pub fn with_filename(mut self, filename: Option<String>) -> Self {
        self.filename = filename;
        self
    }

    pub fn processed_records(&self) -> u64 {
        self.successful_records + self.failed_records + self.unresolved_records
    }

    /// Applies `update` atomically: on error the job is left unchanged.
    pub fn apply(&mut self, update: &ProgressUpdate, now: DateTime<Utc>) -> Result<(), ProgressError> {
        if self.status.is_terminal() {
            return Err(ProgressError::TerminalState { id: self.id, status: self.status });
        }
        if let Some(next) = update.status {
            if next.rank() < self.status.rank() {
                return Err(ProgressError::InvalidTransition { id: self.id, from: self.status, to: next });
            }
        }

        let overflow = || ProgressError::CountOverflow(self.id);
        let total = update.total_records.unwrap_or(self.total_records);
        let successful = self.successful_records.checked_add(update.successful_delta).ok_or_else(overflow)?;
        let failed = self.failed_records.checked_add(update.failed_delta).ok_or_else(overflow)?;
        let skipped = self.skipped_records.checked_add(update.skipped_delta).ok_or_else(overflow)?;
        let unresolved = self.unresolved_records.checked_add(update.unresolved_delta).ok_or_else(overflow)?;
        let processed = successful
            .checked_add(failed)
            .and_then(|n| n.checked_add(unresolved))
            .ok_or_else(overflow)?;
        if processed > total || skipped > successful {
            return Err(overflow());
        }

        self.total_records = total;
        self.successful_records = successful;
        self.failed_records = failed;
        self.skipped_records = skipped;
        self.unresolved_records = unresolved;
        self.errors.extend(update.errors.iter().cloned());
        self.warnings.extend(update.warnings.iter().cloned());
        if let Some(requested) = update.cancellation_requested {
            self.cancellation_requested = requested;
        }
        if let Some(next) = update.status {
            self.status = next;
            if next.is_terminal() {
                self.completed_at = Some(now);
            }
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Partial change to a job. Counter fields are deltas; `status`, `total_records`
/// and `cancellation_requested` replace; message lists are appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub status: Option<JobStatus>,
    pub total_records: Option<u64>,
    pub successful_delta: u64,
    pub failed_delta: u64,
    pub skipped_delta: u64,
    pub unresolved_delta: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub cancellation_requested: Option<bool>,
}

impl ProgressUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    /// Terminal failure with one error message.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            errors: vec![message.into()],
            ..Self::default()
        }
    }
}

/// Aggregate counts for dashboards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_records: u64,
    pub successful_records: u64,
    pub failed_records: u64,
}

#[async_trait]
pub trait ProgressRepository: Send + Sync {
    async fn create(&self, job: ImportJob) -> Result<(), ProgressError>;

    async fn get(&self, id: JobId) -> Option<ImportJob>;

    /// Merges `update` into the job and returns the new state.
    async fn update(&self, id: JobId, update: ProgressUpdate) -> Result<ImportJob, ProgressError>;

    /// Newest first.
    async fn list(&self) -> Vec<ImportJob>;

    async fn stats(&self) -> JobStats;

    async fn remove(&self, id: JobId) -> bool;

    /// Deletes terminal jobs completed more than `max_age` ago. Returns their ids.
    async fn cleanup(&self, max_age: Duration) -> Vec<JobId>;

    /// Fails every `processing` job not updated within `timeout`. Returns their ids.
    async fn detect_stuck(&self, timeout: Duration) -> Vec<JobId>;
}

fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct InMemoryProgressRepository {
    jobs: DashMap<JobId, ImportJob>,
}

impl InMemoryProgressRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ProgressRepository for InMemoryProgressRepository {
    async fn create(&self, job: ImportJob) -> Result<(), ProgressError> {
        match self.jobs.entry(job.id) {
            Entry::Occupied(_) => Err(ProgressError::AlreadyExists(job.id)),
            Entry::Vacant(slot) => {
                slot.insert(job);
                Ok(())
            }
        }
    }

    async fn get(&self, id: JobId) -> Option<ImportJob> {
        self.jobs.get(&id).map(|job| job.clone())
    }

    async fn update(&self, id: JobId, update: ProgressUpdate) -> Result<ImportJob, ProgressError> {
        let mut job = self.jobs.get_mut(&id).ok_or(ProgressError::NotFound(id))?;
        job.apply(&update, Utc::now())?;
        Ok(job.clone())
    }

    async fn list(&self) -> Vec<ImportJob> {
        let mut jobs: Vec<ImportJob> = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs
    }

    async fn stats(&self) -> JobStats {
        let mut stats = JobStats::default();
        for entry in self.jobs.iter() {
            let job = entry.value();
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
            stats.total_records += job.total_records;
            stats.successful_records += job.successful_records;
            stats.failed_records += job.failed_records;
        }
        stats
    }

    async fn remove(&self, id: JobId) -> bool {
        self.jobs.remove(&id).is_some()
    }

    async fn cleanup(&self, max_age: Duration) -> Vec<JobId> {
        let now = Utc::now();
        let expired: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|entry| {
                let job = entry.value();
                job.status.is_terminal()
                    && job.completed_at.is_some_and(|done| age(now, done) > max_age)
            })
            .map(|entry| *entry.key())
            .collect();

        for id in &expired {
            self.jobs.remove(id);
        }
        expired
    }

    async fn detect_stuck(&self, timeout: Duration) -> Vec<JobId> {
        let now = Utc::now();
        let mut stuck = Vec::new();
        for mut entry in self.jobs.iter_mut() {
            let job = entry.value_mut();
            if job.status != JobStatus::Processing {
                continue;
            }
            let idle = age(now, job.updated_at);
            if idle <= timeout {
                continue;
            }
            let message = format!(
                "job stuck/timeout: no progress for {}s (limit {}s)",
                idle.as_secs(),
                timeout.as_secs()
            );
            if job.apply(&ProgressUpdate::fail(message), now).is_ok() {
                warn!(job_id = %job.id, idle_secs = idle.as_secs(), "Marked stuck import job as failed");
                stuck.push(job.id);
            }
        }
        stuck
    }
}

/// Read-only view of one job, handed back to whoever started it.
#[derive(Clone)]
pub struct ProgressHandle {
    job_id: JobId,
    repository: Arc<dyn ProgressRepository>,
}

impl ProgressHandle {
    pub fn new(job_id: JobId, repository: Arc<dyn ProgressRepository>) -> Self {
        Self { job_id, repository }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn snapshot(&self) -> Option<ImportJob> {
        self.repository.get(self.job_id).await
    }

    /// Polls until the job is terminal. Fails if the job disappears meanwhile.
    pub async fn wait_until_terminal(&self, poll_interval: Duration) -> Result<ImportJob, ProgressError> {
        loop {
            match self.repository.get(self.job_id).await {
                Some(job) if job.status.is_terminal() => return Ok(job),
                Some(_) => tokio::time::sleep(poll_interval).await,
                None => return Err(ProgressError::NotFound(self.job_id)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn job(total: u64) -> ImportJob {
        ImportJob::new(JobId::new(), "quotes", total)
    }

    #[test]
    fn test_counts_are_additive_and_bounded() {
        let mut job = job(3);
        let now = Utc::now();
        let update = ProgressUpdate { successful_delta: 2, skipped_delta: 1, ..Default::default() };
        job.apply(&update, now).unwrap();
        assert_eq!(job.successful_records, 2);
        assert_eq!(job.skipped_records, 1);

        let too_many = ProgressUpdate { failed_delta: 1, unresolved_delta: 1, ..Default::default() };
        assert_eq!(job.apply(&too_many, now), Err(ProgressError::CountOverflow(job.id)));
        assert_eq!(job.failed_records, 0);
        assert_eq!(job.unresolved_records, 0);
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut job = job(1);
        let now = Utc::now();
        job.apply(&ProgressUpdate::status(JobStatus::Processing), now).unwrap();
        job.apply(&ProgressUpdate::status(JobStatus::Cancelled), now).unwrap();
        assert_eq!(job.completed_at, Some(now));

        let err = job.apply(&ProgressUpdate::status(JobStatus::Processing), now).unwrap_err();
        assert!(matches!(err, ProgressError::TerminalState { status: JobStatus::Cancelled, .. }));
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_status_cannot_move_backwards() {
        let mut job = job(1);
        job.apply(&ProgressUpdate::status(JobStatus::Processing), Utc::now()).unwrap();
        let err = job.apply(&ProgressUpdate::status(JobStatus::Pending), Utc::now()).unwrap_err();
        assert!(matches!(err, ProgressError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_repository_create_update_stats() {
        let repo = InMemoryProgressRepository::new();
        let first = job(10);
        let id = first.id;
        repo.create(first.clone()).await.unwrap();
        assert_eq!(repo.create(first).await, Err(ProgressError::AlreadyExists(id)));

        let updated = repo
            .update(id, ProgressUpdate { successful_delta: 4, failed_delta: 1, ..ProgressUpdate::status(JobStatus::Processing) })
            .await
            .unwrap();
        assert_eq!(updated.successful_records, 4);

        repo.create(job(2)).await.unwrap();
        let stats = repo.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total_records, 12);
        assert_eq!(stats.failed_records, 1);

        let missing = JobId::new();
        assert_eq!(repo.update(missing, ProgressUpdate::default()).await, Err(ProgressError::NotFound(missing)));
    }

    #[tokio::test]
    async fn test_detect_stuck_only_touches_old_processing_jobs() {
        let repo = InMemoryProgressRepository::new();
        let now = Utc::now();

        let mut old = job(5);
        old.status = JobStatus::Processing;
        old.updated_at = now - ChronoDuration::minutes(45);
        let old_id = old.id;

        let mut fresh = job(5);
        fresh.status = JobStatus::Processing;
        let fresh_id = fresh.id;

        let mut old_pending = job(5);
        old_pending.updated_at = now - ChronoDuration::minutes(45);
        let pending_id = old_pending.id;

        for j in [old, fresh, old_pending] {
            repo.create(j).await.unwrap();
        }

        let stuck = repo.detect_stuck(Duration::from_secs(30 * 60)).await;
        assert_eq!(stuck, vec![old_id]);

        let old = repo.get(old_id).await.unwrap();
        assert_eq!(old.status, JobStatus::Failed);
        assert_eq!(old.errors.len(), 1);
        assert!(old.errors[0].contains("stuck/timeout"));
        assert_eq!(repo.get(fresh_id).await.unwrap().status, JobStatus::Processing);
        assert_eq!(repo.get(pending_id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_terminal_jobs() {
        let repo = InMemoryProgressRepository::new();
        let now = Utc::now();

        let mut done_long_ago = job(1);
        done_long_ago.status = JobStatus::Completed;
        done_long_ago.completed_at = Some(now - ChronoDuration::hours(48));
        let old_id = done_long_ago.id;

        let mut done_recently = job(1);
        done_recently.status = JobStatus::Failed;
        done_recently.completed_at = Some(now - ChronoDuration::minutes(5));

        let mut running = job(1);
        running.status = JobStatus::Processing;
        running.started_at = now - ChronoDuration::hours(72);

        for j in [done_long_ago, done_recently, running] {
            repo.create(j).await.unwrap();
        }

        let removed = repo.cleanup(Duration::from_secs(24 * 3600)).await;
        assert_eq!(removed, vec![old_id]);
        assert_eq!(repo.list().await.len(), 2);
        assert!(repo.get(old_id).await.is_none());
    }

    #[tokio::test]
    async fn test_handle_waits_for_terminal_state() {
        let repo: Arc<dyn ProgressRepository> = InMemoryProgressRepository::arc();
        let job = job(0);
        let id = job.id;
        repo.create(job).await.unwrap();

        let handle = ProgressHandle::new(id, repo.clone());
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait_until_terminal(Duration::from_millis(5)).await }
        });
        repo.update(id, ProgressUpdate::status(JobStatus::Completed)).await.unwrap();

        let finished = waiter.await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
    }
}
