// catalogtool/src/import/scheduler.rs
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle};
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use super::progress::{ProgressError, ProgressRepository, ProgressUpdate};
use super::JobId;
use crate::errors::AppError;

/// Runs import work detached from the caller.
///
/// Inside a tokio runtime tasks go onto a `TaskTracker` so `drain` can keep the
/// process alive until they finish. Without a runtime the task gets its own
/// thread and current-thread runtime. A task that returns an error or panics
/// marks its job failed; nothing propagates back to the caller.
#[derive(Clone)]
pub struct BackgroundScheduler {
    tracker: TaskTracker,
    progress: Arc<dyn ProgressRepository>,
}

impl BackgroundScheduler {
    pub fn new(progress: Arc<dyn ProgressRepository>) -> Self {
        Self { tracker: TaskTracker::new(), progress }
    }

    pub fn schedule<F>(&self, job_id: JobId, task: F)
    where
        F: Future<Output = Result<(), AppError>> + Send + 'static,
    {
        let progress = self.progress.clone();
        let supervised = self.tracker.track_future(async move {
            let message = match tokio::spawn(task).await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("import aborted: {}", err)),
                Err(join_err) if join_err.is_panic() => Some(format!(
                    "import task panicked: {}",
                    panic_message(join_err.into_panic())
                )),
                Err(join_err) => Some(format!("import task was aborted: {}", join_err)),
            };
            if let Some(message) = message {
                mark_failed(progress.as_ref(), job_id, message).await;
            }
        });

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(supervised);
            }
            Err(_) => {
                debug!(job_id = %job_id, "No tokio runtime; running import on a dedicated thread");
                std::thread::spawn(move || match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime.block_on(supervised),
                    Err(e) => error!(job_id = %job_id, error = %e, "Failed to start runtime for import"),
                });
            }
        }
    }

    /// Number of scheduled tasks still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits for every scheduled task, then accepts new work again.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

async fn mark_failed(progress: &dyn ProgressRepository, job_id: JobId, message: String) {
    match progress.update(job_id, ProgressUpdate::fail(message.clone())).await {
        Ok(_) => error!(job_id = %job_id, error = %message, "Import job failed"),
        // Already finalized by the task itself.
        Err(ProgressError::TerminalState { .. }) => {
            debug!(job_id = %job_id, error = %message, "Task error after job was finalized")
        }
        Err(e) => error!(job_id = %job_id, error = %e, "Could not record import failure"),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
