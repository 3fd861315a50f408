use thiserror::Error;

use crate::import::progress::ProgressError;
use crate::storage::BlobError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Blob storage error: {0}")]
    Storage(#[from] BlobError),

    #[error("Progress tracking error: {0}")]
    Progress(#[from] ProgressError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Restore of backup {0} requires explicit confirmation")]
    ConfirmationRequired(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backup operation failed: {0}")]
    Backup(String),

    #[error("Restore operation failed: {0}")]
    Restore(String),

    #[error("Import job failed: {0}")]
    Fatal(String),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
