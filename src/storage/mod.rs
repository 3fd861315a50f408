//! Blob storage for backup snapshots.
//!
//! Production uses an S3-compatible bucket (DigitalOcean Spaces); without S3
//! settings snapshots go to a local directory. `MemoryBlobStore` backs the tests.

pub mod local;
pub mod memory;
pub mod s3;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::config::AppConfig;

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;
pub use s3::S3BlobStore;

const DEFAULT_LOCAL_DIR: &str = "./backups";

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("blob storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes `bytes` under `key`, replacing any existing object.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    /// Deleting a key that does not exist is not an error.
    async fn delete(&self, key: &str) -> Result<(), BlobError>;

    /// Human readable location for log lines.
    fn describe(&self) -> String;
}

/// Picks S3 when it is fully configured, otherwise the local backup directory.
pub async fn from_config(config: &AppConfig) -> Arc<dyn BlobStore> {
    match &config.spaces_config {
        Some(spaces) => Arc::new(S3BlobStore::connect(spaces).await),
        None => {
            let dir = config
                .local_backup_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_DIR));
            Arc::new(LocalBlobStore::new(dir))
        }
    }
}
