use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::{BlobError, BlobStore};

/// Stores snapshots as files below a root directory; keys map to relative paths.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(BlobError::Backend(format!("invalid blob key: {}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                BlobError::Backend(format!("Failed to create directory {}: {}", parent.display(), e))
            })?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| BlobError::Backend(format!("Failed to write {}: {}", path.display(), e)))?;
        debug!("✓ Wrote snapshot to {}", path.display());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => BlobError::NotFound(path.display().to_string()),
            _ => BlobError::Backend(format!("Failed to read {}: {}", path.display(), e)),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Backend(format!("Failed to delete {}: {}", path.display(), e))),
        }
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}
