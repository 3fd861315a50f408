// catalogtool/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use tracing::{debug, info};

use super::{BlobError, BlobStore};
use crate::config::SpacesConfig;

/// Snapshot storage in an S3-compatible object storage service (like DigitalOcean Spaces).
pub struct S3BlobStore {
    client: s3::Client,
    bucket: String,
    folder_prefix: Option<String>,
}

impl S3BlobStore {
    pub async fn connect(spaces_config: &SpacesConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        Self {
            client: s3::Client::new(&sdk_config),
            bucket: spaces_config.bucket_name.clone(),
            folder_prefix: spaces_config
                .folder_prefix
                .as_ref()
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        }
    }

    fn object_key(&self, key: &str) -> String {
        match &self.folder_prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        let object_key = self.object_key(key);
        let size = bytes.len();
        debug!(bucket = %self.bucket, key = %object_key, size, "Uploading snapshot");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| {
                BlobError::Backend(format!(
                    "Failed to upload to S3 bucket {} with key {}: {}",
                    self.bucket, object_key, e
                ))
            })?;

        info!("✅ Uploaded {} bytes to s3://{}/{}", size, self.bucket, object_key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let object_key = self.object_key(key);
        let mut object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    BlobError::NotFound(format!("s3://{}/{}", self.bucket, object_key))
                } else {
                    BlobError::Backend(format!(
                        "Failed to get object s3://{}/{}: {}",
                        self.bucket, object_key, service_err
                    ))
                }
            })?;

        let mut bytes = Vec::new();
        while let Some(chunk) = object
            .body
            .try_next()
            .await
            .map_err(|e| BlobError::Backend(format!("Failed to read s3://{}/{}: {}", self.bucket, object_key, e)))?
        {
            bytes.extend_from_slice(&chunk);
        }

        debug!("✓ Downloaded {} bytes from s3://{}/{}", bytes.len(), self.bucket, object_key);
        Ok(bytes)
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let object_key = self.object_key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| {
                BlobError::Backend(format!(
                    "Failed to delete s3://{}/{}: {}",
                    self.bucket, object_key, e
                ))
            })?;
        info!("✓ Deleted s3://{}/{}", self.bucket, object_key);
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.folder_prefix {
            Some(prefix) => format!("s3://{}/{}", self.bucket, prefix),
            None => format!("s3://{}", self.bucket),
        }
    }
}
