use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use uuid::Uuid;

use crate::models::job::ImageRef;

/// Holder of uploaded receipt images.
///
/// A handle stays valid until the job reaches Saved, Discarded or Cancelled,
/// at which point the batch releases it.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn release(&self, image: &ImageRef) -> Result<(), StorageError>;
}

/// Object key for an uploaded image. Images sent in one upload share the
/// `upload_id` prefix; the batch id is assigned later, at submit.
pub fn image_key(upload_id: Uuid, image_id: Uuid) -> String {
    format!("receipts/{upload_id}/{image_id}.enc")
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }

    /// Store sealed image bytes.
    pub async fn upload(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.bucket
            .put_object_with_content_type(key, data, "application/octet-stream")
            .await?;
        Ok(())
    }

    pub async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        if response.status_code() == 404 {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(response.to_vec())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.bucket.delete_object(key).await?;
        Ok(())
    }
}

#[async_trait]
impl ImageStore for R2Client {
    async fn release(&self, image: &ImageRef) -> Result<(), StorageError> {
        self.delete(&image.key).await?;
        tracing::debug!(image_key = %image.key, "Released receipt image");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
