use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::services::encryption::{EncryptionError, EncryptionService};

/// Key/value object storage for source images and synthesized audio.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `data` under `key`, replacing any existing object.
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Object {0} not found")]
    NotFound(String),

    #[error("Object storage returned HTTP {status} for {key}")]
    Http { status: u16, key: String },
}

/// Map a non-2xx response to an error. Without `fail-on-err`, rust-s3
/// hands those back as `Ok`.
fn check_status(status: u16, key: &str) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        status => Err(StorageError::Http {
            status,
            key: key.to_string(),
        }),
    }
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
}

#[async_trait]
impl BlobStore for R2Client {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        check_status(response.status_code(), key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        check_status(response.status_code(), key)?;
        Ok(response.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self.bucket.delete_object(key).await?;
        match check_status(response.status_code(), key) {
            Err(StorageError::NotFound(_)) => Ok(()),
            other => other,
        }
    }
}

/// In-process object storage for tests and single-node runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored under `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Vec<u8>, String)>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.lock()
            .insert(key.to_string(), (data.to_vec(), content_type.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.lock()
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.lock().remove(key);
        Ok(())
    }
}

/// Encoded speech returned by a synthesizer.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub extension: String,
}

/// Job-scoped storage layout on top of a [`BlobStore`].
///
/// Source images are encrypted at rest under `images/{job_id}`. Audio is
/// stored under `audio/{job_id}.{ext}`, so a redelivered synthesis overwrites
/// the previous artifact instead of adding a second one.
pub struct AssetStore {
    blobs: std::sync::Arc<dyn BlobStore>,
    encryption: EncryptionService,
}

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),
}

impl AssetStore {
    pub fn new(blobs: std::sync::Arc<dyn BlobStore>, encryption: EncryptionService) -> Self {
        Self { blobs, encryption }
    }

    pub fn image_key(job_id: Uuid) -> String {
        format!("images/{job_id}")
    }

    pub fn audio_key(job_id: Uuid, extension: &str) -> String {
        format!("audio/{job_id}.{extension}")
    }

    /// Encrypt and upload a source image. Returns its storage key.
    pub async fn put_image(&self, job_id: Uuid, image: &[u8]) -> Result<String, AssetError> {
        let key = Self::image_key(job_id);
        let sealed = self.encryption.encrypt(image)?;
        self.blobs
            .put(&key, &sealed, "application/octet-stream")
            .await?;
        Ok(key)
    }

    /// Remove a source image that no job record points at.
    pub async fn delete_image(&self, job_id: Uuid) -> Result<(), AssetError> {
        Ok(self.blobs.delete(&Self::image_key(job_id)).await?)
    }

    /// Download and decrypt a source image.
    pub async fn load_image(&self, key: &str) -> Result<Vec<u8>, AssetError> {
        let sealed = self.blobs.get(key).await?;
        Ok(self.encryption.decrypt(&sealed)?)
    }

    /// Store synthesized audio for a job. Returns its storage key.
    pub async fn put_audio(&self, job_id: Uuid, clip: &AudioClip) -> Result<String, AssetError> {
        let key = Self::audio_key(job_id, &clip.extension);
        self.blobs.put(&key, &clip.bytes, &clip.content_type).await?;
        Ok(key)
    }
}
