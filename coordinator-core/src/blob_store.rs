//! Blob storage facade.
//!
//! Abstract interface over the artifact object store. Implementations target
//! the local filesystem (self-hosted deployments, tests) or S3-compatible
//! storage (production). Presigned URLs let clients move multi-gigabyte zkeys
//! without streaming them through the coordinator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::BlobStoreError;

/// Metadata returned by a head request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: u64,
}

/// Part receipt submitted when completing a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub e_tag: String,
    pub part_number: u32,
}

/// Byte-addressable object store with presigned-URL semantics.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn create_bucket(&self, bucket: &str) -> Result<(), BlobStoreError>;

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMetadata>, BlobStoreError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobStoreError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content: &[u8],
        public_read: bool,
    ) -> Result<(), BlobStoreError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), BlobStoreError>;

    /// Short-lived URL granting direct GET access.
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_secs: u64,
    ) -> Result<String, BlobStoreError>;

    /// Short-lived URL granting direct PUT access.
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        expires_secs: u64,
    ) -> Result<String, BlobStoreError>;

    /// Open a multipart upload, returning its upload id.
    async fn start_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, BlobStoreError>;

    /// Presigned URLs for parts `1..=parts` of an open upload.
    async fn presign_upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: u32,
        expires_secs: u64,
    ) -> Result<Vec<String>, BlobStoreError>;

    /// Direct part upload, returning the part's eTag. Production clients PUT
    /// to the presigned URLs instead; this is the facade used by the local
    /// backend and tests.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        content: &[u8],
    ) -> Result<String, BlobStoreError>;

    /// Assemble the uploaded parts into the final object.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), BlobStoreError>;

    /// Fetch an object to a local file path.
    async fn download_to_file(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> Result<(), BlobStoreError> {
        let bytes = self.get_object(bucket, key).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }
}

fn etag_of(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

// ─── Local filesystem backend ─────────────────────────────────

struct OpenUpload {
    bucket: String,
    key: String,
    /// part number → (eTag, staged path)
    parts: HashMap<u32, (String, PathBuf)>,
}

/// Filesystem-backed implementation. Buckets are directories under the base
/// path; multipart parts are staged under a hidden spool directory until the
/// upload completes. Presigned URLs are `file://` URIs carrying the expiry
/// as a query parameter.
pub struct LocalBlobStore {
    base_path: PathBuf,
    uploads: RwLock<HashMap<String, OpenUpload>>,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            uploads: RwLock::new(HashMap::new()),
        }
    }

    fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.bucket_path(bucket).join(key)
    }

    fn spool_path(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(".multipart").join(upload_id)
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), BlobStoreError> {
        let path = self.bucket_path(bucket);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(()),
            Err(_) => Err(BlobStoreError::BucketNotFound(bucket.to_string())),
        }
    }

    fn presigned(&self, path: &Path, expires_secs: u64) -> String {
        format!("file://{}?X-Expires={}", path.display(), expires_secs)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn create_bucket(&self, bucket: &str) -> Result<(), BlobStoreError> {
        tokio::fs::create_dir_all(self.bucket_path(bucket)).await?;
        Ok(())
    }

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMetadata>, BlobStoreError> {
        self.ensure_bucket(bucket).await?;
        match tokio::fs::metadata(self.object_path(bucket, key)).await {
            Ok(meta) => Ok(Some(ObjectMetadata { size: meta.len() })),
            Err(_) => Ok(None),
        }
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        self.ensure_bucket(bucket).await?;
        let path = self.object_path(bucket, key);
        tokio::fs::read(&path)
            .await
            .map_err(|_| BlobStoreError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content: &[u8],
        _public_read: bool,
    ) -> Result<(), BlobStoreError> {
        self.ensure_bucket(bucket).await?;
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), BlobStoreError> {
        self.ensure_bucket(bucket).await?;
        let path = self.object_path(bucket, key);
        if tokio::fs::metadata(&path).await.is_ok() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_secs: u64,
    ) -> Result<String, BlobStoreError> {
        self.ensure_bucket(bucket).await?;
        Ok(self.presigned(&self.object_path(bucket, key), expires_secs))
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        expires_secs: u64,
    ) -> Result<String, BlobStoreError> {
        self.ensure_bucket(bucket).await?;
        Ok(self.presigned(&self.object_path(bucket, key), expires_secs))
    }

    async fn start_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, BlobStoreError> {
        self.ensure_bucket(bucket).await?;
        let upload_id = Uuid::now_v7().to_string();
        tokio::fs::create_dir_all(self.spool_path(&upload_id)).await?;
        self.uploads.write().await.insert(
            upload_id.clone(),
            OpenUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: HashMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn presign_upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: u32,
        expires_secs: u64,
    ) -> Result<Vec<String>, BlobStoreError> {
        self.ensure_bucket(bucket).await?;
        let uploads = self.uploads.read().await;
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| BlobStoreError::UnknownUpload(upload_id.to_string()))?;
        if upload.bucket != bucket || upload.key != key {
            return Err(BlobStoreError::Storage(format!(
                "upload {upload_id} is not open for {bucket}/{key}"
            )));
        }
        Ok((1..=parts)
            .map(|n| {
                self.presigned(
                    &self.spool_path(upload_id).join(format!("part-{n}")),
                    expires_secs,
                )
            })
            .collect())
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        content: &[u8],
    ) -> Result<String, BlobStoreError> {
        self.ensure_bucket(bucket).await?;
        let path = self.spool_path(upload_id).join(format!("part-{part_number}"));
        tokio::fs::write(&path, content).await?;
        let e_tag = etag_of(content);

        let mut uploads = self.uploads.write().await;
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| BlobStoreError::UnknownUpload(upload_id.to_string()))?;
        if upload.bucket != bucket || upload.key != key {
            return Err(BlobStoreError::Storage(format!(
                "upload {upload_id} is not open for {bucket}/{key}"
            )));
        }
        upload.parts.insert(part_number, (e_tag.clone(), path));
        Ok(e_tag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), BlobStoreError> {
        self.ensure_bucket(bucket).await?;
        let upload = self
            .uploads
            .write()
            .await
            .remove(upload_id)
            .ok_or_else(|| BlobStoreError::UnknownUpload(upload_id.to_string()))?;
        if upload.bucket != bucket || upload.key != key {
            return Err(BlobStoreError::Storage(format!(
                "upload {upload_id} is not open for {bucket}/{key}"
            )));
        }

        let mut ordered: Vec<&CompletedPart> = parts.iter().collect();
        ordered.sort_by_key(|p| p.part_number);

        let mut assembled = Vec::new();
        for part in ordered {
            let (staged_tag, path) = upload.parts.get(&part.part_number).ok_or_else(|| {
                BlobStoreError::Storage(format!("part {} was never uploaded", part.part_number))
            })?;
            if staged_tag != &part.e_tag {
                return Err(BlobStoreError::Storage(format!(
                    "eTag mismatch on part {}",
                    part.part_number
                )));
            }
            assembled.extend(tokio::fs::read(path).await?);
        }

        self.put_object(bucket, key, &assembled, false).await?;
        let _ = tokio::fs::remove_dir_all(self.spool_path(upload_id)).await;
        Ok(())
    }
}
