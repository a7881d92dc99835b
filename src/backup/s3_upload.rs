// dumpvault/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;

use super::job::UploadTarget;
use crate::config::{StaticCredentials, StorageConfig};
use crate::errors::{BackupError, Result};

/// What the object store acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub bucket: String,
    pub object_key: String,
    pub e_tag: Option<String>,
}

/// Stores a finished local artifact remotely.
///
/// Only called once the artifact is fully written, sealed and verified.
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    async fn upload(&self, local_path: &Path, sha256: &str, target: &UploadTarget) -> Result<UploadReceipt>;
}

/// Uploads to S3 or any S3-compatible service (MinIO, DigitalOcean Spaces, R2...).
#[derive(Debug, Clone)]
pub struct S3Uploader {
    credentials: Option<StaticCredentials>,
}

impl S3Uploader {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            credentials: storage.credentials.clone(),
        }
    }

    async fn client(&self, target: &UploadTarget) -> s3::Client {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(target.region.clone()));
        if let Some(endpoint) = &target.endpoint_url {
            tracing::info!(endpoint = %endpoint, "using custom S3 endpoint");
            loader = loader.endpoint_url(endpoint);
        }
        if let Some(creds) = &self.credentials {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                &creds.access_key_id,
                creds.secret_access_key.expose(),
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        }
        let sdk_config = loader.load().await;

        // Custom endpoints are usually MinIO-style services without virtual-host buckets.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(target.endpoint_url.is_some())
            .build();
        s3::Client::from_conf(s3_config)
    }
}

#[async_trait]
impl ArtifactUploader for S3Uploader {
    async fn upload(&self, local_path: &Path, sha256: &str, target: &UploadTarget) -> Result<UploadReceipt> {
        tracing::info!(
            path = %local_path.display(),
            bucket = %target.bucket,
            key = %target.object_key,
            "uploading backup to S3"
        );

        let client = self.client(target).await;

        let body = ByteStream::from_path(local_path).await.map_err(|e| {
            BackupError::upload(format!(
                "failed to open {} for upload: {}",
                local_path.display(),
                e
            ))
        })?;

        let output = client
            .put_object()
            .bucket(&target.bucket)
            .key(&target.object_key)
            .body(body)
            .content_type("application/octet-stream")
            .metadata("sha256", sha256)
            .send()
            .await
            .map_err(|e| {
                BackupError::upload(format!(
                    "PutObject s3://{}/{} failed: {}",
                    target.bucket,
                    target.object_key,
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;

        Ok(UploadReceipt {
            bucket: target.bucket.clone(),
            object_key: target.object_key.clone(),
            e_tag: output.e_tag().map(str::to_string),
        })
    }
}
