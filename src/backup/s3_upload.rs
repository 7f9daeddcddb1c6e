// backupagent/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use tracing::info;

use crate::backup::multipart::{MultipartStore, PartReceipt};
use crate::config::StorageConfig;
use crate::errors::UploadError;

/// Multipart store for S3-compatible object storage (AWS S3, DigitalOcean Spaces, MinIO).
#[derive(Debug, Clone)]
pub struct S3MultipartStore {
    client: s3::Client,
    bucket: String,
}

impl S3MultipartStore {
    pub async fn connect(storage: &StorageConfig) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(storage.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &storage.access_key_id,
                &storage.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        if let Some(endpoint) = &storage.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(storage.force_path_style)
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
            bucket: storage.bucket_name.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Checks that the target bucket is reachable with a HEAD request.
    pub async fn check_connection(&self) -> anyhow::Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Could not access bucket '{}': {}",
                    self.bucket,
                    DisplayErrorContext(&e)
                )
            })?;
        info!(bucket = %self.bucket, "✓ Target bucket is accessible");
        Ok(())
    }
}

/// A part without an ETag can never be completed, so it fails here.
fn part_e_tag(e_tag: Option<&str>, part_number: i32) -> Result<String, UploadError> {
    match e_tag.filter(|tag| !tag.is_empty()) {
        Some(tag) => Ok(tag.to_string()),
        None => Err(UploadError::Part {
            part_number,
            message: "backend returned no ETag".to_string(),
        }),
    }
}

#[async_trait]
impl MultipartStore for S3MultipartStore {
    async fn initiate(&self, key: &str) -> Result<String, UploadError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| UploadError::Initiate {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| UploadError::MissingUploadId(key.to_string()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<String, UploadError> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| UploadError::Part {
                part_number,
                message: DisplayErrorContext(&e).to_string(),
            })?;

        part_e_tag(output.e_tag(), part_number)
    }

    async fn complete(&self, key: &str, upload_id: &str, parts: &[PartReceipt]) -> Result<(), UploadError> {
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .e_tag(&part.e_tag)
                    .part_number(part.part_number)
                    .build()
            })
            .collect();
        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| UploadError::Complete {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }

    async fn abort(&self, key: &str, upload_id: &str) -> Result<(), UploadError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| UploadError::Abort {
                upload_id: upload_id.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }
}
