use crate::config::{SyncConfig, UploadConfig};
use crate::storage::{SinkError, StorageSink, UploadBody};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors establishing the authenticated session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error("Missing region")]
    MissingRegion,

    #[error("Bucket {bucket} is not reachable: {message}")]
    BucketUnreachable { bucket: String, message: String },
}

/// One authenticated S3 client, built once from static credentials.
#[derive(Debug, Clone)]
pub struct Session {
    client: S3Client,
    region: String,
}

impl Session {
    /// Build the client from region and static credentials.
    ///
    /// With `upload.verify-bucket` set the bucket is checked with HeadBucket so
    /// bad credentials surface here rather than on the first upload.
    pub async fn establish(config: &SyncConfig) -> Result<Self, SessionError> {
        if config.region.trim().is_empty() {
            return Err(SessionError::MissingRegion);
        }
        if config.access_key.is_empty() {
            return Err(SessionError::MissingCredentials("access-key"));
        }
        if config.secret.is_empty() {
            return Err(SessionError::MissingCredentials("secret"));
        }

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret,
            None, // session token
            None, // expires after
            "sync-service",
        );

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.upload.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.upload.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        if config.upload.verify_bucket {
            client
                .head_bucket()
                .bucket(&config.bucket)
                .send()
                .await
                .map_err(|e| SessionError::BucketUnreachable {
                    bucket: config.bucket.clone(),
                    message: DisplayErrorContext(&e).to_string(),
                })?;
        }

        info!(region = %config.region, "S3 session established");

        Ok(Self {
            client,
            region: config.region.clone(),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

/// S3-backed storage sink: single PutObject for small files, multipart above
/// the configured threshold.
pub struct S3Sink {
    session: Session,
    multipart_threshold: u64,
    part_size: usize,
}

impl S3Sink {
    pub fn new(session: Session, config: &UploadConfig) -> Self {
        Self {
            session,
            multipart_threshold: config.multipart_threshold_bytes as u64,
            part_size: config.part_size_bytes,
        }
    }

    /// Simple single-part upload streamed straight from the file
    async fn simple_upload(&self, bucket: &str, key: &str, body: UploadBody) -> Result<(), SinkError> {
        let len = body.size_bytes();
        let stream = ByteStream::read_from()
            .file(body.into_file())
            .length(Length::Exact(len))
            .build()
            .await
            .map_err(|e| SinkError::Request {
                operation: "read_body",
                message: e.to_string(),
            })?;

        self.session
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_length(len as i64)
            .body(stream)
            .send()
            .await
            .map_err(|e| SinkError::Request {
                operation: "put_object",
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(&self, bucket: &str, key: &str, body: UploadBody) -> Result<(), SinkError> {
        let create_response = self
            .session
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| SinkError::Request {
                operation: "create_multipart_upload",
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let upload_id = create_response
            .upload_id()
            .ok_or(SinkError::MissingUploadId)?
            .to_string();

        match self.upload_parts(bucket, key, &upload_id, body).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Leave nothing half-written behind in the bucket.
                if let Err(abort_err) = self
                    .session
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        mut body: UploadBody,
    ) -> Result<(), SinkError> {
        let mut completed_parts = Vec::new();
        let mut part_number = 1;

        loop {
            let chunk = body.read_chunk(self.part_size).await?;
            if chunk.is_empty() {
                break;
            }
            let last = chunk.len() < self.part_size;

            debug!(key = %key, part_number, size_bytes = chunk.len(), "Uploading part");

            let upload_part_response = self
                .session
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| SinkError::Request {
                    operation: "upload_part",
                    message: DisplayErrorContext(&e).to_string(),
                })?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;

            if last {
                break;
            }
        }

        // The file handle is no longer needed once every part is sent.
        drop(body);

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.session
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| SinkError::Request {
                operation: "complete_multipart_upload",
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }
}

#[async_trait]
impl StorageSink for S3Sink {
    #[instrument(skip(self, body), fields(size_bytes = body.size_bytes()))]
    async fn put(&self, bucket: &str, key: &str, body: UploadBody) -> Result<(), SinkError> {
        if body.size_bytes() > self.multipart_threshold {
            self.multipart_upload(bucket, key, body).await
        } else {
            self.simple_upload(bucket, key, body).await
        }
    }
}
