use super::{BlobStore, StoredObject};
use crate::models::ImageStream;
use crate::{Error, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::{config::Region, Client as S3Client};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// S3 rejects multipart parts smaller than this, except the last one.
const PART_SIZE: usize = 5 * 1024 * 1024;

pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    region: String,
}

impl S3BlobStore {
    pub async fn new(
        access_key: String,
        secret_key: String,
        endpoint: String,
        region: String,
        bucket: String,
    ) -> Result<Self> {
        let credentials =
            aws_sdk_s3::config::Credentials::new(access_key, secret_key, None, None, "progimage");

        let config = aws_config::defaults(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.clone()))
            .endpoint_url(endpoint)
            .load()
            .await;

        // MinIO and most self-hosted stores only serve path-style URLs
        let client = S3Client::from_conf(
            aws_sdk_s3::config::Builder::from(&config)
                .force_path_style(true)
                .build(),
        );

        Ok(Self {
            client,
            bucket,
            region,
        })
    }

    async fn put_single(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                Error::Storage(format!(
                    "Failed to upload {}: {}",
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        key: &str,
        first: Vec<u8>,
        data: &mut ImageStream,
        content_type: &str,
    ) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                Error::Storage(format!(
                    "Failed to start upload of {}: {}",
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::Storage(format!("No upload id returned for {}", key)))?
            .to_string();

        match self.upload_parts(key, &upload_id, first, data).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| {
                        Error::Storage(format!(
                            "Failed to complete upload of {}: {}",
                            key,
                            DisplayErrorContext(&e)
                        ))
                    })?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        "Failed to abort multipart upload {} for {}: {}",
                        upload_id,
                        key,
                        DisplayErrorContext(&abort_err)
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        data: &mut ImageStream,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut part = first;
        let mut part_number = 1;

        while !part.is_empty() {
            let size = part.len();
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|e| {
                    Error::Storage(format!(
                        "Failed to upload part {} of {}: {}",
                        part_number,
                        key,
                        DisplayErrorContext(&e)
                    ))
                })?;
            debug!("Uploaded part {} of {} ({} bytes)", part_number, key, size);

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );

            part_number += 1;
            part = read_part(data, PART_SIZE).await?;
        }

        Ok(parts)
    }
}

/// Read up to `size` bytes, stopping early only at end of stream.
async fn read_part(data: &mut ImageStream, size: usize) -> Result<Vec<u8>> {
    let mut part = Vec::with_capacity(size);
    (&mut *data).take(size as u64).read_to_end(&mut part).await?;
    Ok(part)
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, mut data: ImageStream, content_type: &str) -> Result<()> {
        let first = read_part(&mut data, PART_SIZE).await?;

        if first.len() < PART_SIZE {
            let size = first.len();
            self.put_single(key, first, content_type).await?;
            info!("Stored {} ({} bytes, {})", key, size, content_type);
        } else {
            self.put_multipart(key, first, &mut data, content_type)
                .await?;
            info!("Stored {} via multipart upload ({})", key, content_type);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<StoredObject> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false)
                    || e
                        .raw_response()
                        .map(|r| r.status().as_u16() == 404)
                        .unwrap_or(false);
                if missing {
                    Error::NotFound(key.to_string())
                } else {
                    Error::Storage(format!(
                        "Failed to read {}: {}",
                        key,
                        DisplayErrorContext(&e)
                    ))
                }
            })?;

        let content_type = response
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        Ok(StoredObject {
            data: Box::pin(response.body.into_async_read()),
            content_type,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                Error::Storage(format!(
                    "Failed to delete {}: {}",
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().map(|se| se.is_not_found()) == Some(true) => Ok(false),
            Err(e) => Err(Error::Storage(format!(
                "Failed to check {}: {}",
                key,
                DisplayErrorContext(&e)
            ))),
        }
    }

    async fn ensure_bucket(&self) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(e) if e.as_service_error().map(|se| se.is_not_found()) == Some(true) => {}
            Err(e) => {
                return Err(Error::Storage(format!(
                    "error checking bucket exists: {}",
                    DisplayErrorContext(&e)
                )))
            }
        }

        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!("Created bucket {}", self.bucket);
                Ok(())
            }
            Err(e)
                if e.as_service_error()
                    .map(|se| se.is_bucket_already_owned_by_you())
                    == Some(true) =>
            {
                Ok(())
            }
            Err(e) => Err(Error::Storage(format!(
                "error creating bucket: {}",
                DisplayErrorContext(&e)
            ))),
        }
    }
}
