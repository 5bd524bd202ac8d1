use crate::config::S3Config;
use crate::object_store::{ByteChunks, ObjectMetadata, ObjectReader, ObjectStore, StorageError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

const FILENAME_METADATA_KEY: &str = "filename";
/// Largest source `CopyObject` accepts in one request
const COPY_OBJECT_LIMIT_BYTES: u64 = 5 * 1024 * 1024 * 1024;
const COPY_PART_BYTES: u64 = 512 * 1024 * 1024;

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            quarantine_bucket = %config.quarantine_bucket,
            permanent_bucket = %config.permanent_bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Self {
            client,
            config: config.clone(),
        }
    }

    /// Simple single-part upload for small objects
    async fn simple_upload(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> Result<(), StorageError> {
        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type);

        if let Some(ref filename) = metadata.filename {
            request = request.metadata(FILENAME_METADATA_KEY, filename);
        }

        request
            .send()
            .await
            .map_err(|e| storage_error(e, "failed to upload object"))?;

        Ok(())
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<String, StorageError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_content_type(content_type)
            .set_metadata(metadata)
            .send()
            .await
            .map_err(|e| storage_error(e, "failed to create multipart upload"))?;

        create_response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| {
                StorageError::ServiceRejected("no upload ID in multipart response".to_string())
            })
    }

    /// Complete the upload if every part made it, abort it otherwise
    async fn finish_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Result<Vec<CompletedPart>, StorageError>,
    ) -> Result<(), StorageError> {
        match parts {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| storage_error(e, "failed to complete multipart upload"))?;

                Ok(())
            }
            Err(e) => {
                if let Err(abort_error) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %DisplayErrorContext(&abort_error),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    /// Multipart upload for large objects; `head` holds what was already read
    async fn multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        head: BytesMut,
        rest: ByteChunks,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> Result<u64, StorageError> {
        let user_metadata = metadata.filename.as_ref().map(|filename| {
            HashMap::from([(FILENAME_METADATA_KEY.to_string(), filename.clone())])
        });
        let upload_id = self
            .create_multipart(bucket, key, Some(content_type.to_string()), user_metadata)
            .await?;

        let uploaded = self
            .upload_parts(bucket, key, &upload_id, head, rest)
            .await;
        let written = uploaded.as_ref().map(|(_, written)| *written).unwrap_or_default();
        self.finish_multipart(bucket, key, &upload_id, uploaded.map(|(parts, _)| parts))
            .await?;
        Ok(written)
    }

    /// Upload the body in parts of `part_size_bytes`, holding at most one part in memory
    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        mut buffer: BytesMut,
        mut rest: ByteChunks,
    ) -> Result<(Vec<CompletedPart>, u64), StorageError> {
        let part_size = self.config.part_size_bytes.max(1);
        let mut completed_parts = Vec::new();
        let mut written = 0;
        let mut part_number = 1;
        let mut exhausted = false;

        loop {
            while !exhausted && buffer.len() < part_size {
                match rest.next().await {
                    Some(chunk) => buffer.extend_from_slice(&chunk?),
                    None => exhausted = true,
                }
            }
            if buffer.is_empty() {
                break;
            }

            let chunk = buffer.split_to(part_size.min(buffer.len())).freeze();
            written += chunk.len() as u64;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| storage_error(e, "failed to upload part"))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
        }

        Ok((completed_parts, written))
    }

    /// Server-side copy in ranges, for sources above the single-request limit
    async fn multipart_copy(
        &self,
        source: &str,
        size: u64,
        to_bucket: &str,
        to_key: &str,
        content_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<(), StorageError> {
        let upload_id = self
            .create_multipart(to_bucket, to_key, content_type, metadata)
            .await?;
        let parts = self
            .copy_parts(source, size, to_bucket, to_key, &upload_id)
            .await;
        self.finish_multipart(to_bucket, to_key, &upload_id, parts)
            .await
    }

    async fn copy_parts(
        &self,
        source: &str,
        size: u64,
        to_bucket: &str,
        to_key: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut start = 0;

        while start < size {
            let end = (start + COPY_PART_BYTES).min(size) - 1;
            let response = self
                .client
                .upload_part_copy()
                .bucket(to_bucket)
                .key(to_key)
                .upload_id(upload_id)
                .part_number(part_number)
                .copy_source(source)
                .copy_source_range(format!("bytes={start}-{end}"))
                .send()
                .await
                .map_err(|e| storage_error(e, "failed to copy part"))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(
                        response
                            .copy_part_result()
                            .and_then(|result| result.e_tag())
                            .unwrap_or_default(),
                    )
                    .build(),
            );
            part_number += 1;
            start = end + 1;
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body, metadata))]
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteChunks,
        content_type: &str,
        metadata: ObjectMetadata,
    ) -> Result<u64, StorageError> {
        // small bodies go up in one request
        let mut head = BytesMut::new();
        while head.len() <= self.config.multipart_threshold_bytes {
            match body.next().await {
                Some(chunk) => head.extend_from_slice(&chunk?),
                None => {
                    let written = head.len() as u64;
                    self.simple_upload(bucket, key, head.freeze(), content_type, &metadata)
                        .await?;
                    debug!(bucket = %bucket, key = %key, size_bytes = written, "Object uploaded");
                    return Ok(written);
                }
            }
        }

        let written = self
            .multipart_upload(bucket, key, head, body, content_type, &metadata)
            .await?;
        debug!(bucket = %bucket, key = %key, size_bytes = written, "Object uploaded in parts");
        Ok(written)
    }

    #[instrument(skip(self))]
    async fn open(&self, bucket: &str, key: &str) -> Result<ObjectReader, StorageError> {
        let response = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(StorageError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    });
                }
                return Err(storage_error(e, "failed to get object"));
            }
        };

        let content_type = response
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let filename = response
            .metadata()
            .and_then(|m| m.get(FILENAME_METADATA_KEY))
            .cloned();
        let size = response
            .content_length()
            .and_then(|length| u64::try_from(length).ok());

        let body = stream::unfold(response.body, |mut body| async move {
            let chunk = body.next().await?.map_err(|e| {
                StorageError::Unavailable(format!("failed to read object body: {e}"))
            });
            Some((chunk, body))
        })
        .boxed();

        Ok(ObjectReader {
            body,
            content_type,
            metadata: ObjectMetadata { filename },
            size,
        })
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(storage_error(e, "failed to check object existence"))
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn copy(
        &self,
        from_bucket: &str,
        from_key: &str,
        to_bucket: &str,
        to_key: &str,
    ) -> Result<(), StorageError> {
        let source_head = match self
            .client
            .head_object()
            .bucket(from_bucket)
            .key(from_key)
            .send()
            .await
        {
            Ok(head) => head,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    return Err(StorageError::NotFound {
                        bucket: from_bucket.to_string(),
                        key: from_key.to_string(),
                    });
                }
                return Err(storage_error(e, "failed to inspect source object"));
            }
        };

        let size = source_head
            .content_length()
            .and_then(|length| u64::try_from(length).ok())
            .unwrap_or_default();
        let source = copy_source(from_bucket, from_key);

        if size <= COPY_OBJECT_LIMIT_BYTES {
            // metadata and content type carry over with the default directive
            self.client
                .copy_object()
                .bucket(to_bucket)
                .key(to_key)
                .copy_source(&source)
                .send()
                .await
                .map_err(|e| storage_error(e, "failed to copy object"))?;
        } else {
            self.multipart_copy(
                &source,
                size,
                to_bucket,
                to_key,
                source_head.content_type().map(str::to_string),
                source_head.metadata().cloned(),
            )
            .await?;
        }

        debug!(
            from = %source,
            to_bucket = %to_bucket,
            to_key = %to_key,
            size_bytes = size,
            "Object copied"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error(e, "failed to delete object"))?;

        debug!(bucket = %bucket, key = %key, "Object deleted");
        Ok(())
    }
}

/// `bucket/key` as S3 expects it in `x-amz-copy-source`
fn copy_source(bucket: &str, key: &str) -> String {
    let key: String = key
        .split('/')
        .map(|segment| {
            segment
                .bytes()
                .map(|b| match b {
                    b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                        (b as char).to_string()
                    }
                    _ => format!("%{b:02X}"),
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("/");
    format!("{bucket}/{key}")
}

/// Map an SDK error onto the retry taxonomy.
///
/// Requests the service answered with a 4xx are rejected; everything that never
/// got an answer, or got a 5xx, is unavailable.
fn storage_error<E>(err: SdkError<E, HttpResponse>, action: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = format!("{action}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::ServiceError(service) if service.raw().status().as_u16() >= 500 => {
            StorageError::Unavailable(message)
        }
        SdkError::ServiceError(_) | SdkError::ConstructionFailure(_) => {
            StorageError::ServiceRejected(message)
        }
        _ => StorageError::Unavailable(message),
    }
}
