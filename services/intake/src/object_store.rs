use crate::product::ProductId;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

/// Object store failures.
///
/// `ServiceRejected` and `Unavailable` must stay distinct all the way up: the
/// first is final, the second is retried by the watchdog.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("object store rejected the request: {0}")]
    ServiceRejected(String),

    #[error("object store unavailable: {0}")]
    Unavailable(String),

    /// The body handed to the store could not be read to the end
    #[error("invalid object body: {0}")]
    InvalidBody(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// Descriptive metadata kept with a stored object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub filename: Option<String>,
}

/// Object body delivered chunk by chunk
pub type ByteChunks = BoxStream<'static, Result<Bytes, StorageError>>;

/// A fetched object, fully buffered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
    pub metadata: ObjectMetadata,
}

/// An object opened for streaming
pub struct ObjectReader {
    pub body: ByteChunks,
    pub content_type: String,
    pub metadata: ObjectMetadata,
    pub size: Option<u64>,
}

/// Wrap an in-memory buffer as a one-chunk body
pub fn single_chunk(body: Bytes) -> ByteChunks {
    stream::once(async move { Ok(body) }).boxed()
}

/// Read a chunked body into one buffer
pub async fn collect_chunks(mut body: ByteChunks) -> Result<Bytes, StorageError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

/// Blob storage used for quarantine, permanent and metadata copies
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a chunked body and return the number of bytes written. Nothing is
    /// left behind when the body fails part way.
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        body: ByteChunks,
        content_type: &str,
        metadata: ObjectMetadata,
    ) -> Result<u64, StorageError>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: ObjectMetadata,
    ) -> Result<(), StorageError> {
        self.put_stream(bucket, key, single_chunk(body), content_type, metadata)
            .await
            .map(|_| ())
    }

    async fn open(&self, bucket: &str, key: &str) -> Result<ObjectReader, StorageError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError> {
        let reader = self.open(bucket, key).await?;
        Ok(StoredObject {
            body: collect_chunks(reader.body).await?,
            content_type: reader.content_type,
            metadata: reader.metadata,
        })
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError>;

    /// Copy an object with its content type and metadata, inside the store.
    /// A missing source is [`StorageError::NotFound`].
    async fn copy(
        &self,
        from_bucket: &str,
        from_key: &str,
        to_bucket: &str,
        to_key: &str,
    ) -> Result<(), StorageError>;

    /// Deleting a missing object succeeds
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;
}

/// Bucket names for each stage of a product's life
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buckets {
    pub quarantine: String,
    pub permanent: String,
    pub metadata: String,
}

/// Quarantine key for a product
pub fn quarantine_key(id: ProductId) -> String {
    id.to_string()
}

/// Permanent key for a product
pub fn permanent_key(id: ProductId) -> String {
    id.to_string()
}

/// Key of the stored metadata copy: `{id}/{type}`
pub fn metadata_key(id: ProductId, metadata_type: &str) -> String {
    format!("{}/{}", id, sanitize_path_component(metadata_type))
}

/// Sanitize a path component to prevent path traversal
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Process-local object store
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<(String, String), StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn not_found(bucket: &str, key: &str) -> StorageError {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        body: ByteChunks,
        content_type: &str,
        metadata: ObjectMetadata,
    ) -> Result<u64, StorageError> {
        let body = collect_chunks(body).await?;
        let written = body.len() as u64;
        self.objects.write().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                metadata,
            },
        );
        Ok(written)
    }

    async fn open(&self, bucket: &str, key: &str) -> Result<ObjectReader, StorageError> {
        let object = self
            .objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| Self::not_found(bucket, key))?;
        Ok(ObjectReader {
            size: Some(object.body.len() as u64),
            body: single_chunk(object.body),
            content_type: object.content_type,
            metadata: object.metadata,
        })
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .objects
            .read()
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn copy(
        &self,
        from_bucket: &str,
        from_key: &str,
        to_bucket: &str,
        to_key: &str,
    ) -> Result<(), StorageError> {
        let mut objects = self.objects.write();
        let object = objects
            .get(&(from_bucket.to_string(), from_key.to_string()))
            .cloned()
            .ok_or_else(|| Self::not_found(from_bucket, from_key))?;
        objects.insert((to_bucket.to_string(), to_key.to_string()), object);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.objects
            .write()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}
