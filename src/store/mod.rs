//! Blob storage for image payloads
//!
//! Objects are addressed by key and carry a content type. The production
//! backend talks to S3-compatible storage (AWS, MinIO); the in-memory store
//! backs tests and dry runs.

pub mod client;
pub mod mock;

pub use client::S3BlobStore;
pub use mock::MemoryBlobStore;

use crate::models::ImageStream;
use crate::Result;
use async_trait::async_trait;

/// An object read back from the store.
pub struct StoredObject {
    pub data: ImageStream,
    pub content_type: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream `data` into `key` until the stream ends or fails.
    async fn put(&self, key: &str, data: ImageStream, content_type: &str) -> Result<()>;

    /// Fails with [`crate::Error::NotFound`] when `key` does not exist.
    async fn get(&self, key: &str) -> Result<StoredObject>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Create the bucket if it is missing. Idempotent.
    async fn ensure_bucket(&self) -> Result<()>;
}
