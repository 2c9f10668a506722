use super::{BlobStore, StoredObject};
use crate::models::ImageStream;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub data: Vec<u8>,
    pub content_type: String,
}

#[derive(Clone)]
pub struct MemoryBlobStore {
    objects: Arc<Mutex<HashMap<String, StoredBlob>>>,
    put_count: Arc<Mutex<usize>>,
    delete_count: Arc<Mutex<usize>>,
    fail_puts: Arc<Mutex<bool>>,
    fail_deletes: Arc<Mutex<bool>>,
    max_read_chunk: Option<usize>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
            put_count: Arc::new(Mutex::new(0)),
            delete_count: Arc::new(Mutex::new(0)),
            fail_puts: Arc::new(Mutex::new(false)),
            fail_deletes: Arc::new(Mutex::new(false)),
            max_read_chunk: None,
        }
    }

    pub fn with_object(self, key: String, data: Vec<u8>, content_type: String) -> Self {
        self.objects
            .lock()
            .unwrap()
            .insert(key, StoredBlob { data, content_type });
        self
    }

    /// Reject every put without reading the stream.
    pub fn with_put_failure(self, should_fail: bool) -> Self {
        *self.fail_puts.lock().unwrap() = should_fail;
        self
    }

    pub fn with_delete_failure(self, should_fail: bool) -> Self {
        *self.fail_deletes.lock().unwrap() = should_fail;
        self
    }

    /// Drain puts at most `chunk` bytes at a time, yielding between reads
    /// like a slow network consumer.
    pub fn with_max_read_chunk(mut self, chunk: usize) -> Self {
        self.max_read_chunk = Some(chunk.max(1));
        self
    }

    pub fn get_put_count(&self) -> usize {
        *self.put_count.lock().unwrap()
    }

    pub fn get_delete_count(&self) -> usize {
        *self.delete_count.lock().unwrap()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn get_object(&self, key: &str) -> Option<StoredBlob> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, mut data: ImageStream, content_type: &str) -> Result<()> {
        *self.put_count.lock().unwrap() += 1;

        if *self.fail_puts.lock().unwrap() {
            return Err(Error::Storage(format!("Mock put failure for {}", key)));
        }

        let mut bytes = Vec::new();
        match self.max_read_chunk {
            Some(limit) => {
                let mut chunk = vec![0u8; limit];
                loop {
                    let n = data.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    bytes.extend_from_slice(&chunk[..n]);
                    tokio::task::yield_now().await;
                }
            }
            None => {
                data.read_to_end(&mut bytes).await?;
            }
        }

        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredBlob {
                data: bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<StoredObject> {
        let blob = self
            .get_object(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;

        Ok(StoredObject {
            data: Box::pin(Cursor::new(blob.data)),
            content_type: blob.content_type,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        *self.delete_count.lock().unwrap() += 1;

        if *self.fail_deletes.lock().unwrap() {
            return Err(Error::Storage(format!("Mock delete failure for {}", key)));
        }

        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn ensure_bucket(&self) -> Result<()> {
        Ok(())
    }
}
