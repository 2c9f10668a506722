//! Validating ingestion.
//!
//! The incoming stream is teed: every byte the decoder reads is also written
//! into a bounded pipe that the blob store drains under a fresh key. The
//! decoder runs on a blocking thread and sets the pace; when the pipe is
//! full it waits for the upload to catch up. If the bytes turn out not to be
//! an image the uploaded object is deleted again.

use super::PIPE_CAPACITY;
use crate::codec::{CodecRegistry, TeeReader, SNIFF_LEN};
use crate::models::ImageStream;
use crate::store::BlobStore;
use crate::{Error, Result};
use std::io::{self, Cursor};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type KeyGenerator = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn BlobStore>,
    registry: Arc<CodecRegistry>,
    key_generator: KeyGenerator,
}

impl Ingestor {
    pub fn new(store: Arc<dyn BlobStore>, registry: Arc<CodecRegistry>) -> Self {
        Self {
            store,
            registry,
            key_generator: Arc::new(|| Uuid::new_v4().to_string()),
        }
    }

    pub fn with_key_generator(mut self, key_generator: KeyGenerator) -> Self {
        self.key_generator = key_generator;
        self
    }

    /// Validate and persist `source`, returning the new image id.
    ///
    /// Every call stores under a freshly generated key, so identical
    /// payloads get distinct ids. When both validation and upload fail the
    /// validation error is returned.
    ///
    /// Dropping the returned future does not cancel the work already
    /// started: the upload still runs to completion and no compensating
    /// delete is issued, so the object may remain in the store unreferenced.
    pub async fn ingest(&self, mut source: ImageStream) -> Result<String> {
        let prefix = read_prefix(&mut source).await?;
        let codec = match self.registry.sniff(&prefix) {
            Ok(codec) => *codec,
            Err(e) => {
                warn!(
                    "Rejected upload, unrecognised leading bytes {:02X?}",
                    &prefix[..prefix.len().min(4)]
                );
                return Err(e);
            }
        };

        let key = (self.key_generator)();
        debug!("Ingesting {} upload as {}", codec.name, key);

        let (upload_side, tee_side) = tokio::io::duplex(PIPE_CAPACITY);
        let upload = {
            let store = Arc::clone(&self.store);
            let key = key.clone();
            tokio::spawn(async move {
                store
                    .put(&key, Box::pin(upload_side), codec.content_type)
                    .await
            })
        };

        // The sniffed prefix goes back in front so both sides see every byte.
        let logical = Cursor::new(prefix).chain(source);
        let source = SyncIoBridge::new(logical);
        let sink = SyncIoBridge::new(tee_side);
        let registry = Arc::clone(&self.registry);
        let validation = tokio::task::spawn_blocking(move || validate(&registry, source, sink))
            .await
            .map_err(|e| Error::Invariant(format!("Validation task join error: {}", e)))
            .and_then(|outcome| outcome);

        let upload = upload
            .await
            .map_err(|e| Error::Invariant(format!("Upload task join error: {}", e)))
            .and_then(|outcome| outcome);

        match validation {
            Ok(()) => match upload {
                Ok(()) => {
                    info!("Stored image {} ({})", key, codec.content_type);
                    Ok(key)
                }
                Err(e) => {
                    error!("error uploading image {}: {}", key, e);
                    Err(e)
                }
            },
            Err(e) => {
                warn!("Rejected upload {}: {}", key, e);
                self.discard(&key, upload.is_ok()).await;
                Err(e)
            }
        }
    }

    async fn discard(&self, key: &str, uploaded: bool) {
        match self.store.delete(key).await {
            Ok(()) => debug!("Removed rejected upload {}", key),
            Err(e) if uploaded => warn!("error deleting invalid image {}, object leaked: {}", key, e),
            Err(e) => debug!("Nothing removed for failed upload {}: {}", key, e),
        }
    }
}

async fn read_prefix(source: &mut ImageStream) -> Result<Vec<u8>> {
    let mut prefix = Vec::with_capacity(SNIFF_LEN);
    (&mut *source)
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut prefix)
        .await?;
    Ok(prefix)
}

fn validate<R>(
    registry: &CodecRegistry,
    source: SyncIoBridge<R>,
    sink: SyncIoBridge<DuplexStream>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut tee = TeeReader::new(source, sink);

    // The decoder may stop before the end of the stream; the rest still
    // belongs to the stored object.
    let decoded = registry
        .detect_and_decode(&mut tee)
        .and_then(|_| tee.drain().map_err(Error::from));

    let outcome = match decoded {
        Ok(_) => Ok(()),
        Err(e) => match tee.source_error() {
            Some(source_err) => Err(Error::Stream(io::Error::new(
                source_err.kind(),
                source_err.to_string(),
            ))),
            None => {
                debug!("Validation decode failed: {}", e);
                Err(Error::NotAnImage)
            }
        },
    };

    if let Some(mut sink) = tee.into_sink() {
        if let Err(e) = sink.shutdown() {
            debug!("Closing upload pipe failed: {}", e);
        }
    }
    outcome
}
