//! Application service tying the blob store to the ingestion and conversion
//! pipelines.

use crate::codec::CodecRegistry;
use crate::models::{Config, Image, ImageStream};
use crate::pipeline::{Completion, Converter, Ingestor, KeyGenerator};
use crate::store::{BlobStore, MemoryBlobStore, S3BlobStore};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::info;

/// Stores and retrieves images, converting formats on the way out.
pub struct ImageService {
    store: Arc<dyn BlobStore>,
    ingestor: Ingestor,
    converter: Converter,
    max_upload_bytes: u64,
}

impl ImageService {
    pub fn new(store: Arc<dyn BlobStore>, registry: CodecRegistry, max_upload_bytes: u64) -> Self {
        let registry = Arc::new(registry);
        Self {
            ingestor: Ingestor::new(Arc::clone(&store), Arc::clone(&registry)),
            converter: Converter::new(registry),
            store,
            max_upload_bytes,
        }
    }

    /// Construct a service from environment configuration (`Config::from_env`).
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store: Arc<dyn BlobStore> = if config.dry_run {
            info!("DRY_RUN enabled, images are kept in memory only");
            Arc::new(MemoryBlobStore::new())
        } else {
            let missing = |name: &str| Error::Config(format!("{} not set", name));
            Arc::new(
                S3BlobStore::new(
                    config
                        .s3_access_key
                        .clone()
                        .ok_or_else(|| missing("S3_ACCESS_KEY"))?,
                    config
                        .s3_secret_key
                        .clone()
                        .ok_or_else(|| missing("S3_SECRET_KEY"))?,
                    config
                        .s3_endpoint
                        .clone()
                        .ok_or_else(|| missing("S3_ENDPOINT"))?,
                    config.s3_region.clone(),
                    config.s3_bucket.clone(),
                )
                .await?,
            )
        };

        Ok(Self::new(
            store,
            CodecRegistry::default(),
            config.max_upload_bytes,
        ))
    }

    pub fn with_key_generator(mut self, key_generator: KeyGenerator) -> Self {
        self.ingestor = self.ingestor.with_key_generator(key_generator);
        self
    }

    pub async fn ensure_bucket(&self) -> Result<()> {
        self.store.ensure_bucket().await
    }

    /// Validate and store an image. Input beyond the size cap is cut off,
    /// which the decoder then sees as a truncated image.
    pub async fn upload(&self, data: ImageStream) -> Result<String> {
        let capped: ImageStream = Box::pin(data.take(self.max_upload_bytes));
        self.ingestor.ingest(capped).await
    }

    pub async fn get(&self, id: &str) -> Result<Image> {
        let object = self.store.get(id).await?;
        Ok(Image::stored(id, object.content_type, object.data))
    }

    /// Fetch an image re-encoded as `format`. The format is checked before
    /// the store is touched.
    pub async fn get_as(&self, id: &str, format: &str) -> Result<(Image, Completion)> {
        self.converter.target(format)?;
        let image = self.get(id).await?;
        self.converter.convert(image, format).await
    }

    /// Resolve `<id>.<ext>` to a converted image. Any other name, with no
    /// dot or with several, is looked up as a bare id.
    pub async fn resolve(&self, name: &str) -> Result<(Image, Completion)> {
        let mut parts = name.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(ext), None) => self.get_as(id, ext).await,
            _ => Ok((self.get(name).await?, Completion::ready())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let image = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            8,
            8,
            image::Rgb([1, 2, 3]),
        ));
        let mut bytes = Vec::new();
        Codec::png().encode(&image, &mut bytes).unwrap();
        bytes
    }

    fn service(store: &MemoryBlobStore, cap: u64) -> ImageService {
        ImageService::new(Arc::new(store.clone()), CodecRegistry::default(), cap)
    }

    #[tokio::test]
    async fn test_upload_and_get() {
        let store = MemoryBlobStore::new();
        let service = service(&store, 1024 * 1024);
        let bytes = png_bytes();

        let id = service
            .upload(Box::pin(Cursor::new(bytes.clone())))
            .await
            .unwrap();
        let image = service.get(&id).await.unwrap();

        assert_eq!(image.id.as_deref(), Some(id.as_str()));
        assert_eq!(image.content_type, "image/png");
        assert_eq!(image.into_bytes().await.unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_upload_over_cap_is_rejected() {
        let store = MemoryBlobStore::new();
        let bytes = png_bytes();
        let service = service(&store, (bytes.len() / 2) as u64);

        let err = service
            .upload(Box::pin(Cursor::new(bytes)))
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_get_as_checks_format_first() {
        let store = MemoryBlobStore::new();
        let err = service(&store, 1024)
            .get_as("missing", "bmp")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn test_resolve_routes_extension() {
        let store = MemoryBlobStore::new().with_object(
            "abc".to_string(),
            png_bytes(),
            "image/png".to_string(),
        );
        let service = service(&store, 1024 * 1024);

        let (plain, _) = service.resolve("abc").await.unwrap();
        assert_eq!(plain.content_type, "image/png");

        let (converted, completion) = service.resolve("abc.jpg").await.unwrap();
        assert_eq!(converted.content_type, "image/jpeg");
        let bytes = converted.into_bytes().await.unwrap();
        completion.wait().await.unwrap();
        assert_eq!(&bytes[..3], &[0xFF, 0xD8, 0xFF]);
    }

    #[tokio::test]
    async fn test_resolve_several_dots_is_bare_id() {
        let store = MemoryBlobStore::new().with_object(
            "a.b.c".to_string(),
            png_bytes(),
            "image/png".to_string(),
        );
        let service = service(&store, 1024 * 1024);

        let (image, _) = service.resolve("a.b.c").await.unwrap();
        assert_eq!(image.id.as_deref(), Some("a.b.c"));
        assert_eq!(image.into_bytes().await.unwrap(), png_bytes());

        let err = service.resolve("x.y.z").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_resolve_missing() {
        let store = MemoryBlobStore::new();
        let err = service(&store, 1024).resolve("nope.png").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
