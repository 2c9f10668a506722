//! Data models and structures
//!
//! Defines the [`Image`] value moving through the ingestion and conversion
//! pipelines, plus process configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A single-pass byte stream. Owned by value, so it can only be consumed once.
pub type ImageStream = Pin<Box<dyn AsyncRead + Send>>;

/// An image and its read-once data stream.
///
/// `id` is only ever set by the store side: it is `None` for an image that
/// has not been ingested yet. Images are never mutated in place; conversion
/// consumes one `Image` and produces another.
pub struct Image {
    pub id: Option<String>,
    pub content_type: String,
    pub data: ImageStream,
}

impl Image {
    pub fn new(content_type: impl Into<String>, data: ImageStream) -> Self {
        Self {
            id: None,
            content_type: content_type.into(),
            data,
        }
    }

    pub fn stored(id: impl Into<String>, content_type: impl Into<String>, data: ImageStream) -> Self {
        Self {
            id: Some(id.into()),
            content_type: content_type.into(),
            data,
        }
    }

    /// Drain the stream into memory.
    pub async fn into_bytes(mut self) -> crate::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.data.read_to_end(&mut bytes).await?;
        Ok(bytes)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("id", &self.id)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Body printed by `progimage upload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadResponse {
    pub id: String,
}

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 20 * 1024 * 1024;

// Configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub s3_region: String,
    pub s3_bucket: String,
    pub max_upload_bytes: u64,
    pub dry_run: bool,
}

impl Config {
    pub fn from_env() -> crate::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let dry_run = lookup("DRY_RUN")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let required = |key: &str| -> crate::Result<Option<String>> {
            match lookup(key) {
                Some(value) if !value.is_empty() => Ok(Some(value)),
                _ if dry_run => Ok(None),
                _ => Err(crate::Error::Config(format!("{} not set", key))),
            }
        };

        let max_upload_bytes = match lookup("MAX_UPLOAD_BYTES") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                crate::Error::Config(format!("MAX_UPLOAD_BYTES is not a number: {}", raw))
            })?,
            None => DEFAULT_MAX_UPLOAD_BYTES,
        };

        Ok(Self {
            s3_endpoint: required("S3_ENDPOINT")?,
            s3_access_key: required("S3_ACCESS_KEY")?,
            s3_secret_key: required("S3_SECRET_KEY")?,
            s3_region: lookup("S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            s3_bucket: lookup("S3_BUCKET").unwrap_or_else(|| "progimage".to_string()),
            max_upload_bytes,
            dry_run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_lookup(lookup_from(&[
            ("S3_ENDPOINT", "http://localhost:9000"),
            ("S3_ACCESS_KEY", "minio"),
            ("S3_SECRET_KEY", "miniostorage"),
        ]))
        .unwrap();

        assert_eq!(config.s3_bucket, "progimage");
        assert_eq!(config.s3_region, "us-east-1");
        assert_eq!(config.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_config_requires_endpoint() {
        let err = Config::from_lookup(lookup_from(&[("S3_ACCESS_KEY", "minio")])).unwrap_err();
        assert!(err.to_string().contains("S3_ENDPOINT"));
    }

    #[test]
    fn test_config_dry_run_skips_credentials() {
        let config = Config::from_lookup(lookup_from(&[
            ("DRY_RUN", "true"),
            ("MAX_UPLOAD_BYTES", "1024"),
        ]))
        .unwrap();

        assert!(config.dry_run);
        assert!(config.s3_endpoint.is_none());
        assert_eq!(config.max_upload_bytes, 1024);
    }

    #[test]
    fn test_config_rejects_bad_size() {
        let err = Config::from_lookup(lookup_from(&[
            ("DRY_RUN", "1"),
            ("MAX_UPLOAD_BYTES", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[tokio::test]
    async fn test_image_into_bytes() {
        let image = Image::stored("abc", "image/png", Box::pin(Cursor::new(vec![1, 2, 3])));
        assert_eq!(image.id.as_deref(), Some("abc"));
        assert_eq!(image.into_bytes().await.unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_upload_response_serialization() {
        let json = serde_json::to_string(&UploadResponse {
            id: "abc".to_string(),
        })
        .unwrap();
        assert_eq!(json, "{\"id\":\"abc\"}");
    }
}
