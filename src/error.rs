//! Error handling and custom error types
//!
//! Provides unified error handling across the crate using thiserror. Callers
//! map variants onto request outcomes with [`Error::is_validation`] and
//! [`Error::is_not_found`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The payload did not match any registered image format, or failed to decode.
    #[error("unrecognised image data")]
    NotAnImage,

    #[error("unsupported image type: {0}")]
    UnsupportedFormat(String),

    #[error("image {0} not found")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// I/O failure on a byte stream, e.g. a transport severed mid-copy.
    #[error("stream error: {0}")]
    Stream(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment variable error: {0}")]
    EnvVar(#[from] dotenvy::Error),

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// True for errors caused by the request itself rather than the server.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::NotAnImage | Error::UnsupportedFormat(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
