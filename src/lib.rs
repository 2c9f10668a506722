//! ProgImage - validated image storage with on-the-fly format conversion
//!
//! Uploads are streamed into blob storage while being decoded to prove they
//! are images; stored images can be fetched re-encoded as PNG, JPEG or GIF
//! without waiting for the encoder to finish.

pub mod app;
pub mod codec;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod store;

pub use error::{Error, Result};
