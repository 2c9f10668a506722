//! Streaming ingestion and conversion pipelines
//!
//! Ingestion tees one incoming stream into the blob store and a validating
//! decoder at the same time. Conversion re-encodes a stored image into a new
//! stream while encoding is still running. Both move bytes through bounded
//! in-memory pipes, so memory use does not grow with payload size.

pub mod convert;
pub mod ingest;

pub use convert::{Completion, Converter};
pub use ingest::{Ingestor, KeyGenerator};

/// Capacity of the in-memory pipes between producers and consumers.
pub const PIPE_CAPACITY: usize = 64 * 1024;
