//! Shared types for Chunkyard uploads.
//!
//! Everything here is plain data with a stable JSON form, so it can cross
//! crate boundaries and be written to disk for resume.

pub mod record;
pub mod types;

pub use record::{ChunkRecord, UploadRecord};
pub use types::{ByteRange, ChunkStatus, Destination, UploadId, UploadProgress, UploadStatus};
