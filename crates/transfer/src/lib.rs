//! Chunk-level building blocks for resumable uploads.
//!
//! Nothing in this crate is async or stateful beyond a single call: the
//! planner is a pure function, sources read byte ranges on demand, and the
//! part store writes and assembles parts on disk.

mod parts;
mod planner;
mod source;
mod speed;
mod validation;

pub use parts::PartStore;
pub use planner::plan;
pub use source::{ByteSource, FileSource, MemorySource, checksum_bytes};
pub use speed::ThroughputWindow;
pub use validation::validate_destination;

/// Default chunk size: 5 MiB (the smallest part most object stores accept).
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch for part {0}")]
    ChecksumMismatch(usize),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("chunk size must be at least 1 byte")]
    InvalidChunkSize,

    #[error("range {offset}+{length} is outside a source of {size} bytes")]
    RangeOutOfBounds { offset: u64, length: u64, size: u64 },

    #[error("missing part {0}")]
    MissingPart(usize),
}
