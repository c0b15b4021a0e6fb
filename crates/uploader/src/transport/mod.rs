//! Transport trait consumed by the upload manager.
//!
//! The caller supplies an implementation (HTTP client, object-store SDK,
//! local directory). Transports must not retry on their own: the manager owns
//! the retry policy and classifies failures by [`TransportError::transient`].

mod local;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use chunkyard_protocol::{ByteRange, Destination};

use crate::error::TransportError;

pub use local::LocalTransport;

/// Boxed future returned by [`Transport`] methods.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Opaque acknowledgment for a stored chunk (typically an ETag).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckToken(String);

impl AckToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One chunk of a multi-chunk upload.
#[derive(Debug, Clone)]
pub struct ChunkPart {
    pub destination: Destination,
    pub range: ByteRange,
    pub index: usize,
    pub total_chunks: usize,
    /// SHA-256 hex digest of `data`.
    pub checksum: String,
    pub data: Vec<u8>,
}

/// Sends bytes to storage.
pub trait Transport: Send + Sync {
    /// Stores one chunk and returns its acknowledgment.
    fn send_chunk(&self, part: ChunkPart) -> TransportFuture<'_, AckToken>;

    /// Combines acknowledged chunks, given in byte-range order, into the
    /// final object. Only called for multi-chunk uploads.
    fn finalize<'a>(
        &'a self,
        destination: &'a Destination,
        ack_tokens: &'a [AckToken],
    ) -> TransportFuture<'a, ()>;

    /// Stores a payload that fits in a single chunk.
    fn send_whole<'a>(&'a self, destination: &'a Destination, data: Vec<u8>)
    -> TransportFuture<'a, ()>;
}
