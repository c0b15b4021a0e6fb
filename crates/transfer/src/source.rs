use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chunkyard_protocol::ByteRange;
use sha2::{Digest, Sha256};

use crate::TransferError;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// ByteSource
// ---------------------------------------------------------------------------

/// A finite, seekable payload the uploader reads ranges from.
///
/// The caller owns the source and must keep it readable until the upload
/// reaches a terminal state. Reads may block; the uploader calls them from
/// the blocking pool.
pub trait ByteSource: Send + Sync {
    /// Total size of the payload in bytes.
    fn len(&self) -> u64;

    /// Reads exactly the bytes in `range`.
    fn read_range(&self, range: ByteRange) -> Result<Vec<u8>, TransferError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_bounds(range: ByteRange, size: u64) -> Result<(), TransferError> {
    if range.end_exclusive() > size {
        return Err(TransferError::RangeOutOfBounds {
            offset: range.offset,
            length: range.length,
            size,
        });
    }
    Ok(())
}

/// A file on disk, read range by range.
pub struct FileSource {
    file: Mutex<std::fs::File>,
    size: u64,
}

impl FileSource {
    /// Opens `path` and records its current size.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_range(&self, range: ByteRange) -> Result<Vec<u8>, TransferError> {
        check_bounds(range, self.size)?;
        let mut buf = vec![0u8; range.length as usize];
        if buf.is_empty() {
            return Ok(buf);
        }
        // Seek + read must not interleave with another reader.
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(range.offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// An in-memory payload.
#[derive(Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, range: ByteRange) -> Result<Vec<u8>, TransferError> {
        check_bounds(range, self.len())?;
        let start = range.offset as usize;
        let end = range.end_exclusive() as usize;
        Ok(self.data[start..end].to_vec())
    }
}
