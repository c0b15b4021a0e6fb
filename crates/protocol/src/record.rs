//! Persisted upload state, used to resume uploads across process restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChunkStatus, Destination, UploadId, UploadStatus};

/// Persisted state of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub index: usize,
    pub status: ChunkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_token: Option<String>,
}

/// Persisted state of an upload.
///
/// Holds enough to re-plan the chunk set deterministically from
/// `total_bytes` and `chunk_size` and to skip chunks already acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub upload_id: UploadId,
    pub destination: Destination,
    pub total_bytes: u64,
    pub chunk_size: u64,
    pub status: UploadStatus,
    pub chunks: Vec<ChunkRecord>,
    /// Caller-supplied label, typically the local path of the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    /// Number of chunks already acknowledged by the transport.
    pub fn completed_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .count()
    }
}
