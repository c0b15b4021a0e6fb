//! Per-upload state: chunk bookkeeping and the lifecycle state machine.
//!
//! A task is shared between the scheduler (status changes under its lock)
//! and the worker currently driving it. Each admission gets a new epoch; a
//! worker only claims chunks while the task is `Active` under its epoch, so a
//! worker left over from before a pause stops on its own.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use chunkyard_protocol::{
    ByteRange, ChunkRecord, ChunkStatus, Destination, UploadId, UploadProgress, UploadRecord,
    UploadStatus,
};
use chunkyard_transfer::{ByteSource, plan};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::error::UploadError;
use crate::transport::AckToken;

#[derive(Debug, Clone)]
struct Chunk {
    range: ByteRange,
    status: ChunkStatus,
    attempt: u32,
    ack: Option<AckToken>,
    /// Epoch of the worker that last claimed this chunk.
    claimed_by: u64,
}

impl Chunk {
    fn pending(range: ByteRange) -> Self {
        Self {
            range,
            status: ChunkStatus::Pending,
            attempt: 0,
            ack: None,
            claimed_by: 0,
        }
    }
}

/// A chunk handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkClaim {
    pub index: usize,
    pub range: ByteRange,
}

/// Everything needed to create a task.
pub(crate) struct TaskSpec {
    pub id: UploadId,
    pub source: Arc<dyn ByteSource>,
    pub destination: Destination,
    pub total_bytes: u64,
    pub chunk_size: u64,
    pub chunk_concurrency: usize,
    pub label: Option<String>,
}

pub(crate) struct UploadTask {
    id: UploadId,
    destination: Destination,
    total_bytes: u64,
    chunk_size: u64,
    chunk_concurrency: usize,
    label: Option<String>,
    source: Arc<dyn ByteSource>,
    inner: RwLock<TaskInner>,
    status_tx: watch::Sender<UploadStatus>,
    /// Signalled whenever an in-flight chunk settles.
    settled: Notify,
}

struct TaskInner {
    status: UploadStatus,
    chunks: Vec<Chunk>,
    transferred_bytes: u64,
    admissions: u32,
    epoch: u64,
    run_token: Option<CancellationToken>,
    /// Set once the current run has started committing the object.
    finalizing: bool,
    last_error: Option<UploadError>,
}

impl TaskInner {
    /// Re-admissions after the first run.
    fn retry_count(&self) -> u32 {
        self.admissions.saturating_sub(1)
    }
}

impl UploadTask {
    /// Creates a queued task, planning its chunks once.
    pub fn new(spec: TaskSpec) -> Result<Self, UploadError> {
        check_source_len(spec.source.as_ref(), spec.total_bytes)?;
        let chunks = plan(spec.total_bytes, spec.chunk_size)
            .map_err(UploadError::invalid)?
            .into_iter()
            .map(Chunk::pending)
            .collect();
        Ok(Self::build(spec, chunks, 0))
    }

    /// Rebuilds a task from a persisted record.
    ///
    /// The chunk set is re-planned from the record's size and chunk size and
    /// must line up with the persisted chunks; acknowledged chunks are kept,
    /// everything else goes back to pending.
    pub fn from_record(
        record: &UploadRecord,
        source: Arc<dyn ByteSource>,
        chunk_concurrency: usize,
    ) -> Result<Self, UploadError> {
        check_source_len(source.as_ref(), record.total_bytes)?;
        let ranges = plan(record.total_bytes, record.chunk_size).map_err(UploadError::invalid)?;
        let count = ranges.len();
        if count != record.chunks.len() {
            return Err(UploadError::InvalidConfiguration(format!(
                "record for {} lists {} chunks, plan has {count}",
                record.upload_id,
                record.chunks.len()
            )));
        }

        let mut chunks = Vec::with_capacity(count);
        for (index, (range, saved)) in ranges.into_iter().zip(&record.chunks).enumerate() {
            if saved.index != index {
                return Err(UploadError::InvalidConfiguration(format!(
                    "record for {} has chunk {} at position {index}",
                    record.upload_id, saved.index
                )));
            }
            let mut chunk = Chunk::pending(range);
            if saved.status == ChunkStatus::Completed {
                if count > 1 && saved.ack_token.is_none() {
                    return Err(UploadError::InvalidConfiguration(format!(
                        "record for {}: completed chunk {index} has no ack token",
                        record.upload_id
                    )));
                }
                chunk.status = ChunkStatus::Completed;
                chunk.ack = saved.ack_token.clone().map(AckToken::new);
            }
            chunks.push(chunk);
        }

        let spec = TaskSpec {
            id: record.upload_id.clone(),
            source,
            destination: record.destination.clone(),
            total_bytes: record.total_bytes,
            chunk_size: record.chunk_size,
            chunk_concurrency,
            label: record.label.clone(),
        };
        // A restored task has been admitted before; its next run is a retry.
        Ok(Self::build(spec, chunks, 1))
    }

    fn build(spec: TaskSpec, chunks: Vec<Chunk>, admissions: u32) -> Self {
        let transferred_bytes = chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .map(|c| c.range.length)
            .sum();
        let (status_tx, _) = watch::channel(UploadStatus::Queued);
        Self {
            id: spec.id,
            destination: spec.destination,
            total_bytes: spec.total_bytes,
            chunk_size: spec.chunk_size,
            chunk_concurrency: spec.chunk_concurrency.max(1),
            label: spec.label,
            source: spec.source,
            inner: RwLock::new(TaskInner {
                status: UploadStatus::Queued,
                chunks,
                transferred_bytes,
                admissions,
                epoch: 0,
                run_token: None,
                finalizing: false,
                last_error: None,
            }),
            status_tx,
            settled: Notify::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TaskInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TaskInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &UploadId {
        &self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn chunk_concurrency(&self) -> usize {
        self.chunk_concurrency
    }

    pub fn chunk_count(&self) -> usize {
        self.read().chunks.len()
    }

    /// Payloads that fit in one chunk are sent with a single request.
    pub fn is_single_shot(&self) -> bool {
        self.chunk_count() == 1
    }

    pub fn source(&self) -> Arc<dyn ByteSource> {
        Arc::clone(&self.source)
    }

    pub fn status(&self) -> UploadStatus {
        self.read().status
    }

    /// Status as last published with [`UploadTask::publish_status`].
    pub fn subscribe(&self) -> watch::Receiver<UploadStatus> {
        self.status_tx.subscribe()
    }

    /// Pushes the current status to watchers. Called after the matching
    /// progress event has been queued, so a watcher that sees a terminal
    /// status can rely on that event being on its way.
    pub fn publish_status(&self) {
        let status = self.status();
        self.status_tx.send_replace(status);
    }

    pub fn settled(&self) -> &Notify {
        &self.settled
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn apply(&self, inner: &mut TaskInner, next: UploadStatus) -> bool {
        if !inner.status.can_transition_to(next) {
            return false;
        }
        inner.status = next;
        true
    }

    /// Applies a lifecycle transition if the state machine allows it.
    pub fn transition(&self, next: UploadStatus) -> bool {
        let mut s = self.write();
        self.apply(&mut s, next)
    }

    /// `Queued → Active` for a new admission.
    pub fn activate(&self, epoch: u64, token: CancellationToken) -> bool {
        let mut s = self.write();
        if !self.apply(&mut s, UploadStatus::Active) {
            return false;
        }
        s.epoch = epoch;
        s.run_token = Some(token);
        s.finalizing = false;
        s.admissions += 1;
        true
    }

    /// Marks the run with `epoch` as committing. From here on the upload can
    /// still be cancelled but no longer paused.
    pub fn begin_finalize(&self, epoch: u64) -> bool {
        let mut s = self.write();
        if s.status != UploadStatus::Active || s.epoch != epoch {
            return false;
        }
        s.finalizing = true;
        true
    }

    /// Leaves `Active`/`Queued`/`Paused` for `next` and interrupts any
    /// backoff sleep of the current run. In-flight sends are left alone.
    pub fn stop(&self, next: UploadStatus) -> bool {
        let mut s = self.write();
        if next == UploadStatus::Paused && s.finalizing {
            return false;
        }
        if !self.apply(&mut s, next) {
            return false;
        }
        if let Some(token) = s.run_token.take() {
            token.cancel();
        }
        true
    }

    /// Moves the run identified by `epoch` to `Completed` or `Failed`.
    ///
    /// Returns `false` if the run is stale (the task was paused or cancelled
    /// meanwhile).
    pub fn finish(&self, epoch: u64, outcome: Result<(), UploadError>) -> bool {
        let mut s = self.write();
        if s.status != UploadStatus::Active || s.epoch != epoch {
            return false;
        }
        let next = match outcome {
            Ok(()) => UploadStatus::Completed,
            Err(err) => {
                s.last_error = Some(err);
                UploadStatus::Failed
            }
        };
        s.run_token = None;
        s.finalizing = false;
        self.apply(&mut s, next)
    }

    /// Whether the run with `epoch` may still start work.
    pub fn is_current(&self, epoch: u64) -> bool {
        let s = self.read();
        s.status == UploadStatus::Active && s.epoch == epoch
    }

    pub fn record_error(&self, err: UploadError) {
        self.write().last_error = Some(err);
    }

    pub fn last_error(&self) -> Option<UploadError> {
        self.read().last_error.clone()
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    /// Marks the lowest pending chunk in flight for the run with `epoch`.
    pub fn claim_next(&self, epoch: u64) -> Option<ChunkClaim> {
        let mut s = self.write();
        if s.status != UploadStatus::Active || s.epoch != epoch {
            return None;
        }
        let (index, chunk) = s
            .chunks
            .iter_mut()
            .enumerate()
            .find(|(_, c)| c.status == ChunkStatus::Pending)?;
        chunk.status = ChunkStatus::InFlight;
        chunk.claimed_by = epoch;
        Some(ChunkClaim {
            index,
            range: chunk.range,
        })
    }

    pub fn has_in_flight(&self) -> bool {
        self.read()
            .chunks
            .iter()
            .any(|c| c.status == ChunkStatus::InFlight)
    }

    /// A chunk that failed for good, possibly under an earlier run.
    pub fn failed_chunk(&self) -> Option<usize> {
        self.read()
            .chunks
            .iter()
            .position(|c| c.status == ChunkStatus::Failed)
    }

    pub fn all_completed(&self) -> bool {
        self.read()
            .chunks
            .iter()
            .all(|c| c.status == ChunkStatus::Completed)
    }

    pub fn chunk_attempt(&self, index: usize) -> u32 {
        self.read().chunks.get(index).map_or(0, |c| c.attempt)
    }

    /// Counts one retry of chunk `index` and returns the new attempt number.
    pub fn bump_attempt(&self, index: usize) -> u32 {
        let mut s = self.write();
        match s.chunks.get_mut(index) {
            Some(chunk) => {
                chunk.attempt += 1;
                chunk.attempt
            }
            None => 0,
        }
    }

    /// Records an acknowledged chunk. Returns the bytes added to the running
    /// total (0 if the chunk was already completed).
    pub fn complete_chunk(&self, index: usize, ack: Option<AckToken>) -> u64 {
        let added = {
            let mut s = self.write();
            let added = match s.chunks.get_mut(index) {
                Some(chunk) if chunk.status != ChunkStatus::Completed => {
                    chunk.status = ChunkStatus::Completed;
                    chunk.ack = ack;
                    chunk.range.length
                }
                _ => 0,
            };
            s.transferred_bytes += added;
            added
        };
        self.settled.notify_waiters();
        added
    }

    /// Returns an in-flight chunk to pending without touching its attempts.
    pub fn release_chunk(&self, index: usize) {
        self.set_in_flight_status(index, ChunkStatus::Pending);
    }

    pub fn fail_chunk(&self, index: usize) {
        self.set_in_flight_status(index, ChunkStatus::Failed);
    }

    fn set_in_flight_status(&self, index: usize, status: ChunkStatus) {
        {
            let mut s = self.write();
            if let Some(chunk) = s.chunks.get_mut(index)
                && chunk.status == ChunkStatus::InFlight
            {
                chunk.status = status;
            }
        }
        self.settled.notify_waiters();
    }

    /// Returns every chunk still in flight for `epoch` to pending. Used when
    /// a run ends while some of its sends were abandoned.
    pub fn release_in_flight(&self, epoch: u64) {
        {
            let mut s = self.write();
            for chunk in s.chunks.iter_mut() {
                if chunk.status == ChunkStatus::InFlight && chunk.claimed_by == epoch {
                    chunk.status = ChunkStatus::Pending;
                }
            }
        }
        self.settled.notify_waiters();
    }

    /// Ack tokens in byte-range order, or the index of the first chunk
    /// without one.
    pub fn ordered_acks(&self) -> Result<Vec<AckToken>, usize> {
        self.read()
            .chunks
            .iter()
            .enumerate()
            .map(|(index, c)| match (&c.status, &c.ack) {
                (ChunkStatus::Completed, Some(ack)) => Ok(ack.clone()),
                _ => Err(index),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub fn progress(&self) -> UploadProgress {
        let s = self.read();
        UploadProgress {
            upload_id: self.id.clone(),
            status: s.status,
            total_bytes: self.total_bytes,
            transferred_bytes: s.transferred_bytes.min(self.total_bytes),
            retry_count: s.retry_count(),
            error: s.last_error.as_ref().map(ToString::to_string),
        }
    }

    /// Persistable view; chunks in flight are saved as pending.
    pub fn to_record(&self) -> UploadRecord {
        let s = self.read();
        UploadRecord {
            upload_id: self.id.clone(),
            destination: self.destination.clone(),
            total_bytes: self.total_bytes,
            chunk_size: self.chunk_size,
            status: s.status,
            chunks: s
                .chunks
                .iter()
                .enumerate()
                .map(|(index, c)| ChunkRecord {
                    index,
                    status: match c.status {
                        ChunkStatus::InFlight => ChunkStatus::Pending,
                        other => other,
                    },
                    ack_token: c.ack.as_ref().map(|a| a.as_str().to_string()),
                })
                .collect(),
            label: self.label.clone(),
            updated_at: Utc::now(),
        }
    }
}

fn check_source_len(source: &dyn ByteSource, total_bytes: u64) -> Result<(), UploadError> {
    if source.len() != total_bytes {
        return Err(UploadError::InvalidConfiguration(format!(
            "total_bytes is {total_bytes} but the source holds {} bytes",
            source.len()
        )));
    }
    Ok(())
}
