//! Public entry point tying the scheduler, workers, reporter and store
//! together.

use std::sync::Arc;

use chunkyard_protocol::{Destination, UploadId, UploadProgress, UploadRecord, UploadStatus};
use chunkyard_transfer::{ByteSource, validate_destination};
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::driver::drive;
use crate::error::UploadError;
use crate::reporter::{ProgressCallback, ProgressEvent, ProgressReporter};
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::store::RecordStore;
use crate::task::{TaskSpec, UploadTask};
use crate::transport::Transport;

/// Per-upload overrides for [`UploadManager::submit`].
#[derive(Clone, Default)]
pub struct SubmitOptions {
    /// Overrides [`ManagerConfig::chunk_size`].
    pub chunk_size: Option<u64>,
    /// Overrides [`ManagerConfig::chunk_concurrency`].
    pub concurrency_hint: Option<usize>,
    pub on_progress: Option<ProgressCallback>,
    /// Free-form caller data kept in the persisted record (the CLI stores the
    /// source path here).
    pub label: Option<String>,
}

impl SubmitOptions {
    pub fn chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn concurrency_hint(mut self, chunks: usize) -> Self {
        self.concurrency_hint = Some(chunks);
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl std::fmt::Debug for SubmitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitOptions")
            .field("chunk_size", &self.chunk_size)
            .field("concurrency_hint", &self.concurrency_hint)
            .field("on_progress", &self.on_progress.is_some())
            .field("label", &self.label)
            .finish()
    }
}

/// State shared by the manager handle and its workers.
pub(crate) struct Shared {
    pub config: ManagerConfig,
    pub policy: RetryPolicy,
    pub scheduler: Scheduler,
    pub transport: Arc<dyn Transport>,
    pub reporter: ProgressReporter,
    pub store: Option<Arc<RecordStore>>,
    /// Serializes persistence so the last write reflects the latest state.
    persist_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    /// Writes the task's record, or removes it once there is nothing left to
    /// resume. Failures are logged; persistence never fails an upload.
    pub async fn persist(&self, task: &UploadTask) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let result = match task.status() {
            UploadStatus::Completed | UploadStatus::Cancelled => store.remove(task.id()).await,
            _ => store.save(&task.to_record()).await,
        };
        if let Err(e) = result {
            warn!(upload = %task.id(), error = %e, "failed to persist upload record");
        }
    }
}

/// Fills free slots and spawns a worker for each admitted upload.
pub(crate) fn pump(shared: &Arc<Shared>) {
    for admission in shared.scheduler.admit() {
        shared.reporter.status_changed(&admission.task);
        tokio::spawn(drive(Arc::clone(shared), admission));
    }
}

/// Resumable chunked upload manager.
///
/// Accepts uploads, runs at most `concurrency_limit` of them at a time in
/// FIFO order, retries transient chunk failures with backoff, and reports
/// progress through callbacks. Cloning yields another handle to the same
/// manager. Must be created and used inside a Tokio runtime.
#[derive(Clone)]
pub struct UploadManager {
    shared: Arc<Shared>,
}

impl UploadManager {
    pub fn new(config: ManagerConfig, transport: Arc<dyn Transport>) -> Result<Self, UploadError> {
        Self::build(config, transport, None)
    }

    /// Like [`UploadManager::new`], persisting every upload's chunk state in
    /// `store` so it can be [restored](UploadManager::restore) later.
    pub fn with_store(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        store: RecordStore,
    ) -> Result<Self, UploadError> {
        Self::build(config, transport, Some(Arc::new(store)))
    }

    fn build(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        store: Option<Arc<RecordStore>>,
    ) -> Result<Self, UploadError> {
        config.validate()?;
        let shared = Shared {
            policy: config.retry_policy(),
            scheduler: Scheduler::new(config.concurrency_limit),
            transport,
            reporter: ProgressReporter::spawn(),
            store,
            persist_lock: tokio::sync::Mutex::new(()),
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Queues an upload of `total_bytes` from `source` and returns at once.
    pub fn submit(
        &self,
        source: Arc<dyn ByteSource>,
        destination: Destination,
        total_bytes: u64,
        options: SubmitOptions,
    ) -> Result<UploadId, UploadError> {
        validate_destination(&destination).map_err(UploadError::invalid)?;
        let chunk_size = options.chunk_size.unwrap_or(self.shared.config.chunk_size);
        let chunk_concurrency = self.chunk_concurrency(&options)?;

        let task = UploadTask::new(TaskSpec {
            id: UploadId::new(uuid::Uuid::new_v4().to_string()),
            source,
            destination,
            total_bytes,
            chunk_size,
            chunk_concurrency,
            label: options.label,
        })?;
        let id = task.id().clone();
        info!(
            upload = %id,
            destination = %task.destination(),
            bytes = total_bytes,
            chunks = task.chunk_count(),
            "upload queued"
        );
        self.enqueue(task, options.on_progress)?;
        Ok(id)
    }

    /// Re-registers an upload from a persisted record under its original id.
    ///
    /// Chunks already acknowledged are not sent again. Failed, paused and
    /// interrupted uploads all come back `Queued`.
    pub fn restore(
        &self,
        record: &UploadRecord,
        source: Arc<dyn ByteSource>,
        options: SubmitOptions,
    ) -> Result<UploadId, UploadError> {
        if matches!(
            record.status,
            UploadStatus::Completed | UploadStatus::Cancelled
        ) {
            return Err(UploadError::InvalidConfiguration(format!(
                "upload {} is {} and cannot be restored",
                record.upload_id, record.status
            )));
        }
        validate_destination(&record.destination).map_err(UploadError::invalid)?;
        let chunk_concurrency = self.chunk_concurrency(&options)?;
        let task = UploadTask::from_record(record, source, chunk_concurrency)?;
        let id = task.id().clone();
        info!(
            upload = %id,
            destination = %task.destination(),
            completed = record.completed_chunks(),
            chunks = record.chunks.len(),
            "upload restored"
        );
        self.enqueue(task, options.on_progress)?;
        Ok(id)
    }

    fn chunk_concurrency(&self, options: &SubmitOptions) -> Result<usize, UploadError> {
        match options.concurrency_hint {
            Some(0) => Err(UploadError::InvalidConfiguration(
                "concurrency_hint must be at least 1".into(),
            )),
            Some(n) => Ok(n),
            None => Ok(self.shared.config.chunk_concurrency),
        }
    }

    fn enqueue(
        &self,
        task: UploadTask,
        on_progress: Option<ProgressCallback>,
    ) -> Result<(), UploadError> {
        let task = Arc::new(task);
        let reporter = &self.shared.reporter;
        // The callback and the `Queued` event go out before any worker can
        // report on the task.
        self.shared.scheduler.insert(Arc::clone(&task), |task| {
            if let Some(callback) = on_progress {
                reporter.register(task.id().clone(), callback);
            }
            reporter.status_changed(task);
        })?;
        if self.shared.store.is_some() {
            let shared = Arc::clone(&self.shared);
            let task = Arc::clone(&task);
            tokio::spawn(async move { shared.persist(&task).await });
        }
        pump(&self.shared);
        Ok(())
    }

    /// Pauses an active upload. Chunks in flight finish; no new ones start.
    ///
    /// Returns `Ok(false)` if the upload is not active (or already
    /// committing).
    pub async fn pause(&self, id: &UploadId) -> Result<bool, UploadError> {
        let Some(task) = self.shared.scheduler.pause(id)? else {
            return Ok(false);
        };
        info!(upload = %id, "upload paused");
        self.after_stop(&task).await;
        Ok(true)
    }

    /// Puts a paused upload back at the end of the queue.
    pub async fn resume(&self, id: &UploadId) -> Result<bool, UploadError> {
        let Some(task) = self.shared.scheduler.resume(id)? else {
            return Ok(false);
        };
        info!(upload = %id, "upload resumed");
        self.shared.reporter.status_changed(&task);
        pump(&self.shared);
        Ok(true)
    }

    /// Cancels a queued, active or paused upload. The object is never
    /// finalized and its persisted record is removed.
    pub async fn cancel(&self, id: &UploadId) -> Result<bool, UploadError> {
        let Some(task) = self.shared.scheduler.cancel(id)? else {
            return Ok(false);
        };
        info!(upload = %id, "upload cancelled");
        self.after_stop(&task).await;
        Ok(true)
    }

    async fn after_stop(&self, task: &UploadTask) {
        self.shared.persist(task).await;
        self.shared.reporter.status_changed(task);
        pump(&self.shared);
    }

    pub fn get_progress(&self, id: &UploadId) -> Result<UploadProgress, UploadError> {
        Ok(self.shared.scheduler.get(id)?.progress())
    }

    /// Snapshot of every registered upload.
    pub fn list(&self) -> Vec<UploadProgress> {
        let mut all: Vec<UploadProgress> = self
            .shared
            .scheduler
            .list()
            .iter()
            .map(|task| task.progress())
            .collect();
        all.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));
        all
    }

    /// Resolves with the final snapshot once the upload reaches a terminal
    /// state, after its terminal progress event has been delivered.
    pub async fn wait(&self, id: &UploadId) -> Result<UploadProgress, UploadError> {
        let task = self.shared.scheduler.get(id)?;
        let mut rx = task.subscribe();
        let closed = rx.wait_for(|status| status.is_terminal()).await.is_err();
        if closed {
            debug!(upload = %id, "status channel closed while waiting");
        }
        self.shared.reporter.flush().await;
        Ok(task.progress())
    }

    /// Registers a callback for the events of every upload.
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.shared.reporter.subscribe(Arc::new(callback));
    }

    pub fn active_count(&self) -> usize {
        self.shared.scheduler.active_count()
    }

    pub fn queued_count(&self) -> usize {
        self.shared.scheduler.queued_count()
    }

    /// Drops a finished upload from the manager. Returns `Ok(false)` while
    /// it is still queued, active or paused.
    pub fn forget(&self, id: &UploadId) -> Result<bool, UploadError> {
        if !self.shared.scheduler.forget(id)? {
            return Ok(false);
        }
        self.shared.reporter.forget(id.clone());
        Ok(true)
    }
}

impl std::fmt::Debug for UploadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadManager")
            .field("config", &self.shared.config)
            .field("active", &self.active_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}
