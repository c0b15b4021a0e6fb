//! Progress fan-out.
//!
//! Workers push snapshots into an unbounded channel and never wait; a single
//! dispatcher task owns the per-upload throughput windows and invokes the
//! callbacks. The dispatcher also enforces the guarantees callers rely on:
//! transferred bytes never exceed the total or go backwards, and once a
//! terminal status has been reported it is never replaced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chunkyard_protocol::{UploadId, UploadProgress, UploadStatus};
use chunkyard_transfer::ThroughputWindow;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::task::UploadTask;

/// Callback invoked for every [`ProgressEvent`] of the uploads it watches.
///
/// Runs on the dispatcher task; keep it short.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// One progress notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub progress: UploadProgress,
    /// Sliding-window upload rate; 0 until two samples exist.
    pub bytes_per_second: f64,
    /// Estimated time to completion while the upload is active.
    pub eta: Option<Duration>,
    /// Set when the event was caused by a completed chunk.
    pub chunk_index: Option<usize>,
}

enum ReportMessage {
    Register {
        id: UploadId,
        callback: ProgressCallback,
    },
    Subscribe(ProgressCallback),
    Chunk {
        progress: UploadProgress,
        index: usize,
        bytes: u64,
    },
    Status(UploadProgress),
    Forget(UploadId),
    Flush(oneshot::Sender<()>),
}

/// Handle to the dispatcher task. Cheap to clone.
#[derive(Clone)]
pub(crate) struct ProgressReporter {
    tx: mpsc::UnboundedSender<ReportMessage>,
}

impl ProgressReporter {
    /// Starts the dispatcher on the current runtime. It stops once every
    /// handle is dropped.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx));
        Self { tx }
    }

    fn send(&self, msg: ReportMessage) {
        if self.tx.send(msg).is_err() {
            debug!("progress dispatcher has stopped; dropping event");
        }
    }

    pub fn register(&self, id: UploadId, callback: ProgressCallback) {
        self.send(ReportMessage::Register { id, callback });
    }

    pub fn subscribe(&self, callback: ProgressCallback) {
        self.send(ReportMessage::Subscribe(callback));
    }

    pub fn chunk_completed(&self, task: &UploadTask, index: usize, bytes: u64) {
        self.send(ReportMessage::Chunk {
            progress: task.progress(),
            index,
            bytes,
        });
    }

    pub fn status_changed(&self, task: &UploadTask) {
        self.send(ReportMessage::Status(task.progress()));
        task.publish_status();
    }

    pub fn forget(&self, id: UploadId) {
        self.send(ReportMessage::Forget(id));
    }

    /// Resolves once every event sent before the call has been delivered.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(ReportMessage::Flush(tx));
        let _ = rx.await;
    }
}

#[derive(Default)]
struct Feed {
    callback: Option<ProgressCallback>,
    window: ThroughputWindow,
    last_bytes: u64,
    terminal: Option<UploadStatus>,
}

impl Feed {
    fn event(&mut self, mut progress: UploadProgress, chunk_index: Option<usize>) -> ProgressEvent {
        match self.terminal {
            Some(status) => progress.status = status,
            None if progress.status.is_terminal() => self.terminal = Some(progress.status),
            None => {}
        }

        progress.transferred_bytes = progress
            .transferred_bytes
            .min(progress.total_bytes)
            .max(self.last_bytes);
        self.last_bytes = progress.transferred_bytes;

        let remaining = progress.total_bytes - progress.transferred_bytes;
        let eta = match progress.status {
            UploadStatus::Completed => Some(Duration::ZERO),
            UploadStatus::Active => self.window.eta(remaining),
            _ => None,
        };
        ProgressEvent {
            bytes_per_second: self.window.bytes_per_second(),
            eta,
            chunk_index,
            progress,
        }
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<ReportMessage>) {
    let mut feeds: HashMap<UploadId, Feed> = HashMap::new();
    let mut subscribers: Vec<ProgressCallback> = Vec::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            ReportMessage::Register { id, callback } => {
                feeds.entry(id).or_default().callback = Some(callback);
            }
            ReportMessage::Subscribe(callback) => subscribers.push(callback),
            ReportMessage::Forget(id) => {
                feeds.remove(&id);
            }
            ReportMessage::Flush(done) => {
                let _ = done.send(());
            }
            ReportMessage::Chunk {
                progress,
                index,
                bytes,
            } => {
                let feed = feeds.entry(progress.upload_id.clone()).or_default();
                feed.window.record(bytes);
                let event = feed.event(progress, Some(index));
                deliver(feed.callback.as_ref(), &subscribers, &event);
            }
            ReportMessage::Status(progress) => {
                let feed = feeds.entry(progress.upload_id.clone()).or_default();
                match progress.status {
                    // A new run starts its rate estimate from now.
                    UploadStatus::Active => {
                        feed.window.reset();
                        feed.window.record(0);
                    }
                    UploadStatus::Paused | UploadStatus::Queued => feed.window.reset(),
                    _ => {}
                }
                let event = feed.event(progress, None);
                deliver(feed.callback.as_ref(), &subscribers, &event);
            }
        }
    }
}

fn deliver(own: Option<&ProgressCallback>, subscribers: &[ProgressCallback], event: &ProgressEvent) {
    if let Some(callback) = own {
        callback(event);
    }
    for callback in subscribers {
        callback(event);
    }
}
