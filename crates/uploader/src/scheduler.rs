//! Admission control.
//!
//! Every lifecycle mutation that affects slots (admit, pause, resume, cancel,
//! terminal transitions) happens under the scheduler mutex, which is always
//! taken before a task's own lock. A slot is released in the same critical
//! section that moves its task out of `Active`, so `running` and the set of
//! `Active` tasks never disagree.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chunkyard_protocol::{UploadId, UploadStatus};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::UploadError;
use crate::task::UploadTask;

/// A task promoted to `Active`, ready to be handed to a worker.
pub(crate) struct Admission {
    pub task: Arc<UploadTask>,
    pub epoch: u64,
    pub token: CancellationToken,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<UploadId, Arc<UploadTask>>,
    queue: VecDeque<UploadId>,
    /// Active uploads and the epoch of their current admission.
    running: HashMap<UploadId, u64>,
    next_epoch: u64,
}

pub(crate) struct Scheduler {
    limit: usize,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new `Queued` task at the back of the queue.
    ///
    /// `on_insert` runs under the scheduler lock once the id is known to be
    /// free, so anything it sends is ordered before the task's first
    /// admission.
    pub fn insert(
        &self,
        task: Arc<UploadTask>,
        on_insert: impl FnOnce(&Arc<UploadTask>),
    ) -> Result<(), UploadError> {
        let mut s = self.lock();
        let id = task.id().clone();
        if s.tasks.contains_key(&id) {
            return Err(UploadError::InvalidConfiguration(format!(
                "upload {id} is already registered"
            )));
        }
        on_insert(&task);
        if task.status() == UploadStatus::Queued {
            s.queue.push_back(id.clone());
        }
        s.tasks.insert(id, task);
        Ok(())
    }

    pub fn get(&self, id: &UploadId) -> Result<Arc<UploadTask>, UploadError> {
        self.lock()
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| UploadError::UnknownUpload(id.clone()))
    }

    /// Promotes queued tasks, in FIFO order, while slots are free.
    pub fn admit(&self) -> Vec<Admission> {
        let mut s = self.lock();
        let mut admitted = Vec::new();
        while s.running.len() < self.limit {
            let Some(id) = s.queue.pop_front() else {
                break;
            };
            let Some(task) = s.tasks.get(&id).cloned() else {
                continue;
            };
            s.next_epoch += 1;
            let epoch = s.next_epoch;
            let token = CancellationToken::new();
            if !task.activate(epoch, token.clone()) {
                continue;
            }
            debug!(upload = %id, epoch, "admitted");
            s.running.insert(id, epoch);
            admitted.push(Admission { task, epoch, token });
        }
        admitted
    }

    /// `Active → Paused`; frees the slot immediately. Returns the paused
    /// task, or `None` if it was not active.
    pub fn pause(&self, id: &UploadId) -> Result<Option<Arc<UploadTask>>, UploadError> {
        let mut s = self.lock();
        let task = lookup(&s, id)?;
        if !task.stop(UploadStatus::Paused) {
            return Ok(None);
        }
        s.running.remove(id);
        Ok(Some(task))
    }

    /// `Paused → Queued`, at the back of the queue.
    pub fn resume(&self, id: &UploadId) -> Result<Option<Arc<UploadTask>>, UploadError> {
        let mut s = self.lock();
        let task = lookup(&s, id)?;
        if task.status() != UploadStatus::Paused || !task.transition(UploadStatus::Queued) {
            return Ok(None);
        }
        s.queue.push_back(id.clone());
        Ok(Some(task))
    }

    /// Any non-terminal state to `Cancelled`.
    pub fn cancel(&self, id: &UploadId) -> Result<Option<Arc<UploadTask>>, UploadError> {
        let mut s = self.lock();
        let task = lookup(&s, id)?;
        if !task.stop(UploadStatus::Cancelled) {
            return Ok(None);
        }
        s.running.remove(id);
        s.queue.retain(|queued| queued != id);
        Ok(Some(task))
    }

    /// Applies a worker's terminal outcome if its admission is still the
    /// current one, releasing the slot.
    pub fn finish(&self, id: &UploadId, epoch: u64, outcome: Result<(), UploadError>) -> bool {
        let mut s = self.lock();
        if s.running.get(id) != Some(&epoch) {
            return false;
        }
        let Some(task) = s.tasks.get(id).cloned() else {
            return false;
        };
        if !task.finish(epoch, outcome) {
            return false;
        }
        s.running.remove(id);
        true
    }

    pub fn active_count(&self) -> usize {
        self.lock().running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn list(&self) -> Vec<Arc<UploadTask>> {
        self.lock().tasks.values().cloned().collect()
    }

    /// Drops a terminal task from the registry.
    pub fn forget(&self, id: &UploadId) -> Result<bool, UploadError> {
        let mut s = self.lock();
        let task = lookup(&s, id)?;
        if !task.status().is_terminal() {
            return Ok(false);
        }
        s.tasks.remove(id);
        Ok(true)
    }
}

fn lookup(s: &SchedulerState, id: &UploadId) -> Result<Arc<UploadTask>, UploadError> {
    s.tasks
        .get(id)
        .cloned()
        .ok_or_else(|| UploadError::UnknownUpload(id.clone()))
}
