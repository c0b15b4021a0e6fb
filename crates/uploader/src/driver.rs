//! Per-admission worker: sends an upload's chunks and commits the object.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chunkyard_protocol::UploadStatus;
use chunkyard_transfer::checksum_bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{TransportError, UploadError};
use crate::manager::{Shared, pump};
use crate::scheduler::Admission;
use crate::task::{ChunkClaim, UploadTask};
use crate::transport::{AckToken, ChunkPart};

enum RunOutcome {
    Completed,
    Failed(UploadError),
    /// The task was paused or cancelled under this worker.
    Stopped,
}

enum ChunkOutcome {
    Sent,
    Failed(UploadError),
    /// Handed back to pending because the run ended.
    Released,
}

/// Drives one admission to its end, then releases the slot and lets the
/// scheduler admit the next queued upload.
///
/// Returns a boxed future: the worker re-enters [`pump`], which spawns
/// workers, so the future type would otherwise refer to itself.
pub(crate) fn drive(
    shared: Arc<Shared>,
    admission: Admission,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let Admission { task, epoch, token } = admission;
        let id = task.id().clone();
        debug!(upload = %id, epoch, "worker started");

        let announce = match run(&shared, &task, epoch, &token).await {
            RunOutcome::Completed => {
                let finished = shared.scheduler.finish(&id, epoch, Ok(()));
                if finished {
                    info!(upload = %id, bytes = task.total_bytes(), "upload completed");
                }
                finished
            }
            RunOutcome::Failed(err) => {
                task.release_in_flight(epoch);
                let finished = shared.scheduler.finish(&id, epoch, Err(err.clone()));
                if finished {
                    warn!(upload = %id, error = %err, "upload failed");
                }
                finished
            }
            RunOutcome::Stopped => {
                task.release_in_flight(epoch);
                debug!(upload = %id, epoch, status = %task.status(), "worker stopped");
                false
            }
        };

        // The record is settled before waiters learn about the terminal state.
        shared.persist(&task).await;
        if announce {
            shared.reporter.status_changed(&task);
        }
        pump(&shared);
    })
}

async fn run(
    shared: &Shared,
    task: &Arc<UploadTask>,
    epoch: u64,
    token: &CancellationToken,
) -> RunOutcome {
    // Cancelled on pause/cancel (through the parent) or when a sibling chunk
    // fails for good.
    let abort = token.child_token();

    loop {
        let mut in_flight = FuturesUnordered::new();
        let mut failure: Option<UploadError> = None;

        loop {
            // A chunk may have failed for good under an earlier admission.
            if failure.is_none()
                && let Some(index) = task.failed_chunk()
            {
                abort.cancel();
                failure = Some(recorded_failure(task, index));
            }
            while failure.is_none() && in_flight.len() < task.chunk_concurrency() {
                let Some(claim) = task.claim_next(epoch) else {
                    break;
                };
                in_flight.push(send_chunk_with_retry(shared, task, epoch, &abort, claim));
            }
            // In-flight sends are always allowed to finish.
            let Some(outcome) = in_flight.next().await else {
                break;
            };
            if let ChunkOutcome::Failed(err) = outcome
                && failure.is_none()
            {
                abort.cancel();
                failure = Some(err);
            }
        }

        if let Some(err) = failure {
            return RunOutcome::Failed(err);
        }
        if !task.is_current(epoch) {
            return RunOutcome::Stopped;
        }
        if task.all_completed() {
            break;
        }
        if task.has_in_flight() {
            // Chunks still owned by a worker from an earlier admission.
            if !wait_for_settle(task, &abort).await {
                return RunOutcome::Stopped;
            }
            continue;
        }
        let index = task.failed_chunk().unwrap_or_default();
        return RunOutcome::Failed(recorded_failure(task, index));
    }

    if task.is_single_shot() {
        return RunOutcome::Completed;
    }
    if !task.begin_finalize(epoch) {
        return RunOutcome::Stopped;
    }
    let acks = match task.ordered_acks() {
        Ok(acks) => acks,
        Err(index) => {
            return RunOutcome::Failed(UploadError::PermanentTransport(format!(
                "chunk {index} completed without an ack token"
            )));
        }
    };
    finalize_with_retry(shared, task, epoch, &abort, &acks).await
}

/// Waits until no chunk is in flight. Returns `false` if the run is cancelled
/// first.
async fn wait_for_settle(task: &UploadTask, token: &CancellationToken) -> bool {
    loop {
        let notified = task.settled().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !task.has_in_flight() {
            return true;
        }
        tokio::select! {
            _ = &mut notified => {}
            _ = token.cancelled() => return false,
        }
    }
}

/// Sleeps for `delay` unless the run is cancelled first.
async fn backoff(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = token.cancelled() => false,
    }
}

async fn send_chunk_with_retry(
    shared: &Shared,
    task: &Arc<UploadTask>,
    epoch: u64,
    token: &CancellationToken,
    claim: ChunkClaim,
) -> ChunkOutcome {
    let ChunkClaim { index, range } = claim;
    let total_chunks = task.chunk_count();
    let single_shot = total_chunks == 1;

    let source = task.source();
    let data = match tokio::task::spawn_blocking(move || source.read_range(range)).await {
        Ok(Ok(data)) => data,
        Ok(Err(e)) => {
            warn!(upload = %task.id(), chunk = index, error = %e, "source read failed");
            return fail_chunk(task, index, UploadError::Source(e.to_string()));
        }
        Err(e) => {
            return fail_chunk(task, index, UploadError::Source(e.to_string()));
        }
    };
    let checksum = if single_shot {
        String::new()
    } else {
        checksum_bytes(&data)
    };

    loop {
        let attempt = task.chunk_attempt(index);
        let send = async {
            if single_shot {
                shared
                    .transport
                    .send_whole(task.destination(), data.clone())
                    .await
                    .map(|()| None)
            } else {
                let part = ChunkPart {
                    destination: task.destination().clone(),
                    range,
                    index,
                    total_chunks,
                    checksum: checksum.clone(),
                    data: data.clone(),
                };
                shared.transport.send_chunk(part).await.map(Some)
            }
        };
        let timeout = shared.config.per_attempt_timeout;
        let result: Result<Option<AckToken>, TransportError> =
            match tokio::time::timeout(timeout, send).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::transient(format!(
                    "attempt timed out after {}ms",
                    timeout.as_millis()
                ))),
            };

        match result {
            Ok(ack) => {
                let added = task.complete_chunk(index, ack);
                debug!(upload = %task.id(), chunk = index, bytes = added, attempt, "chunk sent");
                shared.reporter.chunk_completed(task, index, added);
                shared.persist(task).await;
                return ChunkOutcome::Sent;
            }
            Err(e) if !e.transient => {
                warn!(upload = %task.id(), chunk = index, error = %e, "chunk rejected");
                return fail_chunk(task, index, e.into());
            }
            Err(e) => {
                let decision = shared.policy.should_retry(attempt);
                if !decision.retry {
                    let err = UploadError::RetryBudgetExhausted {
                        attempts: attempt + 1,
                        last: e.message,
                    };
                    return fail_chunk(task, index, err);
                }
                if !task.is_current(epoch) {
                    task.release_chunk(index);
                    return ChunkOutcome::Released;
                }
                task.bump_attempt(index);
                warn!(
                    upload = %task.id(),
                    chunk = index,
                    attempt = attempt + 1,
                    delay_ms = decision.delay.as_millis() as u64,
                    error = %e,
                    "chunk attempt failed, retrying"
                );
                if !backoff(decision.delay, token).await || !task.is_current(epoch) {
                    task.release_chunk(index);
                    return ChunkOutcome::Released;
                }
            }
        }
    }
}

/// Marks the chunk failed and keeps the error, even when the failure lands
/// after a pause, so no later run sends the chunk again. Only a cancelled
/// upload hands it back untouched.
fn fail_chunk(task: &UploadTask, index: usize, err: UploadError) -> ChunkOutcome {
    if task.status() == UploadStatus::Cancelled {
        task.release_chunk(index);
        return ChunkOutcome::Released;
    }
    task.fail_chunk(index);
    task.record_error(err.clone());
    ChunkOutcome::Failed(err)
}

fn recorded_failure(task: &UploadTask, index: usize) -> UploadError {
    task.last_error().unwrap_or_else(|| {
        UploadError::PermanentTransport(format!("chunk {index} of {} failed", task.id()))
    })
}

async fn finalize_with_retry(
    shared: &Shared,
    task: &UploadTask,
    epoch: u64,
    token: &CancellationToken,
    acks: &[AckToken],
) -> RunOutcome {
    let mut attempt = 0;
    loop {
        if !task.is_current(epoch) {
            return RunOutcome::Stopped;
        }
        let timeout = shared.config.per_attempt_timeout;
        let result = match tokio::time::timeout(
            timeout,
            shared.transport.finalize(task.destination(), acks),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::transient(format!(
                "finalize timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        match result {
            Ok(()) => return RunOutcome::Completed,
            Err(e) if !e.transient => return RunOutcome::Failed(e.into()),
            Err(e) => {
                let decision = shared.policy.should_retry(attempt);
                if !decision.retry {
                    return RunOutcome::Failed(UploadError::RetryBudgetExhausted {
                        attempts: attempt + 1,
                        last: e.message,
                    });
                }
                attempt += 1;
                warn!(
                    upload = %task.id(),
                    attempt,
                    delay_ms = decision.delay.as_millis() as u64,
                    error = %e,
                    "finalize failed, retrying"
                );
                if !backoff(decision.delay, token).await {
                    return RunOutcome::Stopped;
                }
            }
        }
    }
}
