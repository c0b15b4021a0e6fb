//! Scriptable in-memory transport shared by the scenario tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chunkyard_uploader::{
    AckToken, ChunkPart, Destination, ManagerConfig, ProgressEvent, Transport, TransportError,
    TransportFuture, UploadId, UploadManager, UploadProgress,
};
use tokio::sync::Notify;

/// Blocks one chunk until the test releases it.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Default)]
struct MockState {
    chunk_failures: HashMap<usize, VecDeque<TransportError>>,
    whole_failures: VecDeque<TransportError>,
    finalize_failures: VecDeque<TransportError>,
    stalls: HashMap<usize, u32>,
    gates: HashMap<usize, Arc<Gate>>,
    chunk_calls: Vec<usize>,
    whole_calls: Vec<(Destination, usize)>,
    finalize_calls: Vec<Vec<String>>,
    in_flight: usize,
    max_in_flight: usize,
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    delay: Duration,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every send takes at least `delay`.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Chunk `index` fails with `err` on its next call (queued per index).
    pub fn fail_chunk(&self, index: usize, err: TransportError) {
        self.state()
            .chunk_failures
            .entry(index)
            .or_default()
            .push_back(err);
    }

    pub fn fail_whole(&self, err: TransportError) {
        self.state().whole_failures.push_back(err);
    }

    pub fn fail_finalize(&self, err: TransportError) {
        self.state().finalize_failures.push_back(err);
    }

    /// The next `times` calls for chunk `index` hang for a long time.
    pub fn stall_chunk(&self, index: usize, times: u32) {
        self.state().stalls.insert(index, times);
    }

    pub fn gate(&self, index: usize) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.state().gates.insert(index, Arc::clone(&gate));
        gate
    }

    pub fn chunk_calls(&self) -> Vec<usize> {
        self.state().chunk_calls.clone()
    }

    pub fn whole_calls(&self) -> Vec<(Destination, usize)> {
        self.state().whole_calls.clone()
    }

    pub fn finalize_calls(&self) -> Vec<Vec<String>> {
        self.state().finalize_calls.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight
    }

    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    fn enter(&self) -> InFlight<'_> {
        let mut s = self.state();
        s.in_flight += 1;
        s.max_in_flight = s.max_in_flight.max(s.in_flight);
        InFlight(self)
    }

    fn take_stall(&self, index: usize) -> bool {
        let mut s = self.state();
        match s.stalls.get_mut(&index) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Counts a send as in flight until dropped, including when the manager
/// abandons it on timeout.
struct InFlight<'a>(&'a MockTransport);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.state().in_flight -= 1;
    }
}

impl Transport for MockTransport {
    fn send_chunk(&self, part: ChunkPart) -> TransportFuture<'_, AckToken> {
        Box::pin(async move {
            let _in_flight = self.enter();
            let gate = self.state().gates.get(&part.index).cloned();
            if let Some(gate) = gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            if self.take_stall(part.index) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            tokio::time::sleep(self.delay).await;

            let mut s = self.state();
            s.chunk_calls.push(part.index);
            match s
                .chunk_failures
                .get_mut(&part.index)
                .and_then(VecDeque::pop_front)
            {
                Some(err) => Err(err),
                None => Ok(AckToken::new(format!("etag-{}", part.index))),
            }
        })
    }

    fn finalize<'a>(
        &'a self,
        _destination: &'a Destination,
        ack_tokens: &'a [AckToken],
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut s = self.state();
            s.finalize_calls
                .push(ack_tokens.iter().map(|t| t.to_string()).collect());
            match s.finalize_failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn send_whole<'a>(
        &'a self,
        destination: &'a Destination,
        data: Vec<u8>,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let _in_flight = self.enter();
            tokio::time::sleep(self.delay).await;
            let mut s = self.state();
            s.whole_calls.push((destination.clone(), data.len()));
            match s.whole_failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }
}

/// Millisecond backoff so retries don't slow the suite down.
pub fn fast_config(chunk_size: u64) -> ManagerConfig {
    ManagerConfig {
        chunk_size,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Waits for a terminal state, failing the test instead of hanging.
pub async fn finish(manager: &UploadManager, id: &UploadId) -> UploadProgress {
    tokio::time::timeout(Duration::from_secs(10), manager.wait(id))
        .await
        .expect("upload did not finish in time")
        .unwrap()
}

/// Polls `cond` until it holds or a deadline passes.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

pub type Events = Arc<Mutex<Vec<ProgressEvent>>>;

/// Callback that records every event it sees.
pub fn recorder() -> (Events, impl Fn(&ProgressEvent) + Send + Sync + 'static) {
    let events: Events = Arc::default();
    let sink = Arc::clone(&events);
    (events, move |event: &ProgressEvent| {
        sink.lock().unwrap().push(event.clone());
    })
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
