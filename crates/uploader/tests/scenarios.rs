mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chunkyard_uploader::{
    ByteSource, Destination, LocalTransport, ManagerConfig, MemorySource, RecordStore,
    SubmitOptions, TransportError, UploadError, UploadId, UploadManager, UploadStatus,
};
use common::{MockTransport, eventually, fast_config, finish, payload, recorder};

const MIB: u64 = 1024 * 1024;

fn source(len: usize) -> Arc<dyn ByteSource> {
    Arc::new(MemorySource::new(payload(len)))
}

fn dest(key: &str) -> Destination {
    Destination::new("media", key)
}

#[tokio::test]
async fn small_file_is_sent_in_one_request() {
    let transport = MockTransport::new();
    let manager = UploadManager::new(ManagerConfig::default(), transport.clone()).unwrap();
    let (events, callback) = recorder();

    let id = manager
        .submit(
            source(1000),
            dest("small.txt"),
            1000,
            SubmitOptions::default().on_progress(callback),
        )
        .unwrap();
    let done = finish(&manager, &id).await;

    assert_eq!(done.status, UploadStatus::Completed);
    assert_eq!(done.transferred_bytes, 1000);
    assert_eq!(transport.whole_calls(), vec![(dest("small.txt"), 1000)]);
    assert!(transport.chunk_calls().is_empty());
    assert!(transport.finalize_calls().is_empty());

    let events = events.lock().unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.progress.status, UploadStatus::Completed);
    assert_eq!(last.progress.transferred_bytes, 1000);
}

#[tokio::test]
async fn transient_chunk_failure_is_retried_once() {
    let transport = MockTransport::new();
    transport.fail_chunk(1, TransportError::transient("503 slow down"));
    let manager = UploadManager::new(fast_config(5 * MIB), transport.clone()).unwrap();

    let total = 15 * MIB;
    let id = manager
        .submit(
            source(total as usize),
            dest("big.bin"),
            total,
            SubmitOptions::default(),
        )
        .unwrap();
    let done = finish(&manager, &id).await;

    assert_eq!(done.status, UploadStatus::Completed);
    assert_eq!(done.transferred_bytes, total);
    assert_eq!(done.retry_count, 0);
    assert_eq!(transport.chunk_calls(), vec![0, 1, 1, 2]);
    assert_eq!(
        transport.finalize_calls(),
        vec![vec!["etag-0", "etag-1", "etag-2"]]
    );
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let transport = MockTransport::new();
    transport.fail_chunk(0, TransportError::permanent("403 forbidden"));
    let manager = UploadManager::new(fast_config(4), transport.clone()).unwrap();
    let (events, callback) = recorder();

    let id = manager
        .submit(
            source(12),
            dest("denied.bin"),
            12,
            SubmitOptions::default().on_progress(callback),
        )
        .unwrap();
    let done = finish(&manager, &id).await;

    assert_eq!(done.status, UploadStatus::Failed);
    assert_eq!(
        done.error.as_deref(),
        Some("permanent transport error: 403 forbidden")
    );
    assert_eq!(transport.chunk_calls(), vec![0]);
    assert!(transport.finalize_calls().is_empty());

    let events = events.lock().unwrap();
    let terminal: Vec<_> = events
        .iter()
        .filter(|e| e.progress.status == UploadStatus::Failed)
        .collect();
    assert!(!terminal.is_empty());
    assert!(terminal[0].progress.error.is_some());
}

#[tokio::test]
async fn exhausted_budget_fails_the_upload() {
    let transport = MockTransport::new();
    for _ in 0..10 {
        transport.fail_chunk(0, TransportError::transient("connection reset"));
    }
    let manager = UploadManager::new(fast_config(4), transport.clone()).unwrap();

    let id = manager
        .submit(source(8), dest("flaky.bin"), 8, SubmitOptions::default())
        .unwrap();
    let done = finish(&manager, &id).await;

    assert_eq!(done.status, UploadStatus::Failed);
    assert_eq!(
        done.error,
        Some(
            UploadError::RetryBudgetExhausted {
                attempts: 4,
                last: "connection reset".into(),
            }
            .to_string()
        )
    );
    // One try plus max_attempts retries.
    assert_eq!(transport.chunk_calls(), vec![0, 0, 0, 0]);
}

#[tokio::test]
async fn finalize_is_retried() {
    let transport = MockTransport::new();
    transport.fail_finalize(TransportError::transient("504 gateway timeout"));
    let manager = UploadManager::new(fast_config(4), transport.clone()).unwrap();

    let id = manager
        .submit(source(8), dest("commit.bin"), 8, SubmitOptions::default())
        .unwrap();
    assert_eq!(finish(&manager, &id).await.status, UploadStatus::Completed);
    assert_eq!(transport.finalize_calls().len(), 2);
}

#[tokio::test]
async fn attempt_timeout_counts_as_transient() {
    let transport = MockTransport::new();
    transport.stall_chunk(0, 1);
    let config = ManagerConfig {
        per_attempt_timeout: Duration::from_millis(50),
        ..fast_config(4)
    };
    let manager = UploadManager::new(config, transport.clone()).unwrap();

    let id = manager
        .submit(source(8), dest("slow.bin"), 8, SubmitOptions::default())
        .unwrap();
    assert_eq!(finish(&manager, &id).await.status, UploadStatus::Completed);
    // The stalled attempt never got to record its call.
    assert_eq!(transport.chunk_calls(), vec![0, 1]);
}

#[tokio::test]
async fn cancel_mid_flight_stops_without_finalize() {
    let transport = MockTransport::new();
    let gate = transport.gate(1);
    let manager = UploadManager::new(fast_config(4), transport.clone()).unwrap();

    let id = manager
        .submit(source(12), dest("cancel.bin"), 12, SubmitOptions::default())
        .unwrap();
    gate.entered.notified().await;

    assert!(manager.cancel(&id).await.unwrap());
    assert_eq!(
        manager.get_progress(&id).unwrap().status,
        UploadStatus::Cancelled
    );
    assert_eq!(manager.active_count(), 0);
    assert!(!manager.cancel(&id).await.unwrap());

    gate.release.notify_one();
    eventually(|| transport.in_flight() == 0).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let done = finish(&manager, &id).await;
    assert_eq!(done.status, UploadStatus::Cancelled);
    assert_eq!(transport.chunk_calls(), vec![0, 1]);
    assert!(transport.finalize_calls().is_empty());
}

#[tokio::test]
async fn cancel_queued_upload() {
    let transport = MockTransport::new();
    let gate = transport.gate(0);
    let config = ManagerConfig {
        concurrency_limit: 1,
        ..fast_config(4)
    };
    let manager = UploadManager::new(config, transport.clone()).unwrap();

    let first = manager
        .submit(source(8), dest("a.bin"), 8, SubmitOptions::default())
        .unwrap();
    let second = manager
        .submit(source(8), dest("b.bin"), 8, SubmitOptions::default())
        .unwrap();
    gate.entered.notified().await;
    assert_eq!(manager.queued_count(), 1);

    assert!(manager.cancel(&second).await.unwrap());
    assert_eq!(manager.queued_count(), 0);

    gate.release.notify_one();
    assert_eq!(finish(&manager, &first).await.status, UploadStatus::Completed);
    assert_eq!(
        manager.get_progress(&second).unwrap().status,
        UploadStatus::Cancelled
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn active_uploads_never_exceed_limit() {
    let transport = MockTransport::with_delay(Duration::from_millis(5));
    let manager = UploadManager::new(fast_config(4), transport.clone()).unwrap();

    let peak = Arc::new(AtomicUsize::new(0));
    let watcher = manager.clone();
    let seen = Arc::clone(&peak);
    manager.on_progress(move |_| {
        seen.fetch_max(watcher.active_count(), Ordering::SeqCst);
    });

    let ids: Vec<UploadId> = (0..10)
        .map(|i| {
            manager
                .submit(
                    source(12),
                    dest(&format!("file-{i}.bin")),
                    12,
                    SubmitOptions::default(),
                )
                .unwrap()
        })
        .collect();
    assert!(manager.active_count() <= 3);

    for id in &ids {
        assert_eq!(finish(&manager, id).await.status, UploadStatus::Completed);
    }
    assert!(transport.max_in_flight() <= 3);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(transport.chunk_calls().len(), 30);
    assert_eq!(manager.active_count(), 0);
    assert_eq!(manager.queued_count(), 0);
}

#[tokio::test]
async fn pause_and_resume_skip_completed_chunks() {
    let transport = MockTransport::new();
    let gate = transport.gate(1);
    let manager = UploadManager::new(fast_config(4), transport.clone()).unwrap();

    let id = manager
        .submit(source(12), dest("paused.bin"), 12, SubmitOptions::default())
        .unwrap();
    gate.entered.notified().await;

    assert!(manager.pause(&id).await.unwrap());
    assert!(!manager.pause(&id).await.unwrap());
    assert_eq!(manager.get_progress(&id).unwrap().status, UploadStatus::Paused);
    assert_eq!(manager.active_count(), 0);

    // Resume while chunk 1 is still in flight from the first run.
    assert!(manager.resume(&id).await.unwrap());
    assert!(!manager.resume(&id).await.unwrap());
    gate.release.notify_one();

    let done = finish(&manager, &id).await;
    assert_eq!(done.status, UploadStatus::Completed);
    assert_eq!(done.retry_count, 1);

    let mut calls = transport.chunk_calls();
    calls.sort_unstable();
    assert_eq!(calls, vec![0, 1, 2]);
    assert_eq!(
        transport.finalize_calls(),
        vec![vec!["etag-0", "etag-1", "etag-2"]]
    );
}

#[tokio::test]
async fn rejection_after_resume_fails_the_upload() {
    let transport = MockTransport::new();
    let gate = transport.gate(1);
    transport.fail_chunk(1, TransportError::permanent("403 forbidden"));
    let manager = UploadManager::new(fast_config(4), transport.clone()).unwrap();

    let id = manager
        .submit(source(12), dest("denied.bin"), 12, SubmitOptions::default())
        .unwrap();
    gate.entered.notified().await;
    assert!(manager.pause(&id).await.unwrap());
    assert!(manager.resume(&id).await.unwrap());
    gate.release.notify_one();

    let done = finish(&manager, &id).await;
    assert_eq!(done.status, UploadStatus::Failed);
    assert!(done.error.as_deref().unwrap().contains("403 forbidden"));
    assert_eq!(
        transport.chunk_calls().iter().filter(|&&i| i == 1).count(),
        1,
        "rejected chunk must not be sent again"
    );
    assert!(transport.finalize_calls().is_empty());
}

#[tokio::test]
async fn rejection_while_paused_fails_on_resume() {
    let transport = MockTransport::new();
    let gate = transport.gate(1);
    transport.fail_chunk(1, TransportError::permanent("403 forbidden"));
    let manager = UploadManager::new(fast_config(4), transport.clone()).unwrap();

    let id = manager
        .submit(source(12), dest("denied.bin"), 12, SubmitOptions::default())
        .unwrap();
    gate.entered.notified().await;
    assert!(manager.pause(&id).await.unwrap());
    gate.release.notify_one();

    eventually(|| manager.get_progress(&id).unwrap().error.is_some()).await;
    assert_eq!(manager.get_progress(&id).unwrap().status, UploadStatus::Paused);

    assert!(manager.resume(&id).await.unwrap());
    let done = finish(&manager, &id).await;
    assert_eq!(done.status, UploadStatus::Failed);
    assert!(done.error.as_deref().unwrap().contains("403 forbidden"));

    let mut calls = transport.chunk_calls();
    calls.sort_unstable();
    assert_eq!(calls, vec![0, 1]);
    assert!(transport.finalize_calls().is_empty());
}

#[tokio::test]
async fn empty_payload_is_a_single_empty_put() {
    let transport = MockTransport::new();
    let manager = UploadManager::new(ManagerConfig::default(), transport.clone()).unwrap();

    let id = manager
        .submit(source(0), dest("empty.bin"), 0, SubmitOptions::default())
        .unwrap();
    let done = finish(&manager, &id).await;

    assert_eq!(done.status, UploadStatus::Completed);
    assert_eq!(done.transferred_bytes, 0);
    assert_eq!(done.total_bytes, 0);
    assert_eq!(transport.whole_calls(), vec![(dest("empty.bin"), 0)]);
    assert!(transport.chunk_calls().is_empty());
    assert!(transport.finalize_calls().is_empty());
}

#[tokio::test]
async fn failed_upload_resumes_from_its_record() {
    let state = tempfile::TempDir::new().unwrap();

    let failing = MockTransport::new();
    failing.fail_chunk(1, TransportError::permanent("413 too large"));
    let store = RecordStore::open(state.path()).unwrap();
    let manager = UploadManager::with_store(fast_config(4), failing.clone(), store).unwrap();
    let id = manager
        .submit(
            source(12),
            dest("resume.bin"),
            12,
            SubmitOptions::default().label("resume.bin"),
        )
        .unwrap();
    assert_eq!(finish(&manager, &id).await.status, UploadStatus::Failed);

    let store = RecordStore::open(state.path()).unwrap();
    let record = store.load(&id).await.unwrap().unwrap();
    assert_eq!(record.status, UploadStatus::Failed);
    assert_eq!(record.completed_chunks(), 1);
    assert_eq!(record.label.as_deref(), Some("resume.bin"));

    let healthy = MockTransport::new();
    let manager = UploadManager::with_store(fast_config(4), healthy.clone(), store).unwrap();
    let restored = manager
        .restore(&record, source(12), SubmitOptions::default())
        .unwrap();
    assert_eq!(restored, id);

    let done = finish(&manager, &id).await;
    assert_eq!(done.status, UploadStatus::Completed);
    assert_eq!(done.retry_count, 1);
    assert_eq!(healthy.chunk_calls(), vec![1, 2]);
    assert_eq!(
        healthy.finalize_calls(),
        vec![vec!["etag-0", "etag-1", "etag-2"]]
    );

    // Nothing left to resume.
    let store = RecordStore::open(state.path()).unwrap();
    assert!(store.load(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn restore_rejects_mismatched_source() {
    let state = tempfile::TempDir::new().unwrap();
    let transport = MockTransport::new();
    let gate = transport.gate(1);
    let store = RecordStore::open(state.path()).unwrap();
    let manager = UploadManager::with_store(fast_config(4), transport.clone(), store).unwrap();

    let id = manager
        .submit(source(12), dest("m.bin"), 12, SubmitOptions::default())
        .unwrap();
    gate.entered.notified().await;
    manager.pause(&id).await.unwrap();
    gate.release.notify_one();

    let store = RecordStore::open(state.path()).unwrap();
    let record = store.load(&id).await.unwrap().unwrap();
    assert_eq!(record.status, UploadStatus::Paused);

    let other = UploadManager::new(fast_config(4), MockTransport::new()).unwrap();
    let err = other
        .restore(&record, source(13), SubmitOptions::default())
        .unwrap_err();
    assert!(matches!(err, UploadError::InvalidConfiguration(_)));
}

#[tokio::test]
async fn local_transport_round_trip() {
    let root = tempfile::TempDir::new().unwrap();
    let transport = Arc::new(LocalTransport::new(root.path()));
    let config = ManagerConfig {
        chunk_concurrency: 3,
        ..fast_config(4096)
    };
    let manager = UploadManager::new(config, transport.clone()).unwrap();

    let data = payload(10_000);
    let destination = dest("nested/dir/object.bin");
    let id = manager
        .submit(
            Arc::new(MemorySource::new(data.clone())),
            destination.clone(),
            data.len() as u64,
            SubmitOptions::default(),
        )
        .unwrap();
    assert_eq!(finish(&manager, &id).await.status, UploadStatus::Completed);

    let stored = std::fs::read(transport.object_path(&destination)).unwrap();
    assert_eq!(stored, data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_is_monotonic_and_bounded() {
    let transport = MockTransport::with_delay(Duration::from_millis(1));
    transport.fail_chunk(3, TransportError::transient("reset"));
    let manager = UploadManager::new(fast_config(100), transport.clone()).unwrap();
    let (events, callback) = recorder();

    let id = manager
        .submit(
            source(1050),
            dest("events.bin"),
            1050,
            SubmitOptions::default()
                .concurrency_hint(4)
                .on_progress(callback),
        )
        .unwrap();
    finish(&manager, &id).await;

    let events = events.lock().unwrap();
    let bytes: Vec<u64> = events
        .iter()
        .map(|e| e.progress.transferred_bytes)
        .collect();
    assert!(bytes.windows(2).all(|w| w[0] <= w[1]), "{bytes:?}");
    assert!(bytes.iter().all(|&b| b <= 1050));
    assert_eq!(events.iter().filter(|e| e.chunk_index.is_some()).count(), 11);

    let last = events.last().unwrap();
    assert_eq!(last.progress.status, UploadStatus::Completed);
    assert_eq!(last.progress.transferred_bytes, 1050);
}

#[tokio::test]
async fn manager_wide_subscribers_see_every_upload() {
    let manager = UploadManager::new(fast_config(4), MockTransport::new()).unwrap();
    let (events, callback) = recorder();
    manager.on_progress(callback);

    let a = manager
        .submit(source(4), dest("a.bin"), 4, SubmitOptions::default())
        .unwrap();
    let b = manager
        .submit(source(4), dest("b.bin"), 4, SubmitOptions::default())
        .unwrap();
    finish(&manager, &a).await;
    finish(&manager, &b).await;

    let events = events.lock().unwrap();
    for id in [&a, &b] {
        assert!(events.iter().any(|e| &e.progress.upload_id == id
            && e.progress.status == UploadStatus::Completed));
    }
}

#[tokio::test]
async fn api_errors_are_synchronous() {
    let manager = UploadManager::new(fast_config(4), MockTransport::new()).unwrap();
    let unknown = UploadId::from("missing");

    assert_eq!(
        manager.pause(&unknown).await,
        Err(UploadError::UnknownUpload(unknown.clone()))
    );
    assert!(manager.get_progress(&unknown).is_err());
    assert!(manager.wait(&unknown).await.is_err());

    let bad_dest = manager.submit(source(4), dest("../x"), 4, SubmitOptions::default());
    assert!(matches!(bad_dest, Err(UploadError::InvalidConfiguration(_))));

    let wrong_size = manager.submit(source(4), dest("x.bin"), 5, SubmitOptions::default());
    assert!(matches!(wrong_size, Err(UploadError::InvalidConfiguration(_))));

    let zero_chunk = manager.submit(
        source(4),
        dest("x.bin"),
        4,
        SubmitOptions::default().chunk_size(0),
    );
    assert!(matches!(zero_chunk, Err(UploadError::InvalidConfiguration(_))));

    let bad_config = ManagerConfig {
        concurrency_limit: 0,
        ..Default::default()
    };
    assert!(UploadManager::new(bad_config, MockTransport::new()).is_err());
}

#[tokio::test]
async fn forget_drops_finished_uploads() {
    let manager = UploadManager::new(fast_config(4), MockTransport::new()).unwrap();
    let id = manager
        .submit(source(4), dest("f.bin"), 4, SubmitOptions::default())
        .unwrap();
    finish(&manager, &id).await;

    assert_eq!(manager.list().len(), 1);
    assert!(manager.forget(&id).unwrap());
    assert!(manager.list().is_empty());
    assert!(manager.get_progress(&id).is_err());
}

struct UnreadableSource;

impl ByteSource for UnreadableSource {
    fn len(&self) -> u64 {
        8
    }

    fn read_range(
        &self,
        _range: chunkyard_uploader::ByteRange,
    ) -> Result<Vec<u8>, chunkyard_transfer::TransferError> {
        Err(std::io::Error::other("disk gone").into())
    }
}

#[tokio::test]
async fn source_read_failure_is_permanent() {
    let transport = MockTransport::new();
    let manager = UploadManager::new(fast_config(4), transport.clone()).unwrap();

    let id = manager
        .submit(
            Arc::new(UnreadableSource),
            dest("gone.bin"),
            8,
            SubmitOptions::default(),
        )
        .unwrap();
    let done = finish(&manager, &id).await;

    assert_eq!(done.status, UploadStatus::Failed);
    assert!(done.error.unwrap().starts_with("source read failed"));
    assert!(transport.chunk_calls().is_empty());
}
