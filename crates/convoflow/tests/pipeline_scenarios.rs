mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{conversation, test_config, MemStore, Script, ScriptedClassifier, WriteFault};
use convoflow::admin::{self, AdminState};
use convoflow::config::RunMode;
use convoflow::error::{ClassifierError, PipelineError};
use convoflow::pipeline::batch_files::BatchFileStore;
use convoflow::pipeline::checkpoint::CheckpointTracker;
use convoflow::pipeline::model::{ClassificationResult, RecordStatus, RetryQueueEntry};
use convoflow::pipeline::retry::RetryPolicy;
use convoflow::pipeline::{Orchestrator, RunOutcome};

async fn orchestrator(
    cfg: convoflow::PipelineConfig,
    store: &Arc<MemStore>,
    classifier: &Arc<ScriptedClassifier>,
) -> Orchestrator {
    Orchestrator::new(cfg, store.clone(), classifier.clone())
        .await
        .unwrap()
}

#[tokio::test]
async fn transient_classifier_failure_is_retried_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=3));
    let classifier = Arc::new(ScriptedClassifier::new());
    classifier.script(
        2,
        Script::FailTimes(1, ClassifierError::Timeout(Duration::from_secs(120))),
    );

    let orch = orchestrator(test_config(dir.path(), 3, 2), &store, &classifier).await;
    let summary = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(store.results().len(), 3);
    assert!(summary.permanently_failed.is_empty());
    assert_eq!(summary.retry_cycles, 1);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.still_retrying, 0);
    assert_eq!(classifier.calls(2), 2);
    assert_eq!(classifier.calls(1), 1);
    assert!(orch.files().list_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn write_failure_is_retried_with_the_original_classification() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=5));
    store.fail_writes(4, WriteFault::AlwaysTransient);
    let classifier = Arc::new(ScriptedClassifier::new());

    let orch = orchestrator(test_config(dir.path(), 5, 2), &store, &classifier).await;
    let summary = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    let results = store.results();
    assert_eq!(results.len(), 4);
    assert!(!results.contains_key(&4));

    // classified once, written 1 + retry_ceiling times
    assert_eq!(classifier.calls(4), 1);
    assert_eq!(store.insert_calls(4), 4);

    assert_eq!(summary.permanently_failed.len(), 1);
    let failure = &summary.permanently_failed[0];
    assert_eq!(failure.source_id, 4);
    assert_eq!(failure.error_code, "DEPENDENCY_DOWN");
    assert_eq!(failure.retry_count, 4);
    assert_eq!(
        failure.classification,
        Some(json!({"label": "label-4", "call": 1}))
    );

    let report = orch.files().permanent_failures().await.unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].source_id, 4);
    assert_eq!(store.status(4), Some(RecordStatus::Failed));
    assert_eq!(store.status(5), Some(RecordStatus::Processed));
}

#[tokio::test]
async fn entry_past_the_ceiling_is_reported_and_never_retried_again() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=3));
    let classifier = Arc::new(ScriptedClassifier::new());
    classifier.script(
        2,
        Script::FailAlways(ClassifierError::RateLimited("slow down".into())),
    );

    let mut cfg = test_config(dir.path(), 3, 2);
    cfg.retry_ceiling = 2;

    let orch = orchestrator(cfg.clone(), &store, &classifier).await;
    let summary = orch.run(CancellationToken::new()).await.unwrap();

    // 1 main attempt + 2 retries = retry_ceiling + 1 failures
    assert_eq!(classifier.calls(2), 3);
    assert_eq!(summary.permanently_failed.len(), 1);
    assert_eq!(summary.permanently_failed[0].error_code, "RATE_LIMIT");
    assert!(summary.permanently_failed[0].classification.is_none());
    assert_eq!(summary.retry_cycles, 2);

    // a second run does not touch it
    let again = orchestrator(cfg, &store, &classifier).await;
    let second = again.run(CancellationToken::new()).await.unwrap();
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(classifier.calls(2), 3);
    assert_eq!(second.processed, 0);
}

#[tokio::test]
async fn permanent_classifier_error_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=3));
    let classifier = Arc::new(ScriptedClassifier::new());
    classifier.script(
        3,
        Script::FailAlways(ClassifierError::InvalidInput("empty conversation".into())),
    );

    let orch = orchestrator(test_config(dir.path(), 10, 3), &store, &classifier).await;
    let summary = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(classifier.calls(3), 1);
    assert_eq!(summary.retry_cycles, 0);
    assert_eq!(summary.permanently_failed.len(), 1);
    assert_eq!(summary.permanently_failed[0].error_code, "BAD_PAYLOAD");
    assert!(summary.permanently_failed[0]
        .suggested_action
        .contains("Non-retryable"));
    assert_eq!(store.results().len(), 2);
}

#[tokio::test]
async fn successive_batches_cover_contiguous_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=10));
    let classifier = Arc::new(ScriptedClassifier::new());

    let orch = orchestrator(test_config(dir.path(), 3, 2), &store, &classifier).await;
    let summary = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.batches_completed, 4);
    assert_eq!(store.results().len(), 10);

    // every result names its batch; each batch owns one contiguous id range
    let mut ranges: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for (id, result) in store.results() {
        ranges.entry(result.batch_job_id).or_default().push(id);
    }
    let expected: Vec<(String, Vec<i64>)> = vec![
        (BatchFileStore::batch_id_for(1), vec![1, 2, 3]),
        (BatchFileStore::batch_id_for(2), vec![4, 5, 6]),
        (BatchFileStore::batch_id_for(3), vec![7, 8, 9]),
        (BatchFileStore::batch_id_for(4), vec![10]),
    ];
    assert_eq!(ranges.into_iter().collect::<Vec<_>>(), expected);

    let checkpoint = CheckpointTracker::read(dir.path()).await.unwrap().unwrap();
    assert_eq!(checkpoint.last_completed_id, Some(10));
    assert_eq!(checkpoint.processed, 10);

    // completed batches leave only the newest marker behind
    let marker = orch.files().latest_completed().await.unwrap().unwrap();
    assert_eq!(marker.batch_id, BatchFileStore::batch_id_for(4));
    assert_eq!((marker.first_id, marker.last_id), (10, 10));
    let batch_files: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("batch_"))
        .collect();
    assert_eq!(batch_files, vec!["batch_000004.completed.json".to_string()]);
}

#[tokio::test]
async fn stop_mid_batch_then_resume_without_reclassifying() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=6));

    // first run: stop after the third classification
    let cancel = CancellationToken::new();
    let first = Arc::new(ScriptedClassifier::new());
    first.cancel_after(3, cancel.clone());

    let orch = orchestrator(test_config(dir.path(), 6, 1), &store, &first).await;
    let summary = orch.run(cancel).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(first.total_calls(), 3);
    assert_eq!(store.results().len(), 3);
    let pending = orch.files().list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!((pending[0].first_id, pending[0].last_id), (1, 6));

    // restart
    let second = Arc::new(ScriptedClassifier::new());
    let orch = orchestrator(test_config(dir.path(), 6, 1), &store, &second).await;
    let summary = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(store.results().len(), 6);
    assert_eq!(second.total_calls(), 3);
    for id in 1..=3 {
        assert_eq!(second.calls(id), 0, "item {id} was reclassified");
    }
    for id in 1..=6 {
        assert_eq!(store.insert_calls(id), 1, "item {id} written more than once");
    }
    assert!(orch.files().list_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn resumed_write_failed_entry_keeps_its_classification() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=4));

    // state left behind by a crashed run: batch 1..=4 pending, item 1
    // already written, item 3 classified but not written
    let files = BatchFileStore::open(dir.path()).await.unwrap();
    let batch = files
        .create((1..=4).map(conversation).collect())
        .await
        .unwrap();
    store.seed_result(ClassificationResult {
        source_id: 1,
        classification: json!({"label": "earlier"}),
        processed_at: Utc::now(),
        batch_job_id: batch.batch_id.clone(),
        processing_duration_ms: 5,
    });
    let stored = ClassificationResult {
        source_id: 3,
        classification: json!({"label": "computed-before-crash"}),
        processed_at: Utc::now(),
        batch_job_id: batch.batch_id.clone(),
        processing_duration_ms: 9,
    };
    files
        .append_retry(
            &batch.batch_id,
            RetryQueueEntry::write_failed(conversation(3), stored, "DEPENDENCY_DOWN", "db down"),
        )
        .await
        .unwrap();
    drop(files);

    let classifier = Arc::new(ScriptedClassifier::new());
    let orch = orchestrator(test_config(dir.path(), 4, 2), &store, &classifier).await;
    let summary = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(classifier.calls(1), 0);
    assert_eq!(classifier.calls(3), 0);
    assert_eq!(classifier.total_calls(), 2);

    let results = store.results();
    assert_eq!(results.len(), 4);
    assert_eq!(results[&1].classification, json!({"label": "earlier"}));
    assert_eq!(
        results[&3].classification,
        json!({"label": "computed-before-crash"})
    );
    assert!(orch.files().is_completed(&batch.batch_id).await.unwrap());
}

#[tokio::test]
async fn transient_write_failure_recovers_on_retry() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=3));
    store.fail_writes(1, WriteFault::Transient(1));
    let classifier = Arc::new(ScriptedClassifier::new());

    let orch = orchestrator(test_config(dir.path(), 3, 3), &store, &classifier).await;
    let summary = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(store.results().len(), 3);
    assert_eq!(classifier.calls(1), 1);
    assert_eq!(store.insert_calls(1), 2);
    assert_eq!(summary.retry_cycles, 1);
}

#[tokio::test]
async fn single_mode_processes_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=7));
    let classifier = Arc::new(ScriptedClassifier::new());

    let mut cfg = test_config(dir.path(), 3, 2);
    cfg.mode = RunMode::Single;

    let orch = orchestrator(cfg, &store, &classifier).await;
    let summary = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.batches_completed, 1);
    assert_eq!(store.results().len(), 3);
}

#[tokio::test]
async fn polling_mode_waits_until_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=2));
    let classifier = Arc::new(ScriptedClassifier::new());

    let mut cfg = test_config(dir.path(), 5, 2);
    cfg.mode = RunMode::Polling {
        interval: Duration::from_secs(3600),
    };

    let orch = orchestrator(cfg, &store, &classifier).await;
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stopper.cancel();
    });

    let summary = tokio::time::timeout(Duration::from_secs(5), orch.run(cancel))
        .await
        .expect("polling run did not stop")
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(store.results().len(), 2);
}

#[tokio::test]
async fn unreachable_store_at_startup_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=2));
    store.set_down(true);
    let classifier = Arc::new(ScriptedClassifier::new());

    let orch = orchestrator(test_config(dir.path(), 5, 2), &store, &classifier).await;
    let err = orch.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, PipelineError::StartupConnectivity(_)));
    assert_eq!(classifier.total_calls(), 0);
}

#[tokio::test]
async fn resource_exhaustion_halts_the_run_and_keeps_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=3));
    store.fail_writes(2, WriteFault::Exhausted);
    let classifier = Arc::new(ScriptedClassifier::new());

    let orch = orchestrator(test_config(dir.path(), 3, 1), &store, &classifier).await;
    let summary = orch.run(CancellationToken::new()).await.unwrap();

    assert!(matches!(summary.outcome, RunOutcome::Fatal(_)));
    assert_eq!(orch.files().list_pending().await.unwrap().len(), 1);
    assert!(summary.permanently_failed.is_empty());
}

#[tokio::test]
async fn permanent_write_error_is_reported_without_retrying() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=3));
    store.fail_writes(2, WriteFault::Permanent);
    let classifier = Arc::new(ScriptedClassifier::new());

    // local write retries are available but must not be spent on it
    let mut cfg = test_config(dir.path(), 3, 2);
    cfg.store_retry = RetryPolicy {
        max_attempts: 3,
        ..RetryPolicy::once()
    };

    let orch = orchestrator(cfg, &store, &classifier).await;
    let summary = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(store.insert_calls(2), 1);
    assert_eq!(classifier.calls(2), 1);
    assert_eq!(summary.retry_cycles, 0);
    assert_eq!(summary.still_retrying, 0);

    assert_eq!(summary.permanently_failed.len(), 1);
    let failure = &summary.permanently_failed[0];
    assert_eq!(failure.source_id, 2);
    assert_eq!(failure.error_code, "BAD_PAYLOAD");
    assert_eq!(failure.retry_count, 0);
    assert_eq!(
        failure.classification,
        Some(json!({"label": "label-2", "call": 1}))
    );
    assert_eq!(store.status(2), Some(RecordStatus::Failed));
    assert_eq!(store.results().len(), 2);
    assert_eq!(summary.batches_completed, 1);
}

#[tokio::test]
async fn reclassified_entry_whose_write_fails_keeps_the_new_classification() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=3));
    // main pass: classification times out; first retry: classified, write fails
    store.fail_writes(2, WriteFault::Transient(1));
    let classifier = Arc::new(ScriptedClassifier::new());
    classifier.script(
        2,
        Script::FailTimes(1, ClassifierError::Timeout(Duration::from_secs(120))),
    );

    let orch = orchestrator(test_config(dir.path(), 3, 2), &store, &classifier).await;
    let summary = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(summary.permanently_failed.is_empty());
    assert_eq!(summary.retry_cycles, 2);

    // the second retry only repeated the write
    assert_eq!(classifier.calls(2), 2);
    assert_eq!(store.insert_calls(2), 2);
    assert_eq!(
        store.results()[&2].classification,
        json!({"label": "label-2", "call": 2})
    );
}

#[tokio::test]
async fn item_without_a_free_slot_is_queued_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=2));
    let classifier = Arc::new(ScriptedClassifier::new());
    // item 1 holds the only slot well past the acquire timeout
    classifier.delay(1, Duration::from_millis(300));

    let mut cfg = test_config(dir.path(), 2, 1);
    cfg.acquire_timeout = Duration::from_millis(50);

    let orch = orchestrator(cfg, &store, &classifier).await;
    let summary = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(store.results().len(), 2);
    assert!(summary.permanently_failed.is_empty());
    // item 2 never ran in the main pass; the retry queue picked it up
    assert_eq!(classifier.calls(2), 1);
    assert_eq!(summary.retry_cycles, 1);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.succeeded, 2);
}

#[tokio::test]
async fn polling_mode_picks_up_records_added_while_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=2));
    let classifier = Arc::new(ScriptedClassifier::new());

    let mut cfg = test_config(dir.path(), 5, 2);
    cfg.mode = RunMode::Polling {
        interval: Duration::from_millis(20),
    };

    let orch = orchestrator(cfg, &store, &classifier).await;
    let cancel = CancellationToken::new();

    let feeder = {
        let store = store.clone();
        let cancel = cancel.clone();
        let batch_dir = dir.path().to_path_buf();
        tokio::spawn(async move {
            let completed_through = |id: i64| {
                let batch_dir = batch_dir.clone();
                async move {
                    loop {
                        let cp = CheckpointTracker::read(&batch_dir).await.unwrap();
                        if cp.and_then(|c| c.last_completed_id) == Some(id) {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            };

            completed_through(2).await;
            store.insert_records(3..=4);
            completed_through(4).await;
            cancel.cancel();
        })
    };

    let summary = tokio::time::timeout(Duration::from_secs(5), orch.run(cancel))
        .await
        .expect("polling run did not stop")
        .unwrap();
    feeder.await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(summary.batches_completed, 2);
    assert_eq!(store.results().len(), 4);
    assert_eq!(classifier.total_calls(), 4);
    assert_eq!(
        store.results()[&3].batch_job_id,
        BatchFileStore::batch_id_for(2)
    );
}

#[tokio::test]
async fn slow_page_reads_hit_the_read_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=2));
    store.slow_reads(Duration::from_secs(2));
    let classifier = Arc::new(ScriptedClassifier::new());

    let mut cfg = test_config(dir.path(), 5, 2);
    cfg.read_timeout = Duration::from_millis(50);
    cfg.max_step_failures = 2;

    let orch = orchestrator(cfg, &store, &classifier).await;
    let summary = tokio::time::timeout(Duration::from_secs(5), orch.run(CancellationToken::new()))
        .await
        .expect("fetch was not bounded by the read timeout")
        .unwrap();

    match summary.outcome {
        RunOutcome::Aborted(reason) => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("expected an aborted run, got {other:?}"),
    }
    assert_eq!(classifier.total_calls(), 0);
}

#[tokio::test]
async fn admin_failure_stops_the_run_after_in_flight_items_finish() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::with_records(1..=3));
    let classifier = Arc::new(ScriptedClassifier::new());
    classifier.delay(1, Duration::from_millis(200));

    let orch = orchestrator(test_config(dir.path(), 3, 1), &store, &classifier).await;
    let cancel = CancellationToken::new();

    // the admin port is already taken, so serving fails mid-classification
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap().to_string();
    let admin = {
        let cancel = cancel.clone();
        let state = AdminState {
            batch_dir: dir.path().to_path_buf(),
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            admin::serve(&addr, state, cancel).await
        })
    };

    let summary = orch.run(cancel).await.unwrap();
    assert!(admin.await.unwrap().is_err());

    assert_eq!(summary.outcome, RunOutcome::Stopped);
    // the item in flight when the server failed was classified and written
    assert_eq!(classifier.calls(1), 1);
    assert_eq!(store.insert_calls(1), 1);
    assert!(store.results().contains_key(&1));
    assert_eq!(classifier.total_calls(), 1);

    let pending = orch.files().list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!((pending[0].first_id, pending[0].last_id), (1, 3));
}
