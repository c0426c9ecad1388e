use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::{rngs::StdRng, SeedableRng};
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, StoreError};
use crate::pipeline::batch_files::BatchFileStore;
use crate::pipeline::concurrency::{ConcurrencyController, Dispatched};
use crate::pipeline::error_codes::ErrorCode;
use crate::pipeline::item::{build_result, permanent_failure, ItemProcessor};
use crate::pipeline::model::{
    ClassificationResult, PermanentFailure, RecordStatus, RetryQueueEntry, RetryStatus,
};
use crate::pipeline::retry::{next_delay, Classify, ErrorClass, RetryConfig, RetryPolicy};

/// Totals from draining one batch's retry queue.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Entry attempts made, one per entry per pass.
    pub retry_cycles: u64,
    pub succeeded: u64,
    pub permanently_failed: Vec<PermanentFailure>,
    /// Entries still queued when the drain returned.
    pub remaining: usize,
    pub stopped: bool,
}

enum EntryOutcome {
    Written,
    Requeued,
    Permanent(PermanentFailure),
}

/// Replays a batch's retry queue until every entry is terminal.
///
/// `llm_failed` entries are classified and written again; `write_failed`
/// entries only repeat the write with the stored classification.
pub struct RetryQueueProcessor {
    items: Arc<ItemProcessor>,
    files: Arc<BatchFileStore>,
    classifier_backoff: RetryConfig,
    store_backoff: RetryConfig,
}

impl RetryQueueProcessor {
    pub fn new(
        items: Arc<ItemProcessor>,
        files: Arc<BatchFileStore>,
        classifier_backoff: RetryConfig,
        store_backoff: RetryConfig,
    ) -> Self {
        Self {
            items,
            files,
            classifier_backoff,
            store_backoff,
        }
    }

    pub async fn drain(
        &self,
        batch_id: &str,
        controller: &ConcurrencyController,
        cancel: &CancellationToken,
    ) -> Result<DrainReport, PipelineError> {
        let mut report = DrainReport::default();

        loop {
            let queue = self.prune(batch_id).await?;
            if queue.is_empty() {
                return Ok(report);
            }

            let delay = self.pass_delay(&queue);
            tracing::info!(
                batch_id,
                entries = queue.len(),
                delay_ms = delay.as_millis() as u64,
                "draining retry queue"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    report.remaining = queue.len();
                    report.stopped = true;
                    return Ok(report);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let pass = controller
                .run_all(queue, cancel, |entry| {
                    let items = self.items.clone();
                    let files = self.files.clone();
                    let batch_id = batch_id.to_string();
                    async move { retry_entry(&items, &files, &batch_id, entry).await }
                })
                .await;

            let mut fatal: Option<PipelineError> = None;
            let mut panicked = 0usize;
            for outcome in pass.outcomes {
                match outcome {
                    Dispatched::Completed(Ok(EntryOutcome::Written)) => {
                        report.retry_cycles += 1;
                        report.succeeded += 1;
                    }
                    Dispatched::Completed(Ok(EntryOutcome::Requeued)) => {
                        report.retry_cycles += 1;
                    }
                    Dispatched::Completed(Ok(EntryOutcome::Permanent(f))) => {
                        report.retry_cycles += 1;
                        report.permanently_failed.push(f);
                    }
                    Dispatched::Completed(Err(e)) => {
                        report.retry_cycles += 1;
                        if fatal.is_none() {
                            fatal = Some(e);
                        }
                    }
                    Dispatched::SlotTimeout(mut entry) => {
                        report.retry_cycles += 1;
                        entry.record_failure(
                            None,
                            ErrorCode::SlotTimeout.as_str(),
                            "no worker slot within the acquire timeout",
                        );
                        if let Some(f) =
                            settle_failed(&self.items, &self.files, batch_id, entry).await?
                        {
                            report.permanently_failed.push(f);
                        }
                    }
                    Dispatched::Panicked(_) => panicked += 1,
                }
            }

            if let Some(e) = fatal {
                return Err(e);
            }

            if !pass.not_dispatched.is_empty() || cancel.is_cancelled() {
                report.remaining = self.files.read_retry_queue(batch_id).await?.len();
                report.stopped = true;
                return Ok(report);
            }

            if panicked > 0 {
                let outstanding = self.files.read_retry_queue(batch_id).await?.len();
                return Err(PipelineError::Incomplete {
                    batch_id: batch_id.to_string(),
                    outstanding,
                });
            }
        }
    }

    /// Read the queue, dropping entries that are already terminal (result
    /// written or failure reported) from a run that crashed mid-update.
    async fn prune(&self, batch_id: &str) -> Result<Vec<RetryQueueEntry>, PipelineError> {
        let queue = self.files.read_retry_queue(batch_id).await?;
        if queue.is_empty() {
            return Ok(queue);
        }

        let ids: Vec<_> = queue.iter().map(|e| e.source_id).collect();
        let written = self
            .items
            .writer()
            .store()
            .existing_results(&ids)
            .await
            .map_err(PipelineError::Store)?;
        let failed: HashSet<_> = self
            .files
            .permanent_failures()
            .await?
            .into_iter()
            .map(|f| f.source_id)
            .collect();

        let mut live = Vec::with_capacity(queue.len());
        for entry in queue {
            if written.contains(&entry.source_id) || failed.contains(&entry.source_id) {
                tracing::info!(
                    batch_id,
                    source_id = entry.source_id,
                    "dropping retry entry that is already terminal"
                );
                self.files.remove_retry(batch_id, entry.source_id).await?;
            } else {
                live.push(entry);
            }
        }
        Ok(live)
    }

    /// Shortest backoff among the queued entries.
    fn pass_delay(&self, queue: &[RetryQueueEntry]) -> Duration {
        let mut rng = StdRng::from_entropy();
        queue
            .iter()
            .map(|e| {
                let cfg = match e.status {
                    RetryStatus::LlmFailed => &self.classifier_backoff,
                    RetryStatus::WriteFailed => &self.store_backoff,
                };
                next_delay(e.retry_count, cfg, &mut rng)
            })
            .min()
            .unwrap_or(Duration::ZERO)
    }
}

async fn retry_entry(
    items: &ItemProcessor,
    files: &BatchFileStore,
    batch_id: &str,
    mut entry: RetryQueueEntry,
) -> Result<EntryOutcome, PipelineError> {
    let started = Instant::now();

    let result = match (entry.status, entry.classification_result.clone()) {
        (RetryStatus::WriteFailed, Some(result)) => result,
        _ => {
            let record = &entry.conversation_snapshot;
            match items.classify(&RetryPolicy::once(), record).await {
                Ok(classification) => build_result(record, classification, batch_id, started),
                Err(e) => {
                    let code = e.code();
                    return match e.class() {
                        ErrorClass::ResourceExhausted => {
                            Err(PipelineError::ResourceExhausted(e.to_string()))
                        }
                        ErrorClass::Permanent => {
                            let failure = permanent_failure(
                                batch_id,
                                entry.source_id,
                                code,
                                e.to_string(),
                                entry.retry_count,
                                None,
                            );
                            items.fail_permanently(&failure).await?;
                            files.remove_retry(batch_id, entry.source_id).await?;
                            Ok(EntryOutcome::Permanent(failure))
                        }
                        ErrorClass::Transient => {
                            entry.record_failure(None, code.as_str(), e.to_string());
                            Ok(settle_failed(items, files, batch_id, entry)
                                .await?
                                .map_or(EntryOutcome::Requeued, EntryOutcome::Permanent))
                        }
                    };
                }
            }
        }
    };

    match items.writer().write(&result).await {
        Ok(()) => {
            files.remove_retry(batch_id, entry.source_id).await?;
            items
                .writer()
                .mark_status(entry.source_id, RecordStatus::Processed)
                .await;
            tracing::info!(
                batch_id,
                source_id = entry.source_id,
                retry_count = entry.retry_count,
                "retry succeeded"
            );
            Ok(EntryOutcome::Written)
        }
        Err(e) => on_retry_write_failure(items, files, batch_id, entry, result, e).await,
    }
}

async fn on_retry_write_failure(
    items: &ItemProcessor,
    files: &BatchFileStore,
    batch_id: &str,
    mut entry: RetryQueueEntry,
    result: ClassificationResult,
    err: StoreError,
) -> Result<EntryOutcome, PipelineError> {
    let code = err.code();
    match err.class() {
        ErrorClass::ResourceExhausted => Err(PipelineError::ResourceExhausted(err.to_string())),
        ErrorClass::Permanent => {
            let failure = permanent_failure(
                batch_id,
                entry.source_id,
                code,
                err.to_string(),
                entry.retry_count,
                Some(result.classification),
            );
            items.fail_permanently(&failure).await?;
            files.remove_retry(batch_id, entry.source_id).await?;
            Ok(EntryOutcome::Permanent(failure))
        }
        ErrorClass::Transient => {
            entry.record_failure(Some(result), code.as_str(), err.to_string());
            Ok(settle_failed(items, files, batch_id, entry)
                .await?
                .map_or(EntryOutcome::Requeued, EntryOutcome::Permanent))
        }
    }
}

/// After a failed attempt: requeue the entry, or report it once it has
/// failed more than `retry_ceiling` times.
async fn settle_failed(
    items: &ItemProcessor,
    files: &BatchFileStore,
    batch_id: &str,
    entry: RetryQueueEntry,
) -> Result<Option<PermanentFailure>, PipelineError> {
    if entry.retry_count <= items.retry_ceiling() {
        tracing::info!(
            batch_id,
            source_id = entry.source_id,
            status = entry.status.as_str(),
            retry_count = entry.retry_count,
            code = %entry.last_error_code,
            "retry failed; requeued"
        );
        files.append_retry(batch_id, entry).await?;
        return Ok(None);
    }

    let failure = permanent_failure(
        batch_id,
        entry.source_id,
        ErrorCode::from_str(&entry.last_error_code),
        format!(
            "retry ceiling of {} exceeded: {}",
            items.retry_ceiling(),
            entry.last_error
        ),
        entry.retry_count,
        entry
            .classification_result
            .as_ref()
            .map(|r| r.classification.clone()),
    );
    items.fail_permanently(&failure).await?;
    files.remove_retry(batch_id, entry.source_id).await?;
    Ok(Some(failure))
}
