use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;

use crate::classifier::Classifier;
use crate::error::{ClassifierError, PipelineError, StoreError};
use crate::pipeline::batch_files::BatchFileStore;
use crate::pipeline::error_codes::{suggested_action, ErrorCode};
use crate::pipeline::model::{
    ClassificationResult, PermanentFailure, RecordStatus, RetryQueueEntry, RetryStatus,
    SourceId, SourceRecord,
};
use crate::pipeline::retry::{retry_with_backoff, Classify, ErrorClass, RetryPolicy};
use crate::pipeline::writer::ResultWriter;

/// Terminal or parked state of one item after its main-pass step.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Written {
        source_id: SourceId,
        duration_ms: i64,
    },
    Queued {
        source_id: SourceId,
        status: RetryStatus,
        code: ErrorCode,
    },
    PermanentlyFailed(PermanentFailure),
}

impl ItemOutcome {
    pub fn source_id(&self) -> SourceId {
        match self {
            Self::Written { source_id, .. } | Self::Queued { source_id, .. } => *source_id,
            Self::PermanentlyFailed(f) => f.source_id,
        }
    }
}

/// The per-item classify-then-write step, and the routing of its failures
/// into the retry queue or the permanent-failure report.
pub struct ItemProcessor {
    classifier: Arc<dyn Classifier>,
    writer: ResultWriter,
    files: Arc<BatchFileStore>,
    classifier_retry: RetryPolicy,
    classify_timeout: Duration,
    retry_ceiling: u32,
}

impl ItemProcessor {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        writer: ResultWriter,
        files: Arc<BatchFileStore>,
        classifier_retry: RetryPolicy,
        classify_timeout: Duration,
        retry_ceiling: u32,
    ) -> Self {
        Self {
            classifier,
            writer,
            files,
            classifier_retry,
            classify_timeout,
            retry_ceiling,
        }
    }

    pub fn writer(&self) -> &ResultWriter {
        &self.writer
    }

    pub fn retry_ceiling(&self) -> u32 {
        self.retry_ceiling
    }

    /// Main-pass step: classify with local retries, then write with local
    /// retries. `Err` is reserved for failures that end the run.
    pub async fn process(
        &self,
        batch_id: &str,
        record: SourceRecord,
    ) -> Result<ItemOutcome, PipelineError> {
        let started = Instant::now();

        let classification = match self.classify(&self.classifier_retry, &record).await {
            Ok(v) => v,
            Err(e) => return self.on_classify_failure(batch_id, record, &e).await,
        };

        let result = build_result(&record, classification, batch_id, started);
        match self.writer.write_with_retry(&result).await {
            Ok(()) => {
                self.writer
                    .mark_status(record.id, RecordStatus::Processed)
                    .await;
                tracing::debug!(
                    batch_id,
                    source_id = record.id,
                    duration_ms = result.processing_duration_ms,
                    "item written"
                );
                Ok(ItemOutcome::Written {
                    source_id: record.id,
                    duration_ms: result.processing_duration_ms,
                })
            }
            Err(e) => self.on_write_failure(batch_id, record, result, &e).await,
        }
    }

    /// Classify `record` under `policy`, each attempt bounded by the
    /// classify timeout.
    pub async fn classify(
        &self,
        policy: &RetryPolicy,
        record: &SourceRecord,
    ) -> Result<Value, ClassifierError> {
        let timeout = self.classify_timeout;
        retry_with_backoff(policy, "classify", || async {
            match tokio::time::timeout(timeout, self.classifier.classify(record)).await {
                Ok(res) => res,
                Err(_) => Err(ClassifierError::Timeout(timeout)),
            }
        })
        .await
    }

    /// Park an item that never got a worker slot.
    pub async fn on_slot_timeout(
        &self,
        batch_id: &str,
        record: SourceRecord,
    ) -> Result<ItemOutcome, PipelineError> {
        let source_id = record.id;
        let entry = RetryQueueEntry::llm_failed(
            record,
            ErrorCode::SlotTimeout.as_str(),
            "no worker slot within the acquire timeout",
        );
        self.files.append_retry(batch_id, entry).await?;
        Ok(ItemOutcome::Queued {
            source_id,
            status: RetryStatus::LlmFailed,
            code: ErrorCode::SlotTimeout,
        })
    }

    async fn on_classify_failure(
        &self,
        batch_id: &str,
        record: SourceRecord,
        err: &ClassifierError,
    ) -> Result<ItemOutcome, PipelineError> {
        let code = err.code();
        match err.class() {
            ErrorClass::ResourceExhausted => {
                Err(PipelineError::ResourceExhausted(err.to_string()))
            }
            ErrorClass::Permanent => {
                let failure =
                    permanent_failure(batch_id, record.id, code, err.to_string(), 0, None);
                self.fail_permanently(&failure).await?;
                Ok(ItemOutcome::PermanentlyFailed(failure))
            }
            ErrorClass::Transient if self.retry_ceiling == 0 => {
                let failure =
                    permanent_failure(batch_id, record.id, code, err.to_string(), 1, None);
                self.fail_permanently(&failure).await?;
                Ok(ItemOutcome::PermanentlyFailed(failure))
            }
            ErrorClass::Transient => {
                let source_id = record.id;
                tracing::info!(
                    batch_id,
                    source_id,
                    code = %code,
                    error = %err,
                    "classification queued for retry"
                );
                let entry = RetryQueueEntry::llm_failed(record, code.as_str(), err.to_string());
                self.files.append_retry(batch_id, entry).await?;
                Ok(ItemOutcome::Queued {
                    source_id,
                    status: RetryStatus::LlmFailed,
                    code,
                })
            }
        }
    }

    async fn on_write_failure(
        &self,
        batch_id: &str,
        record: SourceRecord,
        result: ClassificationResult,
        err: &StoreError,
    ) -> Result<ItemOutcome, PipelineError> {
        let code = err.code();
        match err.class() {
            ErrorClass::ResourceExhausted => {
                Err(PipelineError::ResourceExhausted(err.to_string()))
            }
            ErrorClass::Permanent => {
                let failure = permanent_failure(
                    batch_id,
                    record.id,
                    code,
                    err.to_string(),
                    0,
                    Some(result.classification),
                );
                self.fail_permanently(&failure).await?;
                Ok(ItemOutcome::PermanentlyFailed(failure))
            }
            ErrorClass::Transient if self.retry_ceiling == 0 => {
                let failure = permanent_failure(
                    batch_id,
                    record.id,
                    code,
                    err.to_string(),
                    1,
                    Some(result.classification),
                );
                self.fail_permanently(&failure).await?;
                Ok(ItemOutcome::PermanentlyFailed(failure))
            }
            ErrorClass::Transient => {
                let source_id = record.id;
                tracing::info!(
                    batch_id,
                    source_id,
                    code = %code,
                    error = %err,
                    "write queued for retry"
                );
                let entry =
                    RetryQueueEntry::write_failed(record, result, code.as_str(), err.to_string());
                self.files.append_retry(batch_id, entry).await?;
                Ok(ItemOutcome::Queued {
                    source_id,
                    status: RetryStatus::WriteFailed,
                    code,
                })
            }
        }
    }

    /// Persist the failure report entry, then flag the source record.
    pub async fn fail_permanently(&self, failure: &PermanentFailure) -> Result<(), PipelineError> {
        self.files.record_permanent_failure(failure).await?;
        self.writer
            .mark_status(failure.source_id, RecordStatus::Failed)
            .await;
        Ok(())
    }
}

pub(crate) fn build_result(
    record: &SourceRecord,
    classification: Value,
    batch_id: &str,
    started: Instant,
) -> ClassificationResult {
    ClassificationResult {
        source_id: record.id,
        classification,
        processed_at: Utc::now(),
        batch_job_id: batch_id.to_string(),
        processing_duration_ms: started.elapsed().as_millis() as i64,
    }
}

pub(crate) fn permanent_failure(
    batch_id: &str,
    source_id: SourceId,
    code: ErrorCode,
    reason: String,
    retry_count: u32,
    classification: Option<Value>,
) -> PermanentFailure {
    PermanentFailure {
        source_id,
        batch_id: batch_id.to_string(),
        error_code: code.as_str().to_string(),
        reason,
        suggested_action: suggested_action(code).to_string(),
        retry_count,
        classification,
        failed_at: Utc::now(),
    }
}
