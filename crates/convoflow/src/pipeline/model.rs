use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Store-assigned, monotonically increasing conversation id.
pub type SourceId = i64;

/// One unclassified conversation. `payload` is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SourceRecord {
    pub id: SourceId,
    pub payload: Value,
    pub status: String,
    pub last_processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Processing => "processing",
            RecordStatus::Processed => "processed",
            RecordStatus::Failed => "failed",
        }
    }
}

/// One successful classification. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ClassificationResult {
    pub source_id: SourceId,
    pub classification: Value,
    pub processed_at: DateTime<Utc>,
    pub batch_job_id: String,
    pub processing_duration_ms: i64,
}

/// Durable snapshot of one page of source records.
///
/// `first_id..=last_id` ranges of successive batches are contiguous and
/// never overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFile {
    pub batch_id: String,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub first_id: SourceId,
    pub last_id: SourceId,
    pub items: Vec<SourceRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    /// Classification never succeeded; the whole item is replayed.
    LlmFailed,
    /// Classification succeeded but the write did not; only the write is replayed.
    WriteFailed,
}

impl RetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStatus::LlmFailed => "llm_failed",
            RetryStatus::WriteFailed => "write_failed",
        }
    }
}

/// One failed item awaiting replay. Built through [`RetryQueueEntry::llm_failed`]
/// or [`RetryQueueEntry::write_failed`] so `classification_result` is present
/// exactly when `status` is `WriteFailed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryQueueEntry {
    pub source_id: SourceId,
    pub status: RetryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_result: Option<ClassificationResult>,
    pub conversation_snapshot: SourceRecord,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    pub last_error_code: String,
    pub last_error: String,
}

impl RetryQueueEntry {
    pub fn llm_failed(record: SourceRecord, code: &str, error: impl Into<String>) -> Self {
        Self {
            source_id: record.id,
            status: RetryStatus::LlmFailed,
            classification_result: None,
            conversation_snapshot: record,
            retry_count: 1,
            failed_at: Utc::now(),
            last_error_code: code.to_string(),
            last_error: error.into(),
        }
    }

    pub fn write_failed(
        record: SourceRecord,
        result: ClassificationResult,
        code: &str,
        error: impl Into<String>,
    ) -> Self {
        Self {
            source_id: record.id,
            status: RetryStatus::WriteFailed,
            classification_result: Some(result),
            conversation_snapshot: record,
            retry_count: 1,
            failed_at: Utc::now(),
            last_error_code: code.to_string(),
            last_error: error.into(),
        }
    }

    /// Record another failed attempt. A successful classification moves the
    /// entry to `WriteFailed` so it is never recomputed.
    pub fn record_failure(
        &mut self,
        classified: Option<ClassificationResult>,
        code: &str,
        error: impl Into<String>,
    ) {
        if let Some(result) = classified {
            self.status = RetryStatus::WriteFailed;
            self.classification_result = Some(result);
        }
        self.retry_count += 1;
        self.failed_at = Utc::now();
        self.last_error_code = code.to_string();
        self.last_error = error.into();
    }

    pub fn is_consistent(&self) -> bool {
        match self.status {
            RetryStatus::WriteFailed => self.classification_result.is_some(),
            RetryStatus::LlmFailed => self.classification_result.is_none(),
        }
    }
}

/// A terminal failure. Never dropped silently: persisted to the batch
/// directory's failure report and listed in the run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermanentFailure {
    pub source_id: SourceId,
    pub batch_id: String,
    pub error_code: String,
    pub reason: String,
    pub suggested_action: String,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Value>,
    pub failed_at: DateTime<Utc>,
}
