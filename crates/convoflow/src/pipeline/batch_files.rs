//! Local-disk batch state, the ground truth for crash recovery.
//!
//! Layout under the batch directory, one set of files per batch sequence
//! number:
//!
//! ```text
//! batch_000042.pending.json     snapshot of the page (BatchFile)
//! batch_000042.retry.json       retry queue (Vec<RetryQueueEntry>)
//! batch_000042.completed.json   completion marker
//! permanent_failures.json       run-wide failure report
//! checkpoint.json               advisory progress (see checkpoint.rs)
//! ```
//!
//! Every write goes to a `.tmp` sibling first and is renamed into place, so a
//! crash never leaves a half-written file behind.
//!
//! Completing a batch replaces its snapshot and retry queue with the marker,
//! and only the newest marker is kept: it carries the resume cursor. The
//! directory therefore holds at most the in-flight batch plus one marker.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::BatchFileError;
use crate::pipeline::model::{
    BatchFile, PermanentFailure, RetryQueueEntry, SourceId, SourceRecord,
};

const PENDING_SUFFIX: &str = ".pending.json";
const RETRY_SUFFIX: &str = ".retry.json";
const COMPLETED_SUFFIX: &str = ".completed.json";
const FAILURES_FILE: &str = "permanent_failures.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedMarker {
    pub batch_id: String,
    pub first_id: SourceId,
    pub last_id: SourceId,
    pub item_count: usize,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct BatchFileStore {
    root: PathBuf,
    // serializes read-modify-write cycles on the shared json files
    lock: Mutex<()>,
}

impl BatchFileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, BatchFileError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| BatchFileError::io(&root, e))?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn batch_id_for(sequence: u64) -> String {
        format!("batch_{sequence:06}")
    }

    fn pending_path(&self, batch_id: &str) -> PathBuf {
        self.root.join(format!("{batch_id}{PENDING_SUFFIX}"))
    }

    fn retry_path(&self, batch_id: &str) -> PathBuf {
        self.root.join(format!("{batch_id}{RETRY_SUFFIX}"))
    }

    fn completed_path(&self, batch_id: &str) -> PathBuf {
        self.root.join(format!("{batch_id}{COMPLETED_SUFFIX}"))
    }

    fn failures_path(&self) -> PathBuf {
        self.root.join(FAILURES_FILE)
    }

    /// Snapshot a page as the next batch in sequence.
    ///
    /// `records` must be non-empty and ordered by id.
    pub async fn create(&self, records: Vec<SourceRecord>) -> Result<BatchFile, BatchFileError> {
        let (first_id, last_id) = match (records.first(), records.last()) {
            (Some(first), Some(last)) => (first.id, last.id),
            _ => return Err(BatchFileError::EmptyPage),
        };

        let _guard = self.lock.lock().await;
        let sequence = self.max_sequence().await?.map_or(1, |s| s + 1);
        let batch = BatchFile {
            batch_id: Self::batch_id_for(sequence),
            sequence,
            created_at: Utc::now(),
            first_id,
            last_id,
            items: records,
        };
        write_json_atomic(&self.pending_path(&batch.batch_id), &batch).await?;

        tracing::info!(
            batch_id = %batch.batch_id,
            first_id,
            last_id,
            items = batch.items.len(),
            "batch file created"
        );
        Ok(batch)
    }

    pub async fn write(&self, batch: &BatchFile) -> Result<(), BatchFileError> {
        let _guard = self.lock.lock().await;
        write_json_atomic(&self.pending_path(&batch.batch_id), batch).await
    }

    /// Snapshot of a batch that is not yet completed.
    pub async fn read(&self, batch_id: &str) -> Result<BatchFile, BatchFileError> {
        read_json(&self.pending_path(batch_id))
            .await?
            .ok_or_else(|| BatchFileError::NotFound(batch_id.to_string()))
    }

    /// Batches with a snapshot but no completion marker, oldest first.
    ///
    /// A snapshot next to its own marker was left by a crash inside
    /// `mark_completed`; it is removed here.
    pub async fn list_pending(&self) -> Result<Vec<BatchFile>, BatchFileError> {
        let mut out = Vec::new();
        for (_, batch_id) in self.scan(PENDING_SUFFIX).await? {
            if self.is_completed(&batch_id).await? {
                let _guard = self.lock.lock().await;
                remove_if_exists(&self.retry_path(&batch_id)).await?;
                remove_if_exists(&self.pending_path(&batch_id)).await?;
                continue;
            }
            out.push(self.read(&batch_id).await?);
        }
        Ok(out)
    }

    pub async fn is_completed(&self, batch_id: &str) -> Result<bool, BatchFileError> {
        let path = self.completed_path(batch_id);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| BatchFileError::io(&path, e))
    }

    /// Write the completion marker, then drop the batch's snapshot, its
    /// (now empty) retry queue and every older marker.
    ///
    /// The marker lands first, so a crash part-way leaves a batch that is
    /// already completed, never one that looks pending again.
    pub async fn mark_completed(&self, batch_id: &str) -> Result<CompletedMarker, BatchFileError> {
        let batch = self.read(batch_id).await?;
        let marker = CompletedMarker {
            batch_id: batch.batch_id.clone(),
            first_id: batch.first_id,
            last_id: batch.last_id,
            item_count: batch.items.len(),
            completed_at: Utc::now(),
        };

        let _guard = self.lock.lock().await;
        write_json_atomic(&self.completed_path(batch_id), &marker).await?;
        remove_if_exists(&self.retry_path(batch_id)).await?;
        remove_if_exists(&self.pending_path(batch_id)).await?;

        for (seq, older) in self.scan(COMPLETED_SUFFIX).await? {
            if seq < batch.sequence {
                remove_if_exists(&self.pending_path(&older)).await?;
                remove_if_exists(&self.completed_path(&older)).await?;
            }
        }

        tracing::info!(batch_id, last_id = marker.last_id, "batch marked completed");
        Ok(marker)
    }

    /// The newest completion marker, if any batch has completed.
    pub async fn latest_completed(&self) -> Result<Option<CompletedMarker>, BatchFileError> {
        let Some((_, batch_id)) = self.scan(COMPLETED_SUFFIX).await?.pop() else {
            return Ok(None);
        };
        read_json(&self.completed_path(&batch_id)).await
    }

    /// `last_id` of the newest completed batch: the exact resume cursor.
    pub async fn last_completed_id(&self) -> Result<Option<SourceId>, BatchFileError> {
        Ok(self.latest_completed().await?.map(|m| m.last_id))
    }

    /// Insert or replace (by `source_id`) an entry in a batch's retry queue.
    pub async fn append_retry(
        &self,
        batch_id: &str,
        entry: RetryQueueEntry,
    ) -> Result<(), BatchFileError> {
        let path = self.retry_path(batch_id);
        let _guard = self.lock.lock().await;

        let mut queue: Vec<RetryQueueEntry> = read_json(&path).await?.unwrap_or_default();
        match queue.iter_mut().find(|e| e.source_id == entry.source_id) {
            Some(existing) => *existing = entry,
            None => queue.push(entry),
        }
        write_json_atomic(&path, &queue).await
    }

    pub async fn read_retry_queue(
        &self,
        batch_id: &str,
    ) -> Result<Vec<RetryQueueEntry>, BatchFileError> {
        let _guard = self.lock.lock().await;
        Ok(read_json(&self.retry_path(batch_id))
            .await?
            .unwrap_or_default())
    }

    pub async fn remove_retry(
        &self,
        batch_id: &str,
        source_id: SourceId,
    ) -> Result<(), BatchFileError> {
        let path = self.retry_path(batch_id);
        let _guard = self.lock.lock().await;

        let Some(mut queue) = read_json::<Vec<RetryQueueEntry>>(&path).await? else {
            return Ok(());
        };
        let before = queue.len();
        queue.retain(|e| e.source_id != source_id);
        if queue.len() != before {
            write_json_atomic(&path, &queue).await?;
        }
        Ok(())
    }

    pub async fn record_permanent_failure(
        &self,
        failure: &PermanentFailure,
    ) -> Result<(), BatchFileError> {
        let path = self.failures_path();
        let _guard = self.lock.lock().await;

        let mut report: Vec<PermanentFailure> = read_json(&path).await?.unwrap_or_default();
        report.retain(|f| f.source_id != failure.source_id);
        report.push(failure.clone());
        write_json_atomic(&path, &report).await?;

        tracing::warn!(
            source_id = failure.source_id,
            batch_id = %failure.batch_id,
            code = %failure.error_code,
            retry_count = failure.retry_count,
            reason = %failure.reason,
            "item permanently failed"
        );
        Ok(())
    }

    pub async fn permanent_failures(&self) -> Result<Vec<PermanentFailure>, BatchFileError> {
        let _guard = self.lock.lock().await;
        Ok(read_json(&self.failures_path()).await?.unwrap_or_default())
    }

    /// Highest sequence in use, counting the marker of a completed batch
    /// whose snapshot is gone.
    async fn max_sequence(&self) -> Result<Option<u64>, BatchFileError> {
        let pending = self.scan(PENDING_SUFFIX).await?;
        let completed = self.scan(COMPLETED_SUFFIX).await?;
        Ok(pending
            .into_iter()
            .chain(completed)
            .map(|(seq, _)| seq)
            .max())
    }

    /// `(sequence, batch_id)` for every file with `suffix`, sorted by sequence.
    async fn scan(&self, suffix: &str) -> Result<Vec<(u64, String)>, BatchFileError> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| BatchFileError::io(&self.root, e))?;

        let mut found = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| BatchFileError::io(&self.root, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(batch_id) = name.strip_suffix(suffix) else {
                continue;
            };
            let Some(seq) = batch_id
                .strip_prefix("batch_")
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            found.push((seq, batch_id.to_string()));
        }
        found.sort();
        Ok(found)
    }
}

pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), BatchFileError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| BatchFileError::Corrupt {
        path: path.display().to_string(),
        source: e,
    })?;

    let tmp_path = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| BatchFileError::io(&tmp_path, e))?;
    file.write_all(&bytes)
        .await
        .map_err(|e| BatchFileError::io(&tmp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| BatchFileError::io(&tmp_path, e))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| BatchFileError::io(path, e))
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, BatchFileError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BatchFileError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| BatchFileError::Corrupt {
            path: path.display().to_string(),
            source: e,
        })
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<(), BatchFileError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BatchFileError::io(path, e)),
    }
}
