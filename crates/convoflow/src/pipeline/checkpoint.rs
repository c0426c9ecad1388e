//! Advisory progress state in `checkpoint.json`.
//!
//! Used for monitoring and as a coarse resume hint. Exact crash recovery
//! never depends on it; the batch files are authoritative.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BatchFileError;
use crate::pipeline::batch_files::{read_json, remove_if_exists, write_json_atomic};
use crate::pipeline::model::SourceId;

const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Counters for one run, owned by the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatistics {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retry_cycles: u64,
    pub batches_completed: u64,
}

impl RunStatistics {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            processed: 0,
            succeeded: 0,
            failed: 0,
            retry_cycles: 0,
            batches_completed: 0,
        }
    }

    /// Items per second since the run started.
    pub fn throughput_per_sec(&self, now: DateTime<Utc>) -> f64 {
        let elapsed_ms = (now - self.started_at).num_milliseconds();
        if elapsed_ms <= 0 {
            return 0.0;
        }
        self.processed as f64 * 1_000.0 / elapsed_ms as f64
    }
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// `last_id` of the most recent fully completed batch.
    pub last_completed_id: Option<SourceId>,
    pub last_batch_id: Option<String>,
    pub run_id: Uuid,
    pub updated_at: DateTime<Utc>,

    // cumulative across runs
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retry_cycles: u64,
    pub batches_completed: u64,

    pub throughput_per_sec: f64,
    pub remaining_estimate: Option<u64>,
    pub eta_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    processed: u64,
    succeeded: u64,
    failed: u64,
    retry_cycles: u64,
    batches_completed: u64,
}

#[derive(Debug)]
pub struct CheckpointTracker {
    path: PathBuf,
    interval: u64,
    // totals carried over from earlier runs
    baseline: Totals,
    since_save: u64,
    current: Option<Checkpoint>,
}

impl CheckpointTracker {
    pub fn path_in(batch_dir: &Path) -> PathBuf {
        batch_dir.join(CHECKPOINT_FILE)
    }

    pub async fn read(batch_dir: &Path) -> Result<Option<Checkpoint>, BatchFileError> {
        read_json(&Self::path_in(batch_dir)).await
    }

    /// Operator reset. The next run starts from the batch files alone.
    pub async fn reset(batch_dir: &Path) -> Result<(), BatchFileError> {
        remove_if_exists(&Self::path_in(batch_dir)).await
    }

    pub async fn load(batch_dir: &Path, interval: u64) -> Result<Self, BatchFileError> {
        let current = Self::read(batch_dir).await?;
        let baseline = current
            .as_ref()
            .map(|c| Totals {
                processed: c.processed,
                succeeded: c.succeeded,
                failed: c.failed,
                retry_cycles: c.retry_cycles,
                batches_completed: c.batches_completed,
            })
            .unwrap_or_default();

        if let Some(c) = &current {
            tracing::info!(
                last_completed_id = ?c.last_completed_id,
                processed = c.processed,
                updated_at = %c.updated_at,
                "checkpoint loaded"
            );
        }

        Ok(Self {
            path: Self::path_in(batch_dir),
            interval: interval.max(1),
            baseline,
            since_save: 0,
            current,
        })
    }

    pub fn current(&self) -> Option<&Checkpoint> {
        self.current.as_ref()
    }

    pub fn last_completed_id(&self) -> Option<SourceId> {
        self.current.as_ref().and_then(|c| c.last_completed_id)
    }

    /// Count `n` more items with an outcome; saves once `interval` items have
    /// accumulated. Returns whether a save happened.
    pub async fn record_items(
        &mut self,
        n: u64,
        stats: &RunStatistics,
        remaining: Option<u64>,
    ) -> Result<bool, BatchFileError> {
        self.since_save += n;
        if self.since_save < self.interval {
            return Ok(false);
        }
        let last_completed_id = self.last_completed_id();
        let last_batch_id = self.current.as_ref().and_then(|c| c.last_batch_id.clone());
        self.save(last_completed_id, last_batch_id, stats, remaining)
            .await?;
        Ok(true)
    }

    /// Always saves; called once a batch is marked completed.
    pub async fn batch_boundary(
        &mut self,
        batch_id: &str,
        last_id: SourceId,
        stats: &RunStatistics,
        remaining: Option<u64>,
    ) -> Result<(), BatchFileError> {
        let last_completed_id = Some(self.last_completed_id().map_or(last_id, |c| c.max(last_id)));
        self.save(
            last_completed_id,
            Some(batch_id.to_string()),
            stats,
            remaining,
        )
        .await
    }

    async fn save(
        &mut self,
        last_completed_id: Option<SourceId>,
        last_batch_id: Option<String>,
        stats: &RunStatistics,
        remaining: Option<u64>,
    ) -> Result<(), BatchFileError> {
        let now = Utc::now();
        let throughput = stats.throughput_per_sec(now);
        let eta_seconds = match remaining {
            Some(r) if throughput > 0.0 => Some((r as f64 / throughput).ceil() as u64),
            _ => None,
        };

        let checkpoint = Checkpoint {
            last_completed_id,
            last_batch_id,
            run_id: stats.run_id,
            updated_at: now,
            processed: self.baseline.processed + stats.processed,
            succeeded: self.baseline.succeeded + stats.succeeded,
            failed: self.baseline.failed + stats.failed,
            retry_cycles: self.baseline.retry_cycles + stats.retry_cycles,
            batches_completed: self.baseline.batches_completed + stats.batches_completed,
            throughput_per_sec: throughput,
            remaining_estimate: remaining,
            eta_seconds,
        };

        write_json_atomic(&self.path, &checkpoint).await?;
        self.since_save = 0;

        tracing::info!(
            last_completed_id = ?checkpoint.last_completed_id,
            processed = checkpoint.processed,
            succeeded = checkpoint.succeeded,
            failed = checkpoint.failed,
            throughput_per_sec = throughput,
            eta_seconds = ?checkpoint.eta_seconds,
            "checkpoint saved"
        );

        self.current = Some(checkpoint);
        Ok(())
    }
}
