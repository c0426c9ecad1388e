use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::classifier::Classifier;
use crate::config::{PipelineConfig, RunMode};
use crate::error::{BatchFileError, PipelineError, StoreError};
use crate::pipeline::batch_files::BatchFileStore;
use crate::pipeline::checkpoint::{CheckpointTracker, RunStatistics};
use crate::pipeline::concurrency::{ConcurrencyController, DispatchReport, Dispatched};
use crate::pipeline::item::{ItemOutcome, ItemProcessor};
use crate::pipeline::model::{BatchFile, PermanentFailure, SourceId, SourceRecord};
use crate::pipeline::pager::CursorPager;
use crate::pipeline::retry::{next_delay, retry_with_backoff};
use crate::pipeline::retry_queue::RetryQueueProcessor;
use crate::pipeline::writer::ResultWriter;
use crate::store::ConversationStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Source drained (batch mode) or the single batch finished.
    Completed,
    /// External stop signal. Batch files are left for the next run.
    Stopped,
    /// Too many consecutive step failures.
    Aborted(String),
    /// Resource exhaustion or local batch-file failure.
    Fatal(String),
}

/// Produced for every run, however it ends (except a store that is
/// unreachable at startup).
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub processed: u64,
    pub succeeded: u64,
    pub retry_cycles: u64,
    pub permanently_failed: Vec<PermanentFailure>,
    pub still_retrying: usize,
    pub batches_completed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

struct Round {
    batch: BatchFile,
    /// Fetched in this run, as opposed to resumed from disk.
    fresh: bool,
    has_more: bool,
}

enum State {
    Resuming,
    Fetching,
    Dispatching(Round),
    DrainingRetries(Round),
    Checkpointing(Round),
    Waiting,
    Done(RunOutcome),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Resuming => "resuming",
            State::Fetching => "fetching",
            State::Dispatching(_) => "dispatching",
            State::DrainingRetries(_) => "draining_retries",
            State::Checkpointing(_) => "checkpointing",
            State::Waiting => "waiting",
            State::Done(_) => "done",
        }
    }
}

struct Run {
    stats: RunStatistics,
    failures: Vec<PermanentFailure>,
    checkpoint: CheckpointTracker,
    cursor: Option<SourceId>,
    step_failures: u32,
}

/// Drives one run: resume pending batches, fetch, dispatch, drain retries,
/// checkpoint, repeat.
pub struct Orchestrator {
    cfg: PipelineConfig,
    store: Arc<dyn ConversationStore>,
    files: Arc<BatchFileStore>,
    pager: CursorPager,
    items: Arc<ItemProcessor>,
    retries: RetryQueueProcessor,
    controller: ConcurrencyController,
}

impl Orchestrator {
    pub async fn new(
        cfg: PipelineConfig,
        store: Arc<dyn ConversationStore>,
        classifier: Arc<dyn Classifier>,
    ) -> Result<Self, PipelineError> {
        let files = Arc::new(BatchFileStore::open(cfg.batch_dir.clone()).await?);
        let writer = ResultWriter::new(store.clone(), cfg.write_timeout, cfg.store_retry.clone());
        let items = Arc::new(ItemProcessor::new(
            classifier,
            writer,
            files.clone(),
            cfg.classifier_retry.clone(),
            cfg.classify_timeout,
            cfg.retry_ceiling,
        ));
        let retries = RetryQueueProcessor::new(
            items.clone(),
            files.clone(),
            cfg.classifier_retry.backoff.clone(),
            cfg.store_retry.backoff.clone(),
        );
        let controller = ConcurrencyController::new(cfg.max_concurrent, cfg.acquire_timeout);

        Ok(Self {
            pager: CursorPager::new(store.clone()),
            cfg,
            store,
            files,
            items,
            retries,
            controller,
        })
    }

    pub fn files(&self) -> &BatchFileStore {
        &self.files
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary, PipelineError> {
        let stats = RunStatistics::new();
        tracing::info!(
            run_id = %stats.run_id,
            mode = self.cfg.mode.as_str(),
            batch_size = self.cfg.batch_size,
            max_concurrent = self.cfg.max_concurrent,
            retry_ceiling = self.cfg.retry_ceiling,
            batch_dir = %self.cfg.batch_dir.display(),
            "run starting"
        );

        let (checkpoint, cursor) = match self.start().await {
            Ok(v) => v,
            Err(e @ PipelineError::StartupConnectivity(_)) => {
                tracing::error!(error = %e, "store unreachable at startup");
                return Err(e);
            }
            Err(e) => {
                tracing::error!(error = %e, "startup failed");
                return Ok(self
                    .summary(stats, Vec::new(), RunOutcome::Fatal(e.to_string()))
                    .await);
            }
        };

        let mut run = Run {
            stats,
            failures: Vec::new(),
            checkpoint,
            cursor,
            step_failures: 0,
        };

        let mut state = State::Resuming;
        let outcome = loop {
            if cancel.is_cancelled() && !matches!(state, State::Done(_)) {
                break RunOutcome::Stopped;
            }
            tracing::debug!(state = state.name(), cursor = ?run.cursor, "orchestrator step");

            let next = match state {
                State::Resuming => self.resume_or_fetch().await,
                State::Fetching => self.fetch(&run).await,
                State::Dispatching(round) => self.dispatch(round, &mut run, &cancel).await,
                State::DrainingRetries(round) => self.drain(round, &mut run, &cancel).await,
                State::Checkpointing(round) => self.complete(round, &mut run).await,
                State::Waiting => Ok(self.wait(&cancel).await),
                State::Done(outcome) => break outcome,
            };

            state = match next {
                Ok(s) => s,
                Err(e) => self.on_step_failure(e, &mut run, &cancel).await,
            };
        };

        let summary = self.summary(run.stats, run.failures, outcome).await;
        tracing::info!(
            run_id = %summary.run_id,
            outcome = ?summary.outcome,
            processed = summary.processed,
            succeeded = summary.succeeded,
            permanently_failed = summary.permanently_failed.len(),
            still_retrying = summary.still_retrying,
            batches_completed = summary.batches_completed,
            "run finished"
        );
        Ok(summary)
    }

    /// Connectivity check, then the resume cursor: the furthest of the last
    /// completed batch on disk and the checkpoint.
    async fn start(&self) -> Result<(CheckpointTracker, Option<SourceId>), PipelineError> {
        tracing::info!(state = "starting", "orchestrator step");

        retry_with_backoff(&self.cfg.store_retry, "startup_ping", || self.store.ping())
            .await
            .map_err(PipelineError::StartupConnectivity)?;

        let checkpoint =
            CheckpointTracker::load(&self.cfg.batch_dir, self.cfg.checkpoint_interval).await?;
        let from_files = self.files.last_completed_id().await?;
        let cursor = from_files.max(checkpoint.last_completed_id());

        tracing::info!(?cursor, ?from_files, "resume cursor");
        Ok((checkpoint, cursor))
    }

    async fn resume_or_fetch(&self) -> Result<State, PipelineError> {
        let pending = self.files.list_pending().await?;
        match pending.into_iter().next() {
            Some(batch) => {
                tracing::info!(
                    batch_id = %batch.batch_id,
                    first_id = batch.first_id,
                    last_id = batch.last_id,
                    "resuming pending batch"
                );
                Ok(State::Dispatching(Round {
                    batch,
                    fresh: false,
                    has_more: true,
                }))
            }
            None => Ok(State::Fetching),
        }
    }

    async fn fetch(&self, run: &Run) -> Result<State, PipelineError> {
        let page = retry_with_backoff(&self.cfg.store_retry, "fetch_page", || {
            self.timed_read(self.pager.next_page(run.cursor, self.cfg.batch_size))
        })
        .await?;

        if page.records.is_empty() {
            tracing::info!(cursor = ?run.cursor, "no new records");
            return Ok(match self.cfg.mode {
                RunMode::Polling { .. } => State::Waiting,
                RunMode::Single | RunMode::Batch => State::Done(RunOutcome::Completed),
            });
        }

        let batch = self.files.create(page.records).await?;
        Ok(State::Dispatching(Round {
            batch,
            fresh: true,
            has_more: page.has_more,
        }))
    }

    /// Main pass over the items that are not yet terminal or queued.
    async fn dispatch(
        &self,
        round: Round,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<State, PipelineError> {
        let batch_id = round.batch.batch_id.clone();
        let ids: Vec<SourceId> = round.batch.items.iter().map(|r| r.id).collect();

        let terminal = self.terminal_ids(&ids).await?;
        let queued: HashSet<SourceId> = self
            .files
            .read_retry_queue(&batch_id)
            .await?
            .into_iter()
            .map(|e| e.source_id)
            .collect();

        let todo: Vec<SourceRecord> = round
            .batch
            .items
            .iter()
            .filter(|r| !terminal.contains(&r.id) && !queued.contains(&r.id))
            .cloned()
            .collect();

        tracing::info!(
            batch_id = %batch_id,
            items = ids.len(),
            to_process = todo.len(),
            already_terminal = terminal.len(),
            queued = queued.len(),
            "dispatching batch"
        );

        let DispatchReport {
            outcomes,
            not_dispatched,
        } = self
            .controller
            .run_all(todo, cancel, |record| {
                let items = self.items.clone();
                let batch_id = batch_id.clone();
                async move { items.process(&batch_id, record).await }
            })
            .await;

        let mut fatal: Option<PipelineError> = None;
        for dispatched in outcomes {
            let outcome = match dispatched {
                Dispatched::Completed(Ok(outcome)) => outcome,
                Dispatched::Completed(Err(e)) => {
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                    continue;
                }
                Dispatched::SlotTimeout(record) => {
                    self.items.on_slot_timeout(&batch_id, record).await?
                }
                Dispatched::Panicked(reason) => {
                    tracing::error!(batch_id = %batch_id, reason = %reason, "item left unfinished");
                    continue;
                }
            };

            run.stats.processed += 1;
            match outcome {
                ItemOutcome::Written { .. } => run.stats.succeeded += 1,
                ItemOutcome::Queued { .. } => {}
                ItemOutcome::PermanentlyFailed(f) => {
                    run.stats.failed += 1;
                    run.failures.push(f);
                }
            }
            advisory(run.checkpoint.record_items(1, &run.stats, None).await)?;
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if !not_dispatched.is_empty() {
            tracing::info!(
                batch_id = %batch_id,
                not_dispatched = not_dispatched.len(),
                "stop requested mid-batch"
            );
            return Ok(State::Done(RunOutcome::Stopped));
        }
        Ok(State::DrainingRetries(round))
    }

    async fn drain(
        &self,
        round: Round,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<State, PipelineError> {
        let report = self
            .retries
            .drain(&round.batch.batch_id, &self.controller, cancel)
            .await?;

        run.stats.retry_cycles += report.retry_cycles;
        run.stats.succeeded += report.succeeded;
        run.stats.failed += report.permanently_failed.len() as u64;
        run.failures.extend(report.permanently_failed);

        if report.stopped {
            return Ok(State::Done(RunOutcome::Stopped));
        }
        Ok(State::Checkpointing(round))
    }

    /// Mark the batch completed and advance the cursor, but only once every
    /// item in it is terminal.
    async fn complete(&self, round: Round, run: &mut Run) -> Result<State, PipelineError> {
        let batch = &round.batch;
        let ids: Vec<SourceId> = batch.items.iter().map(|r| r.id).collect();
        let terminal = self.terminal_ids(&ids).await?;
        let outstanding = ids.iter().filter(|id| !terminal.contains(*id)).count();
        if outstanding > 0 {
            return Err(PipelineError::Incomplete {
                batch_id: batch.batch_id.clone(),
                outstanding,
            });
        }

        self.files.mark_completed(&batch.batch_id).await?;
        run.cursor = Some(run.cursor.map_or(batch.last_id, |c| c.max(batch.last_id)));
        run.stats.batches_completed += 1;
        run.step_failures = 0;

        let remaining = match self.store.count_after(run.cursor).await {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!(error = %e, "could not estimate remaining records");
                None
            }
        };
        advisory(
            run.checkpoint
                .batch_boundary(&batch.batch_id, batch.last_id, &run.stats, remaining)
                .await,
        )?;

        Ok(match (&self.cfg.mode, round.fresh, round.has_more) {
            (RunMode::Single, true, _) => State::Done(RunOutcome::Completed),
            (RunMode::Batch, true, false) => State::Done(RunOutcome::Completed),
            (RunMode::Polling { .. }, true, false) => State::Waiting,
            _ => State::Resuming,
        })
    }

    async fn wait(&self, cancel: &CancellationToken) -> State {
        let RunMode::Polling { interval } = &self.cfg.mode else {
            return State::Resuming;
        };
        let interval = *interval;
        tracing::info!(interval_secs = interval.as_secs(), "waiting for new records");
        tokio::select! {
            _ = cancel.cancelled() => State::Done(RunOutcome::Stopped),
            _ = tokio::time::sleep(interval) => State::Resuming,
        }
    }

    /// Ids among `ids` that have a written result or a reported failure.
    async fn terminal_ids(&self, ids: &[SourceId]) -> Result<HashSet<SourceId>, PipelineError> {
        let mut terminal = retry_with_backoff(&self.cfg.store_retry, "existing_results", || {
            self.timed_read(self.store.existing_results(ids))
        })
        .await?;
        terminal.extend(
            self.files
                .permanent_failures()
                .await?
                .into_iter()
                .map(|f| f.source_id)
                .filter(|id| ids.contains(id)),
        );
        Ok(terminal)
    }

    async fn timed_read<T>(
        &self,
        read: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let timeout = self.cfg.read_timeout;
        match tokio::time::timeout(timeout, read).await {
            Ok(res) => res,
            Err(_) => Err(StoreError::Timeout(timeout)),
        }
    }

    async fn on_step_failure(
        &self,
        err: PipelineError,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> State {
        if err.is_fatal() {
            tracing::error!(error = %err, "fatal step failure; halting run");
            return State::Done(RunOutcome::Fatal(err.to_string()));
        }

        run.step_failures += 1;
        tracing::error!(
            error = %err,
            consecutive = run.step_failures,
            max = self.cfg.max_step_failures,
            "step failed"
        );

        let polling = matches!(self.cfg.mode, RunMode::Polling { .. });
        if !polling && run.step_failures >= self.cfg.max_step_failures {
            return State::Done(RunOutcome::Aborted(format!(
                "{} consecutive step failures, last: {err}",
                run.step_failures
            )));
        }

        let delay = {
            let mut rng = StdRng::from_entropy();
            next_delay(run.step_failures, &self.cfg.store_retry.backoff, &mut rng)
        };
        tokio::select! {
            _ = cancel.cancelled() => State::Done(RunOutcome::Stopped),
            _ = tokio::time::sleep(delay) => State::Resuming,
        }
    }

    async fn summary(
        &self,
        stats: RunStatistics,
        failures: Vec<PermanentFailure>,
        outcome: RunOutcome,
    ) -> RunSummary {
        RunSummary {
            run_id: stats.run_id,
            outcome,
            processed: stats.processed,
            succeeded: stats.succeeded,
            retry_cycles: stats.retry_cycles,
            permanently_failed: failures,
            still_retrying: self.still_retrying().await,
            batches_completed: stats.batches_completed,
            started_at: stats.started_at,
            finished_at: Utc::now(),
        }
    }

    async fn still_retrying(&self) -> usize {
        let pending = match self.files.list_pending().await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "could not list pending batches for the summary");
                return 0;
            }
        };
        let mut total = 0;
        for batch in pending {
            match self.files.read_retry_queue(&batch.batch_id).await {
                Ok(q) => total += q.len(),
                Err(e) => {
                    tracing::warn!(batch_id = %batch.batch_id, error = %e, "unreadable retry queue")
                }
            }
        }
        total
    }
}

/// Checkpoint writes never stop the run, except when the disk is full.
fn advisory<T>(res: Result<T, BatchFileError>) -> Result<(), PipelineError> {
    match res {
        Ok(_) => Ok(()),
        Err(e) if e.is_disk_full() => Err(PipelineError::ResourceExhausted(e.to_string())),
        Err(e) => {
            tracing::warn!(error = %e, "checkpoint write failed");
            Ok(())
        }
    }
}
