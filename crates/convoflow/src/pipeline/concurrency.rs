use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What happened to one submitted item.
#[derive(Debug)]
pub enum Dispatched<T, O> {
    /// The work ran to completion (successfully or not, per `O`).
    Completed(O),
    /// No slot freed up within the acquire timeout; the item never ran.
    SlotTimeout(T),
    /// The task panicked. The item is left non-terminal.
    Panicked(String),
}

#[derive(Debug)]
pub struct DispatchReport<T, O> {
    pub outcomes: Vec<Dispatched<T, O>>,
    /// Items left untouched because the run was cancelled first.
    pub not_dispatched: Vec<T>,
}

impl<T, O> DispatchReport<T, O> {
    pub fn cancelled(&self) -> bool {
        !self.not_dispatched.is_empty()
    }
}

/// Bounded worker pool: at most `max_concurrent` units of work in flight.
///
/// A slot is held for the whole classify-then-write step and released when
/// the task finishes, whatever the result.
#[derive(Clone, Debug)]
pub struct ConcurrencyController {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    acquire_timeout: Duration,
}

impl ConcurrencyController {
    pub fn new(max_concurrent: usize, acquire_timeout: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            acquire_timeout,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `work` over `items` in submission order, never exceeding the slot
    /// limit. Completion order is arbitrary.
    ///
    /// Once `cancel` fires no new item is started; items already running are
    /// awaited, never aborted.
    pub async fn run_all<T, O, F, Fut>(
        &self,
        items: Vec<T>,
        cancel: &CancellationToken,
        mut work: F,
    ) -> DispatchReport<T, O>
    where
        T: Send + 'static,
        O: Send + 'static,
        F: FnMut(T) -> Fut,
        Fut: Future<Output = O> + Send + 'static,
    {
        let mut outcomes = Vec::with_capacity(items.len());
        let mut not_dispatched = Vec::new();
        let mut in_flight: JoinSet<O> = JoinSet::new();

        let mut queue = items.into_iter();
        while let Some(item) = queue.next() {
            let deadline = Instant::now() + self.acquire_timeout;

            let permit = loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break None,

                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        outcomes.push(joined_outcome(joined));
                    }

                    acquired = tokio::time::timeout_at(
                        deadline,
                        self.semaphore.clone().acquire_owned(),
                    ) => {
                        match acquired {
                            Ok(Ok(permit)) => break Some(Ok(permit)),
                            Ok(Err(_closed)) => break None,
                            Err(_elapsed) => break Some(Err(())),
                        }
                    }
                }
            };

            match permit {
                Some(Ok(permit)) => {
                    let fut = work(item);
                    in_flight.spawn(async move {
                        let out = fut.await;
                        drop(permit);
                        out
                    });
                }
                Some(Err(())) => {
                    tracing::warn!(
                        timeout_ms = self.acquire_timeout.as_millis() as u64,
                        max_concurrent = self.max_concurrent,
                        "timed out waiting for a worker slot"
                    );
                    outcomes.push(Dispatched::SlotTimeout(item));
                }
                None => {
                    not_dispatched.push(item);
                    not_dispatched.extend(queue.by_ref());
                    break;
                }
            }
        }

        if !not_dispatched.is_empty() {
            tracing::info!(
                in_flight = in_flight.len(),
                skipped = not_dispatched.len(),
                "stop requested; waiting for in-flight items"
            );
        }

        while let Some(joined) = in_flight.join_next().await {
            outcomes.push(joined_outcome(joined));
        }

        DispatchReport {
            outcomes,
            not_dispatched,
        }
    }
}

fn joined_outcome<T, O>(joined: Result<O, tokio::task::JoinError>) -> Dispatched<T, O> {
    match joined {
        Ok(out) => Dispatched::Completed(out),
        Err(e) => {
            tracing::error!(error = %e, "worker task panicked");
            Dispatched::Panicked(e.to_string())
        }
    }
}
