#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio_util::sync::CancellationToken;

use convoflow::config::{PipelineConfig, RunMode};
use convoflow::error::{ClassifierError, StoreError};
use convoflow::pipeline::model::{ClassificationResult, RecordStatus, SourceId, SourceRecord};
use convoflow::pipeline::retry::RetryPolicy;
use convoflow::{Classifier, ConversationStore};

/// Connects to `TEST_DATABASE_URL`, migrates and truncates. `None` when the
/// variable is unset so Postgres tests can be skipped locally.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let url = std::env::var("TEST_DATABASE_URL").ok()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query(
        r#"
        TRUNCATE TABLE
            classification_results,
            conversations
        RESTART IDENTITY CASCADE
        "#,
    )
    .execute(&pool)
    .await
    .expect("truncate failed");

    Some(pool)
}

/// Fast, deterministic pipeline settings: no local retries, no backoff.
pub fn test_config(dir: &Path, batch_size: usize, max_concurrent: usize) -> PipelineConfig {
    PipelineConfig {
        batch_dir: dir.to_path_buf(),
        batch_size,
        max_concurrent,
        retry_ceiling: 3,
        classifier_retry: RetryPolicy::once(),
        store_retry: RetryPolicy::once(),
        classify_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_secs(5),
        acquire_timeout: Duration::from_secs(5),
        checkpoint_interval: 50,
        mode: RunMode::Batch,
        max_step_failures: 3,
    }
}

pub fn conversation(id: SourceId) -> SourceRecord {
    SourceRecord {
        id,
        payload: json!({"messages": [{"sender": "customer", "content": format!("question {id}")}]}),
        status: "pending".into(),
        last_processed_at: None,
    }
}

#[derive(Clone, Copy, Debug)]
pub enum WriteFault {
    /// Fail transiently this many more times, then succeed.
    Transient(u32),
    AlwaysTransient,
    Permanent,
    Exhausted,
}

/// In-memory `ConversationStore` with per-id write fault injection.
#[derive(Default)]
pub struct MemStore {
    records: Mutex<BTreeMap<SourceId, SourceRecord>>,
    results: Mutex<HashMap<SourceId, ClassificationResult>>,
    insert_calls: Mutex<HashMap<SourceId, u32>>,
    faults: Mutex<HashMap<SourceId, WriteFault>>,
    statuses: Mutex<HashMap<SourceId, RecordStatus>>,
    read_delay: Mutex<Option<Duration>>,
    down: AtomicBool,
}

impl MemStore {
    pub fn with_records(ids: impl IntoIterator<Item = SourceId>) -> Self {
        let store = Self::default();
        {
            let mut records = store.records.lock().unwrap();
            for id in ids {
                records.insert(id, conversation(id));
            }
        }
        store
    }

    /// Add records after construction, e.g. while a polling run waits.
    pub fn insert_records(&self, ids: impl IntoIterator<Item = SourceId>) {
        let mut records = self.records.lock().unwrap();
        for id in ids {
            records.insert(id, conversation(id));
        }
    }

    /// Delay every page fetch by `delay`.
    pub fn slow_reads(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_writes(&self, id: SourceId, fault: WriteFault) {
        self.faults.lock().unwrap().insert(id, fault);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn seed_result(&self, result: ClassificationResult) {
        self.results
            .lock()
            .unwrap()
            .insert(result.source_id, result);
    }

    pub fn results(&self) -> BTreeMap<SourceId, ClassificationResult> {
        self.results
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    pub fn insert_calls(&self, id: SourceId) -> u32 {
        self.insert_calls
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    pub fn status(&self, id: SourceId) -> Option<RecordStatus> {
        self.statuses.lock().unwrap().get(&id).copied()
    }

    fn check_up(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_up()
    }

    async fn fetch_after(
        &self,
        after_id: Option<SourceId>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        self.check_up()?;
        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let records = self.records.lock().unwrap();
        let start = after_id.map_or(SourceId::MIN, |a| a + 1);
        Ok(records
            .range(start..)
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn count_after(&self, after_id: Option<SourceId>) -> Result<u64, StoreError> {
        self.check_up()?;
        let records = self.records.lock().unwrap();
        let start = after_id.map_or(SourceId::MIN, |a| a + 1);
        Ok(records.range(start..).count() as u64)
    }

    async fn insert_result(&self, result: &ClassificationResult) -> Result<(), StoreError> {
        self.check_up()?;
        let id = result.source_id;
        *self.insert_calls.lock().unwrap().entry(id).or_default() += 1;

        let mut faults = self.faults.lock().unwrap();
        match faults.get_mut(&id) {
            Some(WriteFault::Transient(0)) | None => {}
            Some(WriteFault::Transient(n)) => {
                *n -= 1;
                return Err(StoreError::Unavailable("injected write failure".into()));
            }
            Some(WriteFault::AlwaysTransient) => {
                return Err(StoreError::Unavailable("injected write failure".into()));
            }
            Some(WriteFault::Permanent) => {
                return Err(StoreError::Validation("injected constraint violation".into()));
            }
            Some(WriteFault::Exhausted) => {
                return Err(StoreError::ResourceExhausted("injected disk full".into()));
            }
        }
        drop(faults);

        self.results
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| result.clone());
        Ok(())
    }

    async fn existing_results(&self, ids: &[SourceId]) -> Result<HashSet<SourceId>, StoreError> {
        self.check_up()?;
        let results = self.results.lock().unwrap();
        Ok(ids
            .iter()
            .copied()
            .filter(|id| results.contains_key(id))
            .collect())
    }

    async fn mark_status(&self, id: SourceId, status: RecordStatus) -> Result<(), StoreError> {
        self.check_up()?;
        self.statuses.lock().unwrap().insert(id, status);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum Script {
    FailTimes(u32, ClassifierError),
    FailAlways(ClassifierError),
}

/// Classifier that answers `{"label": "label-<id>", "call": <n>}` unless a
/// script says otherwise. Can fire a cancellation token after N total calls.
#[derive(Default)]
pub struct ScriptedClassifier {
    scripts: Mutex<HashMap<SourceId, Script>>,
    calls: Mutex<HashMap<SourceId, u32>>,
    delays: Mutex<HashMap<SourceId, Duration>>,
    total: AtomicUsize,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, id: SourceId, script: Script) {
        self.scripts.lock().unwrap().insert(id, script);
    }

    /// Make every classification of `id` take `delay`.
    pub fn delay(&self, id: SourceId, delay: Duration) {
        self.delays.lock().unwrap().insert(id, delay);
    }

    pub fn cancel_after(&self, calls: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((calls, token));
    }

    pub fn calls(&self, id: SourceId) -> u32 {
        self.calls.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, record: &SourceRecord) -> Result<Value, ClassifierError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(record.id).or_default();
            *n += 1;
            *n
        };

        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if total >= *after {
                token.cancel();
            }
        }

        let delay = self.delays.lock().unwrap().get(&record.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&record.id) {
            Some(Script::FailTimes(0, _)) | None => {}
            Some(Script::FailTimes(n, err)) => {
                *n -= 1;
                return Err(err.clone());
            }
            Some(Script::FailAlways(err)) => return Err(err.clone()),
        }

        Ok(json!({"label": format!("label-{}", record.id), "call": call}))
    }
}
