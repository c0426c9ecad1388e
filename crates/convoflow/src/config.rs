use std::path::PathBuf;
use std::time::Duration;

use crate::logging::LogFormat;
use crate::pipeline::retry::{RetryConfig, RetryPolicy};

/// How the orchestrator behaves once the pager runs dry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Process one batch (after resuming anything pending), then exit.
    Single,
    /// Drain the source until `has_more == false`, then exit. Also used for
    /// cron-style scheduled invocations.
    Batch,
    /// Sleep `interval` and fetch again, forever (until stopped).
    Polling { interval: Duration },
}

impl RunMode {
    pub fn parse(mode: &str, poll_interval: Duration) -> anyhow::Result<Self> {
        match mode.trim().to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "batch" | "scheduled" | "oneshot" | "one-shot" => Ok(Self::Batch),
            "polling" | "continuous" => Ok(Self::Polling {
                interval: poll_interval,
            }),
            other => anyhow::bail!("unknown run mode: {other}"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Batch => "batch",
            Self::Polling { .. } => "polling",
        }
    }
}

/// Everything the pipeline core consumes. Built from [`Config`] in the
/// worker, or directly in tests.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub batch_dir: PathBuf,
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub retry_ceiling: u32,

    /// Local retry policy for a single classify call before queueing.
    pub classifier_retry: RetryPolicy,
    /// Local retry policy for writes and page fetches.
    pub store_retry: RetryPolicy,

    pub classify_timeout: Duration,
    pub write_timeout: Duration,
    /// Page fetches and result-existence lookups.
    pub read_timeout: Duration,
    pub acquire_timeout: Duration,

    pub checkpoint_interval: u64,
    pub mode: RunMode,
    pub max_step_failures: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_dir: PathBuf::from("batch_files"),
            batch_size: 10,
            max_concurrent: 5,
            retry_ceiling: 3,
            classifier_retry: RetryPolicy {
                max_attempts: 3,
                backoff: RetryConfig {
                    base_ms: 2_000,
                    ..RetryConfig::default()
                },
            },
            store_retry: RetryPolicy {
                max_attempts: 3,
                backoff: RetryConfig {
                    base_ms: 1_000,
                    ..RetryConfig::default()
                },
            },
            classify_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(600),
            checkpoint_interval: 50,
            mode: RunMode::Batch,
            max_step_failures: 5,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: Option<u32>,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub ollama_endpoint: String,
    pub ollama_model: String,
    pub log_format: LogFormat,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let ollama_model = env_or_fallback("CONVOFLOW_OLLAMA_MODEL", "OLLAMA_MODEL")
            .ok_or_else(|| anyhow::anyhow!("OLLAMA_MODEL is missing"))?;
        let ollama_endpoint = env_or_fallback("CONVOFLOW_OLLAMA_ENDPOINT", "OLLAMA_ENDPOINT")
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        let defaults = PipelineConfig::default();

        let batch_dir = env_or_fallback("CONVOFLOW_BATCH_DIR", "BATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.batch_dir);

        let batch_size = env_parse("CONVOFLOW_BATCH_SIZE", "BATCH_SIZE")
            .unwrap_or(defaults.batch_size)
            .clamp(1, 10_000);

        let max_concurrent = env_parse("CONVOFLOW_MAX_CONCURRENT", "MAX_CONCURRENT")
            .unwrap_or(defaults.max_concurrent)
            .clamp(1, 64);

        let retry_ceiling = env_parse("CONVOFLOW_RETRY_CEILING", "MAX_RETRIES")
            .unwrap_or(defaults.retry_ceiling);

        let backoff_max_ms = env_parse("CONVOFLOW_BACKOFF_MAX_MS", "BACKOFF_MAX_MS")
            .unwrap_or(RetryConfig::default().max_ms);
        let jitter_pct = env_parse::<f64>("CONVOFLOW_BACKOFF_JITTER", "BACKOFF_JITTER")
            .unwrap_or(RetryConfig::default().jitter_pct)
            .clamp(0.0, 1.0);

        let classifier_retry = RetryPolicy {
            max_attempts: env_parse("CONVOFLOW_CLASSIFIER_ATTEMPTS", "CLASSIFIER_ATTEMPTS")
                .unwrap_or(defaults.classifier_retry.max_attempts)
                .max(1),
            backoff: RetryConfig {
                base_ms: env_parse("CONVOFLOW_CLASSIFIER_BACKOFF_MS", "CLASSIFIER_BACKOFF_MS")
                    .unwrap_or(defaults.classifier_retry.backoff.base_ms),
                max_ms: backoff_max_ms,
                jitter_pct,
            },
        };

        let store_retry = RetryPolicy {
            max_attempts: env_parse("CONVOFLOW_STORE_ATTEMPTS", "STORE_ATTEMPTS")
                .unwrap_or(defaults.store_retry.max_attempts)
                .max(1),
            backoff: RetryConfig {
                base_ms: env_parse("CONVOFLOW_STORE_BACKOFF_MS", "STORE_BACKOFF_MS")
                    .unwrap_or(defaults.store_retry.backoff.base_ms),
                max_ms: backoff_max_ms,
                jitter_pct,
            },
        };

        let classify_timeout = env_secs("CONVOFLOW_CLASSIFY_TIMEOUT_SECS", "CLASSIFY_TIMEOUT_SECS")
            .unwrap_or(defaults.classify_timeout);
        let write_timeout = env_secs("CONVOFLOW_WRITE_TIMEOUT_SECS", "WRITE_TIMEOUT_SECS")
            .unwrap_or(defaults.write_timeout);
        let read_timeout = env_secs("CONVOFLOW_READ_TIMEOUT_SECS", "READ_TIMEOUT_SECS")
            .unwrap_or(defaults.read_timeout);
        let acquire_timeout = env_secs("CONVOFLOW_ACQUIRE_TIMEOUT_SECS", "ACQUIRE_TIMEOUT_SECS")
            .unwrap_or(defaults.acquire_timeout);

        let checkpoint_interval =
            env_parse("CONVOFLOW_CHECKPOINT_INTERVAL", "CHECKPOINT_INTERVAL")
                .unwrap_or(defaults.checkpoint_interval)
                .max(1);

        let poll_interval = env_secs("CONVOFLOW_POLL_INTERVAL_SECS", "POLL_INTERVAL_SECS")
            .unwrap_or(Duration::from_secs(60));
        let mode = match env_or_fallback("CONVOFLOW_MODE", "MODE") {
            Some(m) => RunMode::parse(&m, poll_interval)?,
            None => defaults.mode,
        };

        let max_step_failures = env_parse("CONVOFLOW_MAX_STEP_FAILURES", "MAX_STEP_FAILURES")
            .unwrap_or(defaults.max_step_failures)
            .max(1);

        let db_max_connections =
            env_parse("CONVOFLOW_DB_MAX_CONNECTIONS", "DB_MAX_CONNECTIONS");

        let admin_addr = env_or_fallback("CONVOFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("CONVOFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let log_format = env_or_fallback("CONVOFLOW_LOG_FORMAT", "LOG_FORMAT")
            .map(|s| LogFormat::parse(&s))
            .unwrap_or_default();

        Ok(Self {
            database_url,
            db_max_connections,
            admin_addr,
            migrate_on_startup,
            ollama_endpoint,
            ollama_model,
            log_format,
            pipeline: PipelineConfig {
                batch_dir,
                batch_size,
                max_concurrent,
                retry_ceiling,
                classifier_retry,
                store_retry,
                classify_timeout,
                write_timeout,
                read_timeout,
                acquire_timeout,
                checkpoint_interval,
                mode,
                max_step_failures,
            },
        })
    }

    /// Pool size: explicit override, else room for every slot to write while
    /// page reads still get a connection.
    pub fn pool_size(&self) -> u32 {
        let floor = (self.pipeline.max_concurrent as u32).saturating_mul(2).max(4);
        self.db_max_connections.unwrap_or(floor).clamp(1, 128)
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(primary: &str, fallback: &str) -> Option<T> {
    env_or_fallback(primary, fallback).and_then(|s| s.trim().parse().ok())
}

fn env_secs(primary: &str, fallback: &str) -> Option<Duration> {
    env_parse::<u64>(primary, fallback).map(Duration::from_secs)
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
