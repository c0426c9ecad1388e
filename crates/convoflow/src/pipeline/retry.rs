use std::future::Future;
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 2_000,
            max_ms: 60_000,
            jitter_pct: 0.10,
        }
    }
}

/// How many local attempts a call gets, and how long to wait between them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: RetryConfig,
}

impl RetryPolicy {
    /// One attempt, no waiting.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: RetryConfig {
                base_ms: 0,
                max_ms: 0,
                jitter_pct: 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, rate limits, temporary unavailability.
    Transient,
    /// Malformed input, validation, authentication.
    Permanent,
    /// Out of memory or disk. Halts the run.
    ResourceExhausted,
}

/// Implemented by every error the retry helper may see.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

pub fn next_delay(attempt_no: u32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    let attempt_no = attempt_no.max(1);

    // exponent = attempt_no - 1
    let exp = attempt_no.saturating_sub(1);

    // 2^exp; past 63 bits treat as huge and let the cap handle it
    let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);

    let delay = cfg.base_ms.saturating_mul(pow2).min(cfg.max_ms);

    // jitter in range [-jitter_pct, +jitter_pct]
    let jitter_range = (delay as f64) * cfg.jitter_pct;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    let jittered = (delay as f64 + jitter).round().max(0.0) as u64;
    Duration::from_millis(jittered.min(cfg.max_ms))
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts. The last error is returned unchanged.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Classify + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut rng = StdRng::from_entropy();
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                if err.class() != ErrorClass::Transient || attempt >= max_attempts {
                    return Err(err);
                }

                let delay = next_delay(attempt, &policy.backoff, &mut rng);
                tracing::debug!(
                    op = op_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
