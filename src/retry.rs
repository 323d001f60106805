//! Retry with exponential backoff and jitter.
//!
//! The manager is generic: which error kinds are worth retrying is decided
//! per call. The query executor is the component that restricts retries to
//! connection and timeout failures.

use crate::error::{ConfigError, DatabaseError, DbResult, ErrorKind};
use crate::logger::{ErrorLogger, Metadata};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 100;
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Backoff parameters. Built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Multiplier applied after each failed attempt (>= 1)
    pub backoff_factor: f64,
    /// Upper bound of the random extra fraction (0-1)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Total number of attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after `current`, given a uniform sample in `[0, 1)`.
    ///
    /// `min(current * backoff * (1 + sample * jitter), max_delay)` in whole
    /// milliseconds. The jitter multiplies onto the backed-off delay, so it
    /// compounds across attempts. Rounding never lands below
    /// `current * backoff`.
    pub fn next_delay(&self, current: Duration, sample: f64) -> Duration {
        let sample = sample.clamp(0.0, 1.0);
        let backed_off_ms = current.as_millis() as f64 * self.backoff_factor;
        let next_ms = (backed_off_ms * (1.0 + sample * self.jitter_factor))
            .round()
            .max(backed_off_ms.ceil());
        // `as` saturates, so an overflowing product lands on the cap
        Duration::from_millis(next_ms.min(self.max_delay_ms as f64) as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.backoff_factor >= 1.0 && self.backoff_factor.is_finite()) {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "backoff_factor must be >= 1 (got {})",
                self.backoff_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "jitter_factor must be between 0 and 1 (got {})",
                self.jitter_factor
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "initial_delay_ms ({}) cannot exceed max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Runs fallible async operations with bounded retries.
#[derive(Debug, Clone)]
pub struct RetryManager {
    policy: RetryPolicy,
    logger: Arc<ErrorLogger>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy, logger: Arc<ErrorLogger>) -> Self {
        Self { policy, logger }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget (`max_retries + 1`) is spent.
    ///
    /// An empty `retryable` list makes every error retryable.
    pub async fn execute<T, F, Fut>(
        &self,
        mut operation: F,
        retryable: &[ErrorKind],
        context: &Metadata,
    ) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut delay = self.policy.initial_delay();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let retry_allowed = is_retryable(&err, retryable);
            if attempt > self.policy.max_retries || !retry_allowed {
                let mut meta = context.clone();
                meta.insert("attempt".into(), attempt.into());
                meta.insert("retryable".into(), retry_allowed.into());
                self.logger.database_error(
                    format!("Operation failed permanently after {attempt} attempt(s)"),
                    &err,
                    meta,
                );
                return Err(err);
            }

            let mut meta = context.clone();
            meta.insert("attempt".into(), attempt.into());
            meta.insert(
                "remaining".into(),
                (self.policy.max_retries - attempt + 1).into(),
            );
            meta.insert("delay_ms".into(), (delay.as_millis() as u64).into());
            meta.insert("error".into(), err.to_string().into());
            self.logger.warn(
                format!(
                    "Operation failed, retrying ({attempt}/{})",
                    self.policy.max_retries
                ),
                meta,
            );

            tokio::time::sleep(delay).await;
            delay = self.policy.next_delay(delay, rand::random::<f64>());
        }
    }
}

fn is_retryable(err: &DatabaseError, retryable: &[ErrorKind]) -> bool {
    retryable.is_empty() || retryable.contains(&err.kind())
}
