//! Bounded exponential backoff with jitter.
//!
//! Every network-facing step of a job (object storage reads and writes,
//! database updates, outbound HTTP) is wrapped in a [`RetryPolicy`]. The wait
//! before retry `n` (zero-based) is
//! `min(base_delay * exponential_base^n, max_delay)`, scaled by a uniform
//! jitter factor in `[0.5, 1.0]` when jitter is enabled. After `max_retries`
//! retries the last error is returned to the caller.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Lower bound of the jitter factor applied to every backoff delay.
pub const JITTER_FLOOR: f64 = 0.5;

/// Tunable parameters for a retried operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Delay before the first retry, before jitter.
    pub base_delay: Duration,
    /// Upper bound on any single delay, before jitter.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub exponential_base: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// Storage client setup, dataset image downloads and studio status updates.
    pub const STANDARD: RetryPolicy = RetryPolicy::new(3, Duration::from_secs(1));

    /// Focus data download.
    pub const FOCUS_DATA: RetryPolicy = RetryPolicy::new(5, Duration::from_secs(2));

    /// Trained weights upload.
    pub const WEIGHTS_UPLOAD: RetryPolicy =
        RetryPolicy::new(5, Duration::from_secs(2)).with_max_delay(Duration::from_secs(120));

    /// Headshot row insert: three attempts waiting 1s then 2s.
    pub const RECORD_INSERT: RetryPolicy =
        RetryPolicy::new(2, Duration::from_secs(1)).without_jitter();

    /// Policy with the given retry budget and base delay; 60s cap, base 2, jitter on.
    pub const fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }

    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Total number of attempts this policy allows.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry `attempt` for a given jitter factor.
    ///
    /// The factor is clamped into `[0.5, 1.0]` and ignored when jitter is
    /// disabled.
    pub fn delay_for(&self, attempt: u32, jitter_factor: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64()).max(0.0);

        let scaled = if self.jitter {
            capped * jitter_factor.clamp(JITTER_FLOOR, 1.0)
        } else {
            capped
        };
        Duration::from_secs_f64(scaled)
    }

    /// Delay before retry `attempt` with a freshly drawn jitter factor.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = rand::rng().random_range(JITTER_FLOOR..=1.0);
        self.delay_for(attempt, factor)
    }

    /// Run `op`, retrying every error until the budget is exhausted.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_if(operation, op, |_| true).await
    }

    /// Run `op`, retrying only errors accepted by `is_retryable`.
    ///
    /// A rejected error is returned immediately without sleeping.
    pub async fn run_if<T, E, F, Fut, P>(
        &self,
        operation: &str,
        mut op: F,
        is_retryable: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0u32;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_retryable(&err) {
                tracing::warn!(
                    operation,
                    error = %err,
                    "Operation failed with a non-retryable error",
                );
                return Err(err);
            }

            if attempt >= self.max_retries {
                tracing::error!(
                    operation,
                    attempts = self.attempts(),
                    error = %err,
                    "Operation failed after all retry attempts",
                );
                return Err(err);
            }

            let delay = self.backoff(attempt);
            tracing::warn!(
                operation,
                attempt = attempt + 1,
                max_attempts = self.attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Operation failed, retrying",
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
