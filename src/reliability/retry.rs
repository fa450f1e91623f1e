//! Retry policy implementation (spec.md §4.B)
//!
//! Classifies a failure into one of three kinds and drives exponential
//! backoff for the two retryable kinds. The taxonomy is fixed;
//! classification of a *specific* failure into a kind is pluggable.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// The fixed three-way failure taxonomy (spec.md §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No retry.
    Fatal,
    /// Retry up to `max_attempts`, exponential backoff.
    BoundedRetryable,
    /// Retry forever with the same curve (quota-class failures, e.g.
    /// remote rate limiting).
    InfinitelyRetryable,
}

/// Configuration for retries.
///
/// Defaults match spec.md §4.B: N=5, I=5s, M=10s, μ=1.1.
///
/// # Example
///
/// ```
/// use dagrunner_engine::reliability::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(5))
///     .with_max_interval(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial). Ignored for
    /// `InfinitelyRetryable` failures.
    pub max_attempts: u32,

    /// Initial delay before first retry.
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries.
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier.
    pub multiplier: f64,

    /// Jitter factor (0.0-1.0) to add randomness and avoid thundering herd.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(10),
            multiplier: 1.1,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// The engine's default poll-backoff curve is independent per
    /// backend (spec.md §4.D): initial 20s, max 10min, μ=1.1, unbounded.
    pub fn poll_backoff() -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_interval: Duration::from_secs(20),
            max_interval: Duration::from_secs(10 * 60),
            multiplier: 1.1,
            jitter: 0.1,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the given attempt number (1-based). Attempt 1 never
    /// waits; attempt N waits `initial * multiplier^(N-2)`, capped at `max`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = attempt - 1;
        let base =
            self.initial_interval.as_secs_f64() * self.multiplier.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let offset = rng.gen_range(-jitter_range..=jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32, kind: FailureKind) -> bool {
        match kind {
            FailureKind::Fatal => false,
            FailureKind::InfinitelyRetryable => true,
            FailureKind::BoundedRetryable => current_attempt < self.max_attempts,
        }
    }

    /// Sleep for the backoff duration of `attempt`, observing
    /// cancellation (spec.md §4.B: "retry loops must be cancellable; on
    /// cancellation, the current sleep ends and no further attempt
    /// begins"). Returns `false` if cancelled mid-sleep.
    pub async fn sleep_for_attempt(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        let delay = self.delay_for_attempt(attempt);
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !cancel.is_cancelled(),
            _ = cancel.cancelled() => false,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
