//! Circuit breaker: ambient protection for backend dispatch
//!
//! Not named by spec.md directly, but it is the teacher's standard way
//! of shielding an external collaborator (here, `BackendContract::execute`
//! / `poll`) from cascading failure — orthogonal to [`super::retry::RetryPolicy`],
//! which governs a single call's attempts rather than the health of the
//! backend as a whole.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if service recovered - limited calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// Circuit breakers protect external services from cascading failures.
/// When failures exceed a threshold, the circuit "opens" and requests
/// fail fast without calling the service.
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                 └──────────┘
///      ▲                                                            │
///      │                                                            │
///      │              success threshold                             │
///      └────────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use dagrunner_engine::reliability::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_reset_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of failures required to open the circuit
    pub failure_threshold: u32,

    /// Number of successes required to close the circuit (in half-open state)
    pub success_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,

    /// Sliding window size for failure counting
    #[serde(with = "duration_millis")]
    pub window_size: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            window_size: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold to close the circuit
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the reset timeout (time before trying again after opening)
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the sliding window size for failure counting
    pub fn with_window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("circuit breaker is open")]
    Open,
}

struct Inner {
    state: CircuitState,
    opened_at: Option<DateTime<Utc>>,
}

/// A single-process circuit breaker guarding calls to one backend.
///
/// Wraps [`crate::backend::BackendContract::execute`] / `poll` dispatch:
/// callers check [`CircuitBreaker::allow`] before issuing a call and feed
/// the outcome back via `record_success`/`record_failure`.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
            }),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    /// Whether a call is currently allowed through. `Open` transitions to
    /// `HalfOpen` once `reset_timeout` has elapsed, admitting one probe.
    pub fn allow(&self) -> Result<(), CircuitBreakerError> {
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| {
                        Utc::now()
                            .signed_duration_since(at)
                            .to_std()
                            .unwrap_or(Duration::ZERO)
                    })
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    self.success_count.store(0, Ordering::SeqCst);
                    Ok(())
                } else {
                    Err(CircuitBreakerError::Open)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    self.failure_count.store(0, Ordering::SeqCst);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Utc::now());
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Utc::now());
                self.success_count.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }
}

/// Serde support for Duration as milliseconds
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(10)
            .with_success_threshold(3)
            .with_reset_timeout(Duration::from_secs(60));

        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.success_threshold, 3);
        assert_eq!(config.reset_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    fn test_serialization() {
        let config = CircuitBreakerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CircuitBreakerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default().with_failure_threshold(3));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow().is_err());
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_reset_timeout(Duration::ZERO),
        );
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.allow().unwrap(); // transitions to half-open, reset_timeout already elapsed
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_success_threshold(2)
                .with_reset_timeout(Duration::ZERO),
        );
        breaker.record_failure();
        breaker.allow().unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
