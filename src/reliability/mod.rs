//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] / [`FailureKind`] — the fatal/bounded/infinite
//!   classification and backoff curve from spec.md §4.B
//! - [`CircuitBreakerConfig`] - ambient protection for backend dispatch
//! - [`DeadlineConfig`] - per-call schedule-to-start / start-to-close / heartbeat deadlines (spec.md §5)

pub mod circuit_breaker;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{FailureKind, RetryPolicy};
pub use timeout::{DeadlineConfig, DeadlineOutcome, DeadlineTracker};
