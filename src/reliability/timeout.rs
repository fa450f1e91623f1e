//! Per-call deadlines (spec.md §5)
//!
//! "Each backend call carries a deadline; on deadline the attempt is
//! classified as bounded-retryable I/O." [`DeadlineTracker`] answers the
//! question "has this call's deadline passed, and which one" — classification
//! into a [`super::retry::FailureKind`] happens one layer up, in `call`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which deadline a call is being checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    /// Call waited too long between being scheduled and actually starting.
    ScheduleToStart,
    /// Call ran too long without reaching a terminal poll outcome.
    StartToClose,
    /// No heartbeat received in time (long-running calls only).
    Heartbeat,
}

/// The result of checking a call against its configured deadlines.
#[derive(Debug, Clone)]
pub struct DeadlineOutcome {
    pub kind: DeadlineKind,
    pub elapsed: Duration,
    pub limit: Duration,
}

impl std::fmt::Display for DeadlineOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.kind {
            DeadlineKind::ScheduleToStart => "schedule-to-start",
            DeadlineKind::StartToClose => "start-to-close",
            DeadlineKind::Heartbeat => "heartbeat",
        };
        write!(
            f,
            "{label} deadline exceeded (elapsed {:?}, limit {:?})",
            self.elapsed, self.limit
        )
    }
}

/// Deadline configuration for a call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadlineConfig {
    /// Maximum time from scheduling to start of execution.
    #[serde(with = "duration_millis")]
    pub schedule_to_start: Duration,

    /// Maximum time from start to a terminal poll outcome.
    #[serde(with = "duration_millis")]
    pub start_to_close: Duration,

    /// Maximum time between heartbeats (`None` = not required).
    #[serde(with = "option_duration_millis")]
    pub heartbeat: Option<Duration>,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            schedule_to_start: Duration::from_secs(60),
            start_to_close: Duration::from_secs(300),
            heartbeat: None,
        }
    }
}

impl DeadlineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schedule_to_start(mut self, timeout: Duration) -> Self {
        self.schedule_to_start = timeout;
        self
    }

    pub fn with_start_to_close(mut self, timeout: Duration) -> Self {
        self.start_to_close = timeout;
        self
    }

    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat = Some(timeout);
        self
    }

    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = None;
        self
    }
}

/// Timing facts about one call's attempt, as tracked by the persistence
/// layer (spec.md §4.H's execution-info map).
#[derive(Debug, Clone)]
pub struct CallTiming {
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub deadline: DeadlineConfig,
}

/// Stateless deadline checks. Carries no store handle — the caller
/// (`call::CallRunner`) owns what happens once a deadline trips.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlineTracker;

impl DeadlineTracker {
    pub fn new() -> Self {
        Self
    }

    pub fn check_schedule_to_start(
        &self,
        scheduled_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        config: &DeadlineConfig,
    ) -> Option<DeadlineOutcome> {
        if started_at.is_some() {
            return None;
        }
        let elapsed = Utc::now()
            .signed_duration_since(scheduled_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        (elapsed > config.schedule_to_start).then_some(DeadlineOutcome {
            kind: DeadlineKind::ScheduleToStart,
            elapsed,
            limit: config.schedule_to_start,
        })
    }

    pub fn check_start_to_close(
        &self,
        started_at: Option<DateTime<Utc>>,
        config: &DeadlineConfig,
    ) -> Option<DeadlineOutcome> {
        let started = started_at?;
        let elapsed = Utc::now()
            .signed_duration_since(started)
            .to_std()
            .unwrap_or(Duration::ZERO);
        (elapsed > config.start_to_close).then_some(DeadlineOutcome {
            kind: DeadlineKind::StartToClose,
            elapsed,
            limit: config.start_to_close,
        })
    }

    pub fn check_heartbeat(
        &self,
        started_at: Option<DateTime<Utc>>,
        last_heartbeat_at: Option<DateTime<Utc>>,
        config: &DeadlineConfig,
    ) -> Option<DeadlineOutcome> {
        let heartbeat_timeout = config.heartbeat?;
        started_at?;
        let last_beat = last_heartbeat_at.or(started_at)?;
        let elapsed = Utc::now()
            .signed_duration_since(last_beat)
            .to_std()
            .unwrap_or(Duration::ZERO);
        (elapsed > heartbeat_timeout).then_some(DeadlineOutcome {
            kind: DeadlineKind::Heartbeat,
            elapsed,
            limit: heartbeat_timeout,
        })
    }

    /// Check all deadline conditions for a call, in priority order:
    /// schedule-to-start, heartbeat, start-to-close.
    pub fn check(&self, timing: &CallTiming) -> Option<DeadlineOutcome> {
        self.check_schedule_to_start(timing.scheduled_at, timing.started_at, &timing.deadline)
            .or_else(|| {
                self.check_heartbeat(
                    timing.started_at,
                    timing.last_heartbeat_at,
                    &timing.deadline,
                )
            })
            .or_else(|| self.check_start_to_close(timing.started_at, &timing.deadline))
    }

    pub fn remaining_time(&self, started_at: DateTime<Utc>, timeout: Duration) -> Option<Duration> {
        let elapsed = Utc::now()
            .signed_duration_since(started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        timeout.checked_sub(elapsed)
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

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
