//! Call State Machine (spec.md §4.E)
//!
//! One `Call` row tracks a single attempt at a single task invocation
//! (or scatter shard). Attempt numbers are strictly monotonic — a retry
//! is a new row, never a mutation of the prior one — matching the
//! teacher's event-sourced convention in `durable::workflow::event::WorkflowEvent`
//! (append, never rewrite) and the attempt bookkeeping in
//! `durable::activity::context::ActivityContext`.

mod policy;

pub use policy::{apply_return_code_policy, localize_inputs, CallOutcomeVerdict, ReturnCodePolicy};

use serde::{Deserialize, Serialize};

use crate::model::CallKey;
use crate::reliability::timeout::DeadlineConfig;

/// The Call state machine's states (spec.md §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    NotStarted,
    Starting,
    Running,
    Succeeded,
    Failed,
    Aborted,
    RetryableFailure,
    Preempted,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// States from which a new attempt (new `CallKey` row) can be spawned.
    pub fn schedules_new_attempt(self) -> bool {
        matches!(self, Self::RetryableFailure | Self::Preempted)
    }
}

/// One attempt at executing a task or scatter shard (spec.md §4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub key: CallKey,
    pub status: CallStatus,
    pub call_root: Option<String>,
    pub external_id: Option<String>,
    pub outputs: serde_json::Map<String, serde_json::Value>,
    pub execution_info: serde_json::Map<String, serde_json::Value>,
    pub detritus_paths: Vec<String>,
    pub preemptible: bool,
    pub memory_request_bytes: Option<u64>,
    pub deadline: DeadlineConfig,
    pub scheduled_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Call {
    pub fn new(key: CallKey, preemptible: bool) -> Self {
        Self {
            key,
            status: CallStatus::NotStarted,
            call_root: None,
            external_id: None,
            outputs: serde_json::Map::new(),
            execution_info: serde_json::Map::new(),
            detritus_paths: Vec::new(),
            preemptible,
            memory_request_bytes: None,
            deadline: DeadlineConfig::default(),
            scheduled_at: chrono::Utc::now(),
            started_at: None,
        }
    }

    fn transition(&mut self, to: CallStatus) -> Result<(), CallTransitionError> {
        use CallStatus::*;
        let allowed = matches!(
            (self.status, to),
            (NotStarted, Starting)
                | (NotStarted, Succeeded) // cache hit, via copyCacheHit
                | (Starting, Running)
                | (Starting, NotStarted) // transient submit error retries in place conceptually, but a fresh attempt re-enters here
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, RetryableFailure)
                | (Running, Preempted)
                | (Running, Aborted)
                | (Starting, Aborted)
        );
        if !allowed {
            return Err(CallTransitionError::Illegal {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn dispatch(&mut self, call_root: String) -> Result<(), CallTransitionError> {
        self.transition(CallStatus::Starting)?;
        self.call_root = Some(call_root);
        Ok(())
    }

    pub fn acknowledge_running(&mut self, external_id: Option<String>) -> Result<(), CallTransitionError> {
        self.transition(CallStatus::Running)?;
        self.external_id = external_id;
        self.started_at = Some(chrono::Utc::now());
        Ok(())
    }

    pub fn succeed(&mut self, outputs: serde_json::Map<String, serde_json::Value>) -> Result<(), CallTransitionError> {
        self.transition(CallStatus::Succeeded)?;
        self.outputs = outputs;
        if let Some(call_root) = &self.call_root {
            self.detritus_paths = conventional_detritus_paths(call_root);
        }
        Ok(())
    }

    /// Settle a call as a cache hit (spec.md §4.C). Unlike [`Call::succeed`]
    /// this never goes through [`Call::dispatch`], so `call_root` is set
    /// here from the backend's materialized location rather than carried
    /// over from an earlier transition.
    pub fn cache_hit(
        &mut self,
        call_root: String,
        outputs: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), CallTransitionError> {
        if self.status != CallStatus::NotStarted {
            return Err(CallTransitionError::Illegal {
                from: self.status,
                to: CallStatus::Succeeded,
            });
        }
        self.status = CallStatus::Succeeded;
        self.outputs = outputs;
        self.detritus_paths = conventional_detritus_paths(&call_root);
        self.call_root = Some(call_root);
        Ok(())
    }

    pub fn fail(&mut self) -> Result<(), CallTransitionError> {
        self.transition(CallStatus::Failed)
    }

    pub fn abort(&mut self) -> Result<(), CallTransitionError> {
        self.transition(CallStatus::Aborted)
    }

    /// Classify a backend poll failure into a terminal-for-this-attempt
    /// state, given whether the retry policy has attempts remaining
    /// (spec.md §4.E's three failure branches).
    ///
    /// `attempt_cap` bounds sustained preemption the same way the retry
    /// policy bounds ordinary retries (spec.md §8 Property 6): once
    /// `self.key.attempt` reaches it, a preempted attempt is terminal
    /// rather than scheduling yet another one.
    pub fn fail_attempt(
        &mut self,
        kind: crate::reliability::FailureKind,
        has_attempts_remaining: bool,
        preempted: bool,
        attempt_cap: u32,
    ) -> Result<(), CallTransitionError> {
        use crate::reliability::FailureKind;
        let next = match kind {
            FailureKind::Fatal => CallStatus::Failed,
            _ if preempted && self.key.attempt >= attempt_cap => CallStatus::Failed,
            _ if preempted => CallStatus::Preempted,
            _ if has_attempts_remaining => CallStatus::RetryableFailure,
            FailureKind::InfinitelyRetryable => CallStatus::RetryableFailure,
            FailureKind::BoundedRetryable => CallStatus::Failed,
        };
        self.transition(next)
    }

    /// Build the next attempt's Call row (spec.md §4.E: "each retry is a
    /// new Call row, not mutation of the prior row"). Applies the
    /// preemption-budget and memory-retry-multiplier policies.
    pub fn next_attempt(&self, preemption_budget: u32, memory_retry_multiplier: Option<f64>) -> Call {
        let mut next = Call::new(self.key.next_attempt(), self.preemptible);
        match self.status {
            CallStatus::Preempted => {
                // Clear preemptible once the per-task maximum P is reached.
                next.preemptible = self.key.attempt < preemption_budget;
            }
            CallStatus::RetryableFailure => {
                if let (Some(multiplier), Some(current)) =
                    (memory_retry_multiplier, self.memory_request_bytes)
                {
                    next.memory_request_bytes = Some((current as f64 * multiplier) as u64);
                } else {
                    next.memory_request_bytes = self.memory_request_bytes;
                }
            }
            _ => {}
        }
        next
    }

    /// Whether a retryable failure's message matches the OOM substring
    /// set (spec.md §4.E default: `OutOfMemory`, `Killed`).
    pub fn matches_oom_signature(message: &str, substrings: &[&str]) -> bool {
        substrings.iter().any(|s| message.contains(s))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallTransitionError {
    #[error("illegal call transition from {from:?} to {to:?}")]
    Illegal { from: CallStatus, to: CallStatus },
}

pub const DEFAULT_OOM_SUBSTRINGS: &[&str] = &["OutOfMemory", "Killed"];

/// Basenames a backend writes into every call root alongside its
/// declared outputs (spec.md §3's detritus set, §8 Property 5). The
/// call root itself is always the final entry so callers can locate it
/// without threading `Call::call_root` separately.
pub const CONVENTIONAL_DETRITUS_NAMES: &[&str] = &["script", "stdout", "stderr", "returnCode"];

/// Full paths of the conventional detritus files under `call_root`,
/// plus the call root itself.
pub fn conventional_detritus_paths(call_root: &str) -> Vec<String> {
    let mut paths: Vec<String> = CONVENTIONAL_DETRITUS_NAMES
        .iter()
        .map(|name| format!("{call_root}/{name}"))
        .collect();
    paths.push(call_root.to_string());
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkflowId;

    fn key() -> CallKey {
        CallKey::first_attempt(WorkflowId::new(), "my_task", None)
    }

    #[test]
    fn happy_path_transitions() {
        let mut call = Call::new(key(), false);
        call.dispatch("/tmp/call-root".into()).unwrap();
        assert_eq!(call.status, CallStatus::Starting);
        call.acknowledge_running(Some("ext-1".into())).unwrap();
        assert_eq!(call.status, CallStatus::Running);
        call.succeed(serde_json::Map::new()).unwrap();
        assert_eq!(call.status, CallStatus::Succeeded);
    }

    #[test]
    fn cache_hit_from_not_started_goes_straight_to_succeeded() {
        let mut call = Call::new(key(), false);
        call.cache_hit("/tmp/call-root".into(), serde_json::Map::new()).unwrap();
        assert_eq!(call.status, CallStatus::Succeeded);
        assert_eq!(call.call_root.as_deref(), Some("/tmp/call-root"));
        assert_eq!(call.detritus_paths.len(), CONVENTIONAL_DETRITUS_NAMES.len() + 1);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut call = Call::new(key(), false);
        let err = call.succeed(serde_json::Map::new());
        assert!(matches!(err, Err(CallTransitionError::Illegal { .. })));
    }

    #[test]
    fn preemption_clears_preemptible_once_budget_reached() {
        let mut call = Call::new(key(), true);
        call.dispatch("/tmp".into()).unwrap();
        call.acknowledge_running(None).unwrap();
        call.fail_attempt(crate::reliability::FailureKind::BoundedRetryable, true, true, 5)
            .unwrap();
        assert_eq!(call.status, CallStatus::Preempted);

        let next = call.next_attempt(1, None);
        assert!(!next.preemptible, "budget of 1 should be exhausted at attempt 1");
    }

    #[test]
    fn memory_retry_multiplier_applies_to_next_attempt() {
        let mut call = Call::new(key(), false);
        call.memory_request_bytes = Some(1024);
        call.dispatch("/tmp".into()).unwrap();
        call.acknowledge_running(None).unwrap();
        call.fail_attempt(crate::reliability::FailureKind::BoundedRetryable, true, false, 5)
            .unwrap();
        assert_eq!(call.status, CallStatus::RetryableFailure);

        let next = call.next_attempt(0, Some(2.0));
        assert_eq!(next.memory_request_bytes, Some(2048));
    }

    #[test]
    fn sustained_preemption_past_attempt_cap_fails_the_call() {
        let mut call = Call::new(CallKey::first_attempt(WorkflowId::new(), "my_task", None).next_attempt().next_attempt(), true);
        call.dispatch("/tmp".into()).unwrap();
        call.acknowledge_running(None).unwrap();
        call.fail_attempt(crate::reliability::FailureKind::BoundedRetryable, true, true, 2)
            .unwrap();
        assert_eq!(call.status, CallStatus::Failed, "attempt 3 against a cap of 2 must terminate, not retry again");
    }

    #[test]
    fn oom_signature_matching() {
        assert!(Call::matches_oom_signature(
            "container killed: OutOfMemory",
            DEFAULT_OOM_SUBSTRINGS
        ));
        assert!(!Call::matches_oom_signature("disk full", DEFAULT_OOM_SUBSTRINGS));
    }
}
