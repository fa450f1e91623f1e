//! Backend Contract (spec.md §4.D)
//!
//! Every execution engine behind the Call state machine — a local
//! shell, a container-batch service, a cloud pipelines API — implements
//! this one trait. Shaped after `durable::activity::definition::Activity`
//! (async, `Send + Sync`, one trait per collaborator) but generalized
//! from "run one typed function" to the full dispatch/poll/resume/abort
//! lifecycle spec.md requires.

mod local;

pub use local::LocalShellBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::{HitStrategy, PriorResult};
use crate::model::{CallKey, Workflow};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("option validation failed: {0:?}")]
    InvalidOptions(Vec<String>),
    #[error("workflow initialization failed: {0}")]
    Initialization(String),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
    #[error("poll failed: {0}")]
    Poll(String),
    #[error("io error: {0}")]
    Io(#[from] crate::io::IoError),
}

/// Opaque, backend-specific data produced by `initialize_workflow` and
/// threaded through every later call for that workflow (e.g. a prepared
/// credential file).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitData(pub serde_json::Value);

/// A Call after `prepare_call` has resolved its runtime attributes and
/// assigned a call root (spec.md §4.D).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundCall {
    pub call_key: CallKey,
    pub call_root: String,
    pub command: String,
    /// `remotePath -> (localPath, containerMount)`, as rewritten by the backend.
    pub input_mapping: std::collections::BTreeMap<String, (String, Option<String>)>,
    pub runtime_attributes: serde_json::Map<String, serde_json::Value>,
}

/// An opaque, backend-specific handle to a dispatched call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionHandle(pub serde_json::Value);

/// The numeric return code policy inputs (spec.md §4.E): backend reports
/// the raw return code; `call` applies `continueOnReturnCode`/`failOnStderr`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOutcomeDetail {
    pub return_code: Option<i32>,
    pub stderr_size: u64,
    pub outputs: serde_json::Map<String, serde_json::Value>,
    pub events: Vec<String>,
}

/// Result of a `poll` (spec.md §4.D). `StillRunning` carries a possibly
/// new opaque handle (some backends rotate tokens on each poll).
#[derive(Debug, Clone)]
pub enum PollOutcome {
    StillRunning(ExecutionHandle),
    Succeeded(CallOutcomeDetail),
    Failed {
        detail: CallOutcomeDetail,
        error_code: String,
        message: String,
        retryability_hint: RetryabilityHint,
    },
    Aborted,
}

/// What the backend believes about retryability of a failure — `call`
/// still makes the final [`crate::reliability::FailureKind`] classification,
/// but the backend's hint is the primary input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryabilityHint {
    NonRetryable,
    Retryable,
    Preempted,
}

/// The Backend Contract (spec.md §4.D). Every method is async and may
/// suspend; `poll` is called repeatedly on the backend's own backoff
/// schedule ([`crate::reliability::RetryPolicy::poll_backoff`]).
#[async_trait]
pub trait BackendContract: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn validate_options(
        &self,
        options: &crate::model::WorkflowOptions,
    ) -> Result<(), BackendError>;

    async fn initialize_workflow(&self, workflow: &Workflow) -> Result<InitData, BackendError>;

    async fn prepare_call(
        &self,
        call_key: &CallKey,
        init_data: &InitData,
    ) -> Result<BoundCall, BackendError>;

    async fn execute(&self, bound: &BoundCall) -> Result<ExecutionHandle, BackendError>;

    /// Resume a call that survived an engine restart with a recorded
    /// external id (spec.md §4.G restart rule). Backends that can't
    /// resume return `Err` and the caller falls back to a fresh attempt.
    async fn resume(
        &self,
        bound: &BoundCall,
        resume_token: &str,
    ) -> Result<ExecutionHandle, BackendError>;

    async fn poll(&self, handle: &ExecutionHandle) -> Result<PollOutcome, BackendError>;

    async fn abort(&self, handle: &ExecutionHandle) -> Result<(), BackendError>;

    async fn copy_cache_hit(
        &self,
        bound: &BoundCall,
        prior: &PriorResult,
        strategy: HitStrategy,
    ) -> Result<serde_json::Map<String, serde_json::Value>, BackendError>;

    async fn cleanup_workflow(
        &self,
        workflow: &Workflow,
        init_data: &InitData,
    ) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_hint_variants_are_distinct() {
        assert_ne!(RetryabilityHint::NonRetryable, RetryabilityHint::Retryable);
        assert_ne!(RetryabilityHint::Retryable, RetryabilityHint::Preempted);
    }
}
