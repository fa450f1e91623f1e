//! Crate-wide error taxonomy (spec.md §7).
//!
//! Every error-propagation path in the engine resolves to one of these
//! kinds. Retryable vs. fatal is a property of the kind, not a
//! stack-unwinding concern — callers match on the enum rather than
//! inspecting a string.

use crate::model::WorkflowId;
use crate::persistence::StoreError;

/// Submission rejected before any state is created.
#[derive(Debug, thiserror::Error)]
#[error("validation error: {0}")]
pub struct ValidationError(pub String);

/// Workflow fails before any Call runs; backend cleanup is still invoked.
#[derive(Debug, thiserror::Error)]
#[error("initialization error for workflow {workflow_id}: {message}")]
pub struct InitializationError {
    pub workflow_id: WorkflowId,
    pub message: String,
}

/// The three call-failure kinds from spec.md §4.E / §7.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Retried per §4.B; surfaced only if attempts are exhausted.
    #[error("transient call failure: {0}")]
    Transient(String),

    /// Retried per the preemption attempt budget; surfaced as a
    /// transient error once that budget is exhausted.
    #[error("preempted")]
    Preempted,

    /// Terminal: the Call is marked Failed immediately.
    #[error("fatal call failure: {0}")]
    Fatal(String),
}

impl CallError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Cache lookup/copy failures. These never propagate past the cache
/// module: callers downgrade them to a miss (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache lookup error: {0}")]
    Lookup(String),
    #[error("cache copy error: {0}")]
    Copy(String),
}

/// Fatal to the owning workflow: durable progress can no longer be guaranteed.
#[derive(Debug, thiserror::Error)]
#[error("persistence error: {0}")]
pub struct PersistenceError(pub String);

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        Self(e.to_string())
    }
}

/// Top-level error the supervisor (and any admin surface) deals in.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Initialization(#[from] InitializationError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] crate::io::IoError),
    #[error(transparent)]
    Backend(#[from] crate::backend::BackendError),
}
