//! Persistence Adapter contract (spec.md §4.H)
//!
//! Row-oriented over three tables: `workflow`, `call`, `execution_info`.
//! Grounded on `durable::persistence::store::WorkflowEventStore` — same
//! async-trait-over-a-dedicated-error-enum shape — narrowed to the
//! primitives spec.md actually names, plus the two atomic batch ops it
//! requires for restart (`reset_transient_executions`, `set_starting_status`).

use async_trait::async_trait;
use uuid::Uuid;

use crate::call::Call;
use crate::model::{CallKey, Workflow, WorkflowId, WorkflowStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),
    #[error("call not found: {0}")]
    CallNotFound(String),
    #[error("concurrency conflict on {0}")]
    ConcurrencyConflict(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A single key path write in the execution-info side table (spec.md
/// §4.H: "appends/updates its execution_info rows").
#[derive(Debug, Clone)]
pub struct ExecutionInfoWrite {
    pub call_key: CallKey,
    pub key_path: String,
    pub value: serde_json::Value,
}

/// Predicate describing which Calls a restart should reset, expressed
/// structurally rather than as a closure so a SQL-backed implementation
/// can translate it directly into a `WHERE` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientPredicate {
    /// `Running` calls with no recorded external id.
    RunningWithoutExternalId,
    /// `Starting` calls.
    Starting,
}

/// The Persistence Adapter contract (spec.md §4.H). Every state
/// transition of a Call is a single transaction that updates the Call
/// row and its execution_info rows together; callers emit metadata
/// events only after the transaction returned by these methods commits.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync + 'static {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    async fn update_workflow_status(
        &self,
        workflow_id: WorkflowId,
        status: WorkflowStatus,
    ) -> Result<(), StoreError>;

    async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, StoreError>;

    /// Non-terminal workflows, loaded on engine start to drive restart
    /// (spec.md §4.G).
    async fn select_non_terminal_workflows(&self) -> Result<Vec<Workflow>, StoreError>;

    async fn insert_call(&self, call: &Call) -> Result<(), StoreError>;

    /// Update a call by its primary key (`CallKey`), together with any
    /// execution_info rows the transition produced.
    async fn update_call(
        &self,
        call: &Call,
        execution_info: &[ExecutionInfoWrite],
    ) -> Result<(), StoreError>;

    async fn select_calls_by_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<Call>, StoreError>;

    /// Calls not yet `Succeeded` for a workflow — the restart-candidate set.
    async fn select_non_terminal_calls(&self, workflow_id: WorkflowId) -> Result<Vec<Call>, StoreError>;

    /// Atomic batch reset of every call matching `predicate` within the
    /// workflow back to `NotStarted` (spec.md §4.H).
    async fn reset_transient_executions(
        &self,
        workflow_id: WorkflowId,
        predicate: TransientPredicate,
    ) -> Result<Vec<CallKey>, StoreError>;

    /// Atomic batch transition of the given calls to `Starting` — used
    /// when dispatching a batch of ready nodes so a crash between
    /// dispatch and the first execute() can't leave a call invisible to
    /// restart's recovery pass (spec.md §4.H).
    async fn set_starting_status(
        &self,
        workflow_id: WorkflowId,
        call_keys: &[CallKey],
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_predicate_variants_are_distinct() {
        assert_ne!(
            TransientPredicate::RunningWithoutExternalId,
            TransientPredicate::Starting
        );
    }
}
