//! In-memory [`PersistenceAdapter`] for tests and the local-engine path.
//!
//! Same `RwLock<HashMap<..>>` idiom as
//! `durable::persistence::memory::InMemoryWorkflowEventStore`, narrowed
//! to the workflow/call row shapes this spec defines.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::store::{ExecutionInfoWrite, PersistenceAdapter, StoreError, TransientPredicate};
use crate::call::{Call, CallStatus};
use crate::model::{CallKey, Workflow, WorkflowId, WorkflowStatus};

#[derive(Default)]
pub struct InMemoryPersistence {
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
    calls: RwLock<HashMap<CallKey, Call>>,
    execution_info: RwLock<Vec<ExecutionInfoWrite>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.workflows
            .write()
            .insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn update_workflow_status(
        &self,
        workflow_id: WorkflowId,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id.0))?;
        workflow.status = status;
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, StoreError> {
        self.workflows
            .read()
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(workflow_id.0))
    }

    async fn select_non_terminal_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        Ok(self
            .workflows
            .read()
            .values()
            .filter(|w| !w.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn insert_call(&self, call: &Call) -> Result<(), StoreError> {
        self.calls.write().insert(call.key.clone(), call.clone());
        Ok(())
    }

    async fn update_call(
        &self,
        call: &Call,
        execution_info: &[ExecutionInfoWrite],
    ) -> Result<(), StoreError> {
        let mut calls = self.calls.write();
        calls
            .get_mut(&call.key)
            .ok_or_else(|| StoreError::CallNotFound(call.key.to_string()))?;
        calls.insert(call.key.clone(), call.clone());
        drop(calls);
        self.execution_info
            .write()
            .extend(execution_info.iter().cloned());
        Ok(())
    }

    async fn select_calls_by_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<Call>, StoreError> {
        Ok(self
            .calls
            .read()
            .values()
            .filter(|c| c.key.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn select_non_terminal_calls(&self, workflow_id: WorkflowId) -> Result<Vec<Call>, StoreError> {
        Ok(self
            .calls
            .read()
            .values()
            .filter(|c| c.key.workflow_id == workflow_id && !c.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn reset_transient_executions(
        &self,
        workflow_id: WorkflowId,
        predicate: TransientPredicate,
    ) -> Result<Vec<CallKey>, StoreError> {
        let mut calls = self.calls.write();
        let mut reset = Vec::new();
        for call in calls.values_mut() {
            if call.key.workflow_id != workflow_id {
                continue;
            }
            let matches = match predicate {
                TransientPredicate::RunningWithoutExternalId => {
                    call.status == CallStatus::Running && call.external_id.is_none()
                }
                TransientPredicate::Starting => call.status == CallStatus::Starting,
            };
            if matches {
                call.status = CallStatus::NotStarted;
                reset.push(call.key.clone());
            }
        }
        Ok(reset)
    }

    async fn set_starting_status(
        &self,
        workflow_id: WorkflowId,
        call_keys: &[CallKey],
    ) -> Result<(), StoreError> {
        let mut calls = self.calls.write();
        for key in call_keys {
            if key.workflow_id != workflow_id {
                continue;
            }
            if let Some(call) = calls.get_mut(key) {
                call.status = CallStatus::Starting;
            }
        }
        Ok(())
    }
}
