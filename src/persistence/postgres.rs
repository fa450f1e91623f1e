//! PostgreSQL implementation of [`PersistenceAdapter`] (spec.md §4.H, §4.I)
//!
//! Three tables, row-oriented, no event log: `workflow`, `call`,
//! `execution_info`. Every Call transition is one transaction that
//! updates the call row together with whatever execution_info rows the
//! transition produced — same connection-pool-plus-`#[instrument]`
//! idiom as `durable::persistence::postgres::PostgresWorkflowEventStore`,
//! narrowed to this spec's primitives.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::store::{ExecutionInfoWrite, PersistenceAdapter, StoreError, TransientPredicate};
use crate::call::{Call, CallStatus};
use crate::model::{CallKey, Workflow, WorkflowId, WorkflowOptions, WorkflowStatus};

/// PostgreSQL-backed [`PersistenceAdapter`].
///
/// ```ignore
/// use dagrunner_engine::persistence::PostgresPersistence;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/dagrunner").await?;
/// let store = PostgresPersistence::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn call_status_str(status: CallStatus) -> &'static str {
    match status {
        CallStatus::NotStarted => "not_started",
        CallStatus::Starting => "starting",
        CallStatus::Running => "running",
        CallStatus::Succeeded => "succeeded",
        CallStatus::Failed => "failed",
        CallStatus::Aborted => "aborted",
        CallStatus::RetryableFailure => "retryable_failure",
        CallStatus::Preempted => "preempted",
    }
}

fn parse_call_status(s: &str) -> Result<CallStatus, StoreError> {
    Ok(match s {
        "not_started" => CallStatus::NotStarted,
        "starting" => CallStatus::Starting,
        "running" => CallStatus::Running,
        "succeeded" => CallStatus::Succeeded,
        "failed" => CallStatus::Failed,
        "aborted" => CallStatus::Aborted,
        "retryable_failure" => CallStatus::RetryableFailure,
        "preempted" => CallStatus::Preempted,
        other => return Err(StoreError::Database(format!("unknown call status: {other}"))),
    })
}

fn workflow_status_str(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Submitted => "submitted",
        WorkflowStatus::Running => "running",
        WorkflowStatus::Succeeded => "succeeded",
        WorkflowStatus::Failed => "failed",
        WorkflowStatus::Aborted => "aborted",
    }
}

fn parse_workflow_status(s: &str) -> Result<WorkflowStatus, StoreError> {
    Ok(match s {
        "submitted" => WorkflowStatus::Submitted,
        "running" => WorkflowStatus::Running,
        "succeeded" => WorkflowStatus::Succeeded,
        "failed" => WorkflowStatus::Failed,
        "aborted" => WorkflowStatus::Aborted,
        other => return Err(StoreError::Database(format!("unknown workflow status: {other}"))),
    })
}

fn row_to_workflow(row: &sqlx::postgres::PgRow) -> Result<Workflow, StoreError> {
    let status_str: String = row.get("status");
    let options_json: serde_json::Value = row.get("options");
    let labels_json: serde_json::Value = row.get("labels");
    Ok(Workflow {
        id: WorkflowId(row.get("id")),
        source_reference: row.get("source_reference"),
        inputs: row.get("inputs"),
        options: WorkflowOptions(
            options_json
                .as_object()
                .cloned()
                .unwrap_or_default(),
        ),
        labels: serde_json::from_value(labels_json).unwrap_or_default(),
        import_bundle: row.get("import_bundle"),
        root_output_location: row.get("root_output_location"),
        backend_name: row.get("backend_name"),
        status: parse_workflow_status(&status_str)?,
    })
}

fn row_to_call(row: &sqlx::postgres::PgRow) -> Result<Call, StoreError> {
    let status_str: String = row.get("status");
    let shard: Option<i64> = row.get("shard");
    let outputs_json: serde_json::Value = row.get("outputs");
    let execution_info_json: serde_json::Value = row.get("execution_info");
    let deadline_json: serde_json::Value = row.get("deadline");
    let detritus_json: serde_json::Value = row.get("detritus_paths");

    Ok(Call {
        key: CallKey {
            workflow_id: WorkflowId(row.get("workflow_id")),
            task_name: row.get("task_name"),
            shard: shard.map(|s| s as u32),
            attempt: row.get::<i32, _>("attempt") as u32,
        },
        status: parse_call_status(&status_str)?,
        call_root: row.get("call_root"),
        external_id: row.get("external_id"),
        outputs: outputs_json.as_object().cloned().unwrap_or_default(),
        execution_info: execution_info_json.as_object().cloned().unwrap_or_default(),
        detritus_paths: serde_json::from_value(detritus_json).unwrap_or_default(),
        preemptible: row.get("preemptible"),
        memory_request_bytes: row
            .get::<Option<i64>, _>("memory_request_bytes")
            .map(|b| b as u64),
        deadline: serde_json::from_value(deadline_json).unwrap_or_default(),
        scheduled_at: row.get("scheduled_at"),
        started_at: row.get("started_at"),
    })
}

#[async_trait]
impl PersistenceAdapter for PostgresPersistence {
    #[instrument(skip(self, workflow))]
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let labels_json = serde_json::to_value(&workflow.labels)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO workflow (
                id, source_reference, inputs, options, labels,
                import_bundle, root_output_location, backend_name, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(workflow.id.0)
        .bind(&workflow.source_reference)
        .bind(serde_json::Value::Object(workflow.inputs.clone()))
        .bind(serde_json::Value::Object(workflow.options.0.clone()))
        .bind(&labels_json)
        .bind(&workflow.import_bundle)
        .bind(&workflow.root_output_location)
        .bind(&workflow.backend_name)
        .bind(workflow_status_str(workflow.status))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to insert workflow: {e}");
            StoreError::Database(e.to_string())
        })?;

        debug!(%workflow.id, "inserted workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_workflow_status(
        &self,
        workflow_id: WorkflowId,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE workflow SET status = $2 WHERE id = $1")
            .bind(workflow_id.0)
            .bind(workflow_status_str(status))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to update workflow status: {e}");
                StoreError::Database(e.to_string())
            })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(workflow_id.0));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, source_reference, inputs, options, labels,
                   import_bundle, root_output_location, backend_name, status
            FROM workflow WHERE id = $1
            "#,
        )
        .bind(workflow_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::WorkflowNotFound(workflow_id.0))?;

        row_to_workflow(&row)
    }

    #[instrument(skip(self))]
    async fn select_non_terminal_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_reference, inputs, options, labels,
                   import_bundle, root_output_location, backend_name, status
            FROM workflow
            WHERE status IN ('submitted', 'running')
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_workflow).collect()
    }

    #[instrument(skip(self, call))]
    async fn insert_call(&self, call: &Call) -> Result<(), StoreError> {
        let deadline_json = serde_json::to_value(&call.deadline)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let detritus_json = serde_json::to_value(&call.detritus_paths)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO call (
                workflow_id, task_name, shard, attempt, status, call_root,
                external_id, outputs, execution_info, detritus_paths,
                preemptible, memory_request_bytes, deadline, scheduled_at, started_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(call.key.workflow_id.0)
        .bind(&call.key.task_name)
        .bind(call.key.shard.map(|s| s as i64))
        .bind(call.key.attempt as i32)
        .bind(call_status_str(call.status))
        .bind(&call.call_root)
        .bind(&call.external_id)
        .bind(serde_json::Value::Object(call.outputs.clone()))
        .bind(serde_json::Value::Object(call.execution_info.clone()))
        .bind(&detritus_json)
        .bind(call.preemptible)
        .bind(call.memory_request_bytes.map(|b| b as i64))
        .bind(&deadline_json)
        .bind(call.scheduled_at)
        .bind(call.started_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to insert call: {e}");
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self, call, execution_info))]
    async fn update_call(
        &self,
        call: &Call,
        execution_info: &[ExecutionInfoWrite],
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let detritus_json = serde_json::to_value(&call.detritus_paths)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE call
            SET status = $4, call_root = $5, external_id = $6, outputs = $7,
                execution_info = $8, detritus_paths = $9, started_at = $10
            WHERE workflow_id = $1 AND task_name = $2 AND shard IS NOT DISTINCT FROM $3
              AND attempt = $11
            "#,
        )
        .bind(call.key.workflow_id.0)
        .bind(&call.key.task_name)
        .bind(call.key.shard.map(|s| s as i64))
        .bind(call_status_str(call.status))
        .bind(&call.call_root)
        .bind(&call.external_id)
        .bind(serde_json::Value::Object(call.outputs.clone()))
        .bind(serde_json::Value::Object(call.execution_info.clone()))
        .bind(&detritus_json)
        .bind(call.started_at)
        .bind(call.key.attempt as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::CallNotFound(call.key.to_string()));
        }

        for write in execution_info {
            sqlx::query(
                r#"
                INSERT INTO execution_info (workflow_id, task_name, shard, attempt, key_path, value)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (workflow_id, task_name, shard, attempt, key_path)
                DO UPDATE SET value = EXCLUDED.value
                "#,
            )
            .bind(write.call_key.workflow_id.0)
            .bind(&write.call_key.task_name)
            .bind(write.call_key.shard.map(|s| s as i64))
            .bind(write.call_key.attempt as i32)
            .bind(&write.key_path)
            .bind(&write.value)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(call_key = %call.key, "updated call");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn select_calls_by_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<Call>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, task_name, shard, attempt, status, call_root,
                   external_id, outputs, execution_info, detritus_paths,
                   preemptible, memory_request_bytes, deadline, scheduled_at, started_at
            FROM call WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_call).collect()
    }

    #[instrument(skip(self))]
    async fn select_non_terminal_calls(&self, workflow_id: WorkflowId) -> Result<Vec<Call>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, task_name, shard, attempt, status, call_root,
                   external_id, outputs, execution_info, detritus_paths,
                   preemptible, memory_request_bytes, deadline, scheduled_at, started_at
            FROM call
            WHERE workflow_id = $1 AND status NOT IN ('succeeded', 'failed', 'aborted')
            "#,
        )
        .bind(workflow_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_call).collect()
    }

    #[instrument(skip(self))]
    async fn reset_transient_executions(
        &self,
        workflow_id: WorkflowId,
        predicate: TransientPredicate,
    ) -> Result<Vec<CallKey>, StoreError> {
        let status_filter = match predicate {
            TransientPredicate::RunningWithoutExternalId => "running",
            TransientPredicate::Starting => "starting",
        };

        let query = match predicate {
            TransientPredicate::RunningWithoutExternalId => {
                r#"
                UPDATE call
                SET status = 'not_started'
                WHERE workflow_id = $1 AND status = $2 AND external_id IS NULL
                RETURNING workflow_id, task_name, shard, attempt
                "#
            }
            TransientPredicate::Starting => {
                r#"
                UPDATE call
                SET status = 'not_started'
                WHERE workflow_id = $1 AND status = $2
                RETURNING workflow_id, task_name, shard, attempt
                "#
            }
        };

        let rows = sqlx::query(query)
            .bind(workflow_id.0)
            .bind(status_filter)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| {
                let shard: Option<i64> = row.get("shard");
                CallKey {
                    workflow_id: WorkflowId(row.get("workflow_id")),
                    task_name: row.get("task_name"),
                    shard: shard.map(|s| s as u32),
                    attempt: row.get::<i32, _>("attempt") as u32,
                }
            })
            .collect())
    }

    #[instrument(skip(self, call_keys))]
    async fn set_starting_status(
        &self,
        workflow_id: WorkflowId,
        call_keys: &[CallKey],
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        for key in call_keys {
            sqlx::query(
                r#"
                UPDATE call SET status = 'starting'
                WHERE workflow_id = $1 AND task_name = $2 AND shard IS NOT DISTINCT FROM $3
                  AND attempt = $4
                "#,
            )
            .bind(workflow_id.0)
            .bind(&key.task_name)
            .bind(key.shard.map(|s| s as i64))
            .bind(key.attempt as i32)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            CallStatus::NotStarted,
            CallStatus::Starting,
            CallStatus::Running,
            CallStatus::Succeeded,
            CallStatus::Failed,
            CallStatus::Aborted,
            CallStatus::RetryableFailure,
            CallStatus::Preempted,
        ] {
            assert_eq!(parse_call_status(call_status_str(status)).unwrap(), status);
        }
    }

    #[test]
    fn workflow_status_strings_roundtrip() {
        for status in [
            WorkflowStatus::Submitted,
            WorkflowStatus::Running,
            WorkflowStatus::Succeeded,
            WorkflowStatus::Failed,
            WorkflowStatus::Aborted,
        ] {
            assert_eq!(parse_workflow_status(workflow_status_str(status)).unwrap(), status);
        }
    }

    // Remaining coverage requires a live PostgreSQL database; run with
    // `cargo test --features postgres-integration -- --ignored`.
}
