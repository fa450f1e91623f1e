//! Engine Supervisor (spec.md §4.J) and the top-level control flow of
//! §2: admits submissions, enforces global concurrency, drives each
//! Workflow's task graph through the Call state machine, and
//! coordinates shutdown.
//!
//! Grounded on `durable::worker::pool::WorkerPool` (config struct,
//! `Semaphore`-limited concurrency, `watch`-channel shutdown) and
//! `durable::worker::backpressure` for the admission-vs-capacity shape;
//! generalized from "claim and run one task type" to "admit a workflow,
//! then drive its whole graph."

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::backend::{BackendContract, BackendError, BoundCall, PollOutcome, RetryabilityHint};
use crate::cache::{self, CacheIndex, Fingerprint, HitStrategy, PriorResult};
use crate::call::{Call, CallStatus};
use crate::error::EngineError;
use crate::io::IoCapability;
use crate::metadata::{MetadataEvent, MetadataPublisher};
use crate::model::{CallKey, NodeKind, TaskGraph, Workflow, WorkflowId, WorkflowStatus};
use crate::persistence::{ExecutionInfoWrite, PersistenceAdapter, TransientPredicate};
use crate::reliability::{CircuitBreaker, CircuitBreakerConfig, FailureKind, RetryPolicy};
use crate::scatter::{self, CollectorStatus, ScatterGroup};
use crate::workflow::restart::RestartAction;
use crate::workflow::runtime::{evaluate_workflow_status, ready_nodes, NodeOutcome};

/// Engine-wide concurrency ceilings (spec.md §4.J, §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub max_concurrent_workflows: usize,
    pub max_concurrent_calls_per_backend: usize,
    pub metadata_buffer: usize,
    pub hit_strategy: HitStrategy,
    pub default_preemption_budget: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 50,
            max_concurrent_calls_per_backend: 200,
            metadata_buffer: 1024,
            hit_strategy: HitStrategy::CopyOutputs,
            default_preemption_budget: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("engine is shutting down, no further submissions are accepted")]
    ShuttingDown,
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Admits submissions, enforces global concurrency, drives workflows to
/// completion, and coordinates graceful shutdown (spec.md §4.J).
pub struct Supervisor {
    config: SupervisorConfig,
    persistence: Arc<dyn PersistenceAdapter>,
    cache: Arc<dyn CacheIndex>,
    backends: HashMap<String, Arc<dyn BackendContract>>,
    io: Arc<dyn IoCapability>,
    /// One counting semaphore per backend — the only global dispatch
    /// coordination point (spec.md §5).
    backend_semaphores: DashMap<String, Arc<Semaphore>>,
    workflow_admission: Arc<Semaphore>,
    metadata: MetadataPublisher,
    shutdown: CancellationToken,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        persistence: Arc<dyn PersistenceAdapter>,
        cache: Arc<dyn CacheIndex>,
        backends: HashMap<String, Arc<dyn BackendContract>>,
        io: Arc<dyn IoCapability>,
    ) -> (Self, tokio::sync::mpsc::Receiver<MetadataEvent>) {
        let (metadata, metadata_rx) = MetadataPublisher::new(config.metadata_buffer);
        let (shutdown_tx, _) = watch::channel(false);
        let workflow_admission = Arc::new(Semaphore::new(config.max_concurrent_workflows));
        let supervisor = Self {
            backend_semaphores: DashMap::new(),
            workflow_admission,
            metadata,
            shutdown: CancellationToken::new(),
            shutdown_tx,
            config,
            persistence,
            cache,
            backends,
            io,
        };
        (supervisor, metadata_rx)
    }

    fn backend_semaphore(&self, backend: &str) -> Arc<Semaphore> {
        self.backend_semaphores
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_concurrent_calls_per_backend)))
            .clone()
    }

    /// Admit a submission (spec.md §6) and drive it to completion.
    /// Admission is FIFO per workflow via the semaphore's own wait
    /// queue; this call suspends until a permit is free or shutdown is
    /// requested.
    #[instrument(skip(self, workflow, graph, backend_name))]
    pub async fn submit(
        &self,
        mut workflow: Workflow,
        graph: TaskGraph,
        backend_name: &str,
    ) -> Result<WorkflowStatus, SupervisorError> {
        if self.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        let backend = self
            .backends
            .get(backend_name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownBackend(backend_name.to_string()))?;

        let _permit = tokio::select! {
            permit = self.workflow_admission.clone().acquire_owned() => permit.expect("semaphore never closed"),
            _ = self.shutdown.cancelled() => return Err(SupervisorError::ShuttingDown),
        };

        self.persistence
            .insert_workflow(&workflow)
            .await
            .map_err(|e| EngineError::from(crate::error::PersistenceError::from(e)))?;

        backend
            .validate_options(&workflow.options)
            .await
            .map_err(EngineError::from)?;
        let init_data = backend.initialize_workflow(&workflow).await.map_err(EngineError::from)?;

        workflow.status = WorkflowStatus::Running;
        self.persistence
            .update_workflow_status(workflow.id, WorkflowStatus::Running)
            .await
            .map_err(|e| EngineError::from(crate::error::PersistenceError::from(e)))?;
        self.metadata
            .publish(MetadataEvent::workflow_status(workflow.id, WorkflowStatus::Running));

        let status = self.drive_workflow(&workflow, &graph, backend.as_ref()).await?;

        workflow.status = status;
        self.persistence
            .update_workflow_status(workflow.id, status)
            .await
            .map_err(|e| EngineError::from(crate::error::PersistenceError::from(e)))?;
        self.metadata.publish(MetadataEvent::workflow_status(workflow.id, status));

        backend
            .cleanup_workflow(&workflow, &init_data)
            .await
            .map_err(EngineError::from)?;

        Ok(status)
    }

    /// Drive the task graph (spec.md §4.G): repeatedly compute ready
    /// nodes, dispatch task-call nodes as Calls and scatter nodes
    /// through the Expander, until the workflow reaches a terminal
    /// status.
    async fn drive_workflow(
        &self,
        workflow: &Workflow,
        graph: &TaskGraph,
        backend: &dyn BackendContract,
    ) -> Result<WorkflowStatus, SupervisorError> {
        let mut outcomes: HashMap<String, NodeOutcome> = HashMap::new();
        let mut scatter_groups: HashMap<String, ScatterGroup> = HashMap::new();
        let mut any_failed_without_continuation = false;
        let continue_on_failure = workflow.options.bool_flag("continueOnFailure", false);

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(WorkflowStatus::Aborted);
            }
            if let Some(status) =
                evaluate_workflow_status(graph, &outcomes, any_failed_without_continuation)
            {
                return Ok(status);
            }

            let ready = ready_nodes(graph, &outcomes);
            if ready.is_empty() {
                // Nothing new became ready this pass, but the workflow
                // isn't terminal either: some node is mid-flight.
                // A real scheduler would await its completion signal;
                // here that work already happened synchronously inside
                // run_task_node/run_scatter_node below, so reaching this
                // branch with none pending means every node settled.
                break;
            }

            for node_name in ready {
                let node = graph.node(&node_name).expect("ready node exists in graph");
                let outcome = match &node.kind {
                    NodeKind::TaskCall => {
                        self.run_task_node(workflow, &node_name, backend).await
                    }
                    NodeKind::Scatter { collection_expression } => {
                        self.run_scatter_node(
                            workflow,
                            &node_name,
                            collection_expression,
                            backend,
                            continue_on_failure,
                            &mut scatter_groups,
                        )
                        .await
                    }
                    NodeKind::Conditional { .. } | NodeKind::OutputExpression => {
                        // Evaluated in-process; no Call is involved.
                        NodeOutcome::Succeeded
                    }
                };
                if outcome == NodeOutcome::Failed && !continue_on_failure {
                    any_failed_without_continuation = true;
                }
                outcomes.insert(node_name, outcome);
            }
        }

        Ok(evaluate_workflow_status(graph, &outcomes, any_failed_without_continuation)
            .unwrap_or(WorkflowStatus::Failed))
    }

    async fn run_scatter_node(
        &self,
        workflow: &Workflow,
        node_name: &str,
        collection_expression: &str,
        backend: &dyn BackendContract,
        continue_on_failure: bool,
        scatter_groups: &mut HashMap<String, ScatterGroup>,
    ) -> NodeOutcome {
        // Reuse the shard count already recorded for this node (a restart
        // or a later graph pass revisiting an in-flight scatter); only
        // evaluate the collection expression on first visit.
        let length = match scatter_groups.get(node_name) {
            Some(g) => g.shard_keys.len(),
            None => evaluate_collection_length(workflow, collection_expression),
        };

        let group = scatter_groups.entry(node_name.to_string()).or_insert_with(|| {
            let shards = scatter::expand_shards(workflow.id, node_name, length)
                .unwrap_or_else(|_| vec![CallKey::first_attempt(workflow.id, node_name, Some(0))]);
            ScatterGroup::new(workflow.id, node_name, shards)
        });

        let mut statuses = Vec::with_capacity(group.shard_keys.len());
        let mut keyed_statuses = Vec::with_capacity(group.shard_keys.len());
        for shard_key in group.shard_keys.clone() {
            let outcome = self.run_call(workflow, shard_key.clone(), backend).await;
            let status = match outcome {
                NodeOutcome::Succeeded => CallStatus::Succeeded,
                NodeOutcome::Failed => CallStatus::Failed,
                NodeOutcome::Aborted => CallStatus::Aborted,
                NodeOutcome::Pending => CallStatus::Running,
            };
            statuses.push(status);
            keyed_statuses.push((shard_key, status));
        }

        if statuses
            .iter()
            .any(|s| matches!(s, CallStatus::Failed | CallStatus::Aborted))
            && !continue_on_failure
        {
            for shard_key in group.siblings_to_abort(
                keyed_statuses
                    .iter()
                    .find(|(_, s)| matches!(s, CallStatus::Failed | CallStatus::Aborted))
                    .map(|(k, _)| k)
                    .unwrap_or(&group.shard_keys[0]),
                &keyed_statuses,
                continue_on_failure,
            ) {
                warn!(%shard_key, "aborting sibling shard after sibling failure");
            }
        }

        match group.try_collect(&statuses, continue_on_failure) {
            Ok(CollectorStatus::Succeeded) => NodeOutcome::Succeeded,
            Ok(CollectorStatus::Failed) => NodeOutcome::Failed,
            _ => NodeOutcome::Pending,
        }
    }

    async fn run_task_node(&self, workflow: &Workflow, node_name: &str, backend: &dyn BackendContract) -> NodeOutcome {
        let key = CallKey::first_attempt(workflow.id, node_name, None);
        self.run_call(workflow, key, backend).await
    }

    /// Run one Call (and, on failure, its successive attempts) to a
    /// terminal outcome (spec.md §4.E). Every transition is persisted
    /// before metadata is emitted (spec.md §4.H).
    async fn run_call(&self, workflow: &Workflow, mut key: CallKey, backend: &dyn BackendContract) -> NodeOutcome {
        let preemption_budget = workflow
            .options
            .f64_flag("preemptionBudget")
            .map(|v| v as u32)
            .unwrap_or(self.config.default_preemption_budget);
        let memory_retry_multiplier = workflow.options.f64_flag("memory_retry_multiplier");
        let retry_policy = RetryPolicy::default();
        // spec.md §8 Property 6: sustained preemption must terminate too,
        // bounded by whichever of the ordinary retry limit or the
        // preemption budget (plus the one guaranteed non-preemptible
        // attempt) is larger.
        let attempt_cap = retry_policy.max_attempts.max(preemption_budget + 1);
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());

        let mut call = Call::new(key.clone(), preemption_budget > 0);

        loop {
            if breaker.allow().is_err() {
                warn!(backend = backend.name(), "circuit open, refusing dispatch");
                let _ = call.fail();
                self.persist_call(&call).await;
                return NodeOutcome::Failed;
            }

            let init_data = crate::backend::InitData::default();
            let bound = match backend.prepare_call(&key, &init_data).await {
                Ok(bound) => bound,
                Err(e) => {
                    breaker.record_failure();
                    warn!(error = %e, "prepare_call failed");
                    let _ = call.fail();
                    self.persist_call(&call).await;
                    return NodeOutcome::Failed;
                }
            };

            let fingerprint = Fingerprint::compute(
                &bound.command,
                &serde_json::to_string(&bound.runtime_attributes).unwrap_or_default(),
                bound.runtime_attributes.get("dockerImageDigest").and_then(|v| v.as_str()),
            );

            if call.memory_request_bytes.is_none() {
                call.memory_request_bytes = bound
                    .runtime_attributes
                    .get("memoryBytes")
                    .and_then(|v| v.as_u64());
            }

            if let Some(outcome) = self.try_cache_hit(&mut call, &fingerprint, &bound, backend).await {
                return outcome;
            }

            let semaphore = self.backend_semaphore(backend.name());
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");

            let dispatch_root = bound.call_root.clone();
            if call.dispatch(dispatch_root).is_err() {
                return NodeOutcome::Failed;
            }
            self.persist_call(&call).await;

            let handle = match backend.execute(&bound).await {
                Ok(handle) => {
                    breaker.record_success();
                    handle
                }
                Err(e) => {
                    breaker.record_failure();
                    warn!(error = %e, "dispatch failed, retrying in place");
                    continue;
                }
            };

            if call.acknowledge_running(None).is_err() {
                return NodeOutcome::Failed;
            }
            self.persist_call(&call).await;

            match self.poll_to_terminal(&mut call, &handle, &bound, backend).await {
                PollVerdict::Succeeded(outputs) => {
                    let _ = call.succeed(outputs);
                    self.persist_call(&call).await;
                    self.record_cache_entry(&fingerprint, &call).await;
                    return NodeOutcome::Succeeded;
                }
                PollVerdict::Aborted => {
                    let _ = call.abort();
                    self.persist_call(&call).await;
                    return NodeOutcome::Aborted;
                }
                PollVerdict::Retry { kind, preempted, message } => {
                    let has_remaining = retry_policy.has_attempts_remaining(key.attempt, kind);
                    if call.fail_attempt(kind, has_remaining, preempted, attempt_cap).is_err() {
                        return NodeOutcome::Failed;
                    }
                    self.persist_call(&call).await;
                    if call.status.is_terminal() {
                        return NodeOutcome::Failed;
                    }
                    if !retry_policy.sleep_for_attempt(key.attempt + 1, &self.shutdown).await {
                        return NodeOutcome::Aborted;
                    }
                    // spec.md §4.E: memory scales only when the failure
                    // message matches the OOM signature *and* a multiplier
                    // is configured, not on every retryable failure.
                    let is_oom = message
                        .as_deref()
                        .is_some_and(|m| Call::matches_oom_signature(m, crate::call::DEFAULT_OOM_SUBSTRINGS));
                    let next = call.next_attempt(
                        preemption_budget,
                        is_oom.then_some(memory_retry_multiplier).flatten(),
                    );
                    key = next.key.clone();
                    call = next;
                }
            }
        }
    }

    async fn try_cache_hit(
        &self,
        call: &mut Call,
        fingerprint: &Fingerprint,
        bound: &BoundCall,
        backend: &dyn BackendContract,
    ) -> Option<NodeOutcome> {
        let candidates = self.cache.lookup(fingerprint).await.ok()?;
        // spec.md §4.C: a hit is only usable if every referenced output
        // still exists; stale candidates are skipped, not trusted.
        let live = cache::live_candidates(self.io.as_ref(), &candidates).await;
        for candidate in live {
            match backend
                .copy_cache_hit(bound, candidate, self.config.hit_strategy)
                .await
            {
                Ok(outputs) => {
                    let _ = call.cache_hit(bound.call_root.clone(), outputs);
                    self.persist_call(call).await;
                    return Some(NodeOutcome::Succeeded);
                }
                Err(e) => {
                    warn!(error = %e, call_key = %candidate.call_key, "cache hit copy failed, trying next candidate");
                    continue;
                }
            }
        }
        None
    }

    async fn record_cache_entry(&self, fingerprint: &Fingerprint, call: &Call) {
        if call.status != CallStatus::Succeeded {
            return;
        }
        let Some(call_root) = call.call_root.clone() else { return };
        let result = PriorResult {
            call_key: call.key.clone(),
            call_root,
            outputs: call.outputs.clone(),
            detritus_paths: call.detritus_paths.clone(),
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.cache.record(fingerprint.clone(), result).await {
            warn!(error = %e, "failed to record cache entry, continuing without it");
        }
    }

    async fn poll_to_terminal(
        &self,
        call: &mut Call,
        handle: &crate::backend::ExecutionHandle,
        bound: &BoundCall,
        backend: &dyn BackendContract,
    ) -> PollVerdict {
        let poll_backoff = RetryPolicy::poll_backoff();
        let mut handle = handle.clone();
        let mut poll_attempt = 1;
        loop {
            if self.shutdown.is_cancelled() {
                return PollVerdict::Aborted;
            }
            match backend.poll(&handle).await {
                Ok(PollOutcome::StillRunning(next_handle)) => {
                    handle = next_handle;
                    poll_attempt += 1;
                    if !poll_backoff.sleep_for_attempt(poll_attempt, &self.shutdown).await {
                        return PollVerdict::Aborted;
                    }
                }
                Ok(PollOutcome::Succeeded(detail)) => {
                    let policy: crate::call::ReturnCodePolicy = bound
                        .runtime_attributes
                        .get("continueOnReturnCode")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or_default();
                    let fail_on_stderr = bound
                        .runtime_attributes
                        .get("failOnStderr")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    let verdict = crate::call::apply_return_code_policy(
                        detail.return_code,
                        detail.stderr_size,
                        &policy,
                        fail_on_stderr,
                    );
                    use crate::call::CallOutcomeVerdict::*;
                    match verdict {
                        Success => return PollVerdict::Succeeded(detail.outputs),
                        Failure => {
                            return PollVerdict::Retry {
                                kind: FailureKind::Fatal,
                                preempted: false,
                                message: None,
                            }
                        }
                        UndefinedReturnCode => {
                            return PollVerdict::Retry {
                                kind: FailureKind::BoundedRetryable,
                                preempted: false,
                                message: None,
                            }
                        }
                    }
                }
                Ok(PollOutcome::Failed { retryability_hint, message, .. }) => {
                    let (kind, preempted) = match retryability_hint {
                        RetryabilityHint::NonRetryable => (FailureKind::Fatal, false),
                        RetryabilityHint::Retryable => (FailureKind::BoundedRetryable, false),
                        RetryabilityHint::Preempted => (FailureKind::BoundedRetryable, true),
                    };
                    return PollVerdict::Retry { kind, preempted, message: Some(message) };
                }
                Ok(PollOutcome::Aborted) => return PollVerdict::Aborted,
                Err(BackendError::Poll(msg)) => {
                    warn!(error = %msg, "poll transient failure, retrying");
                    poll_attempt += 1;
                    if !poll_backoff.sleep_for_attempt(poll_attempt, &self.shutdown).await {
                        return PollVerdict::Aborted;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "poll failed");
                    return PollVerdict::Retry {
                        kind: FailureKind::BoundedRetryable,
                        preempted: false,
                        message: None,
                    };
                }
            }
        }
    }

    async fn persist_call(&self, call: &Call) {
        let writes: Vec<ExecutionInfoWrite> = call
            .execution_info
            .iter()
            .map(|(k, v)| ExecutionInfoWrite {
                call_key: call.key.clone(),
                key_path: k.clone(),
                value: v.clone(),
            })
            .collect();
        if let Err(e) = self.persistence.update_call(call, &writes).await {
            warn!(error = %e, call_key = %call.key, "failed to persist call transition");
        }
        self.metadata
            .publish(MetadataEvent::call_status(call.key.clone(), call.status));
        if let Some(call_root) = &call.call_root {
            for detritus in ["script", "stdout", "stderr", "returnCode", "callRoot"] {
                self.metadata
                    .publish(MetadataEvent::detritus_path(call.key.clone(), detritus, call_root));
            }
        }
    }

    /// Restart support (spec.md §4.G): reload every non-terminal
    /// workflow and reclassify its non-terminal Calls, rejecting
    /// restart where spec.md says to.
    pub async fn restart_all(&self) -> Result<(), SupervisorError> {
        let workflows = self
            .persistence
            .select_non_terminal_workflows()
            .await
            .map_err(|e| EngineError::from(crate::error::PersistenceError::from(e)))?;
        for workflow in workflows {
            let calls = self
                .persistence
                .select_non_terminal_calls(workflow.id)
                .await
                .map_err(|e| EngineError::from(crate::error::PersistenceError::from(e)))?;
            let actions = match crate::workflow::restart::classify_restart(&calls, &[]) {
                Ok(actions) => actions,
                Err(e) => {
                    warn!(workflow_id = %workflow.id, error = %e, "workflow restart rejected");
                    continue;
                }
            };
            info!(workflow_id = %workflow.id, actions = actions.len(), "restart classified");
            if actions.is_empty() {
                continue;
            }

            if actions
                .iter()
                .any(|(_, action)| *action == RestartAction::ResetToNotStarted)
            {
                for predicate in [TransientPredicate::Starting, TransientPredicate::RunningWithoutExternalId] {
                    match self.persistence.reset_transient_executions(workflow.id, predicate).await {
                        Ok(reset) if !reset.is_empty() => {
                            info!(workflow_id = %workflow.id, ?predicate, count = reset.len(), "reset transient calls to not_started");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(workflow_id = %workflow.id, error = %e, "failed to reset transient calls"),
                    }
                }
            }

            let Some(backend) = self.backends.get(&workflow.backend_name).cloned() else {
                warn!(workflow_id = %workflow.id, backend = %workflow.backend_name, "restart resume skipped: unknown backend");
                continue;
            };
            for (call_key, action) in &actions {
                let RestartAction::Resume { external_id } = action else { continue };
                let init_data = crate::backend::InitData::default();
                let bound = match backend.prepare_call(call_key, &init_data).await {
                    Ok(bound) => bound,
                    Err(e) => {
                        warn!(%call_key, error = %e, "restart resume: prepare_call failed");
                        continue;
                    }
                };
                match backend.resume(&bound, external_id).await {
                    Ok(_) => info!(%call_key, "resumed running call against its backend"),
                    Err(e) => warn!(%call_key, error = %e, "restart resume failed"),
                }
            }
        }
        Ok(())
    }

    /// Stop accepting submissions, quiesce in-flight polls, and return
    /// once everything durable has settled (spec.md §4.J).
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

/// Resolve a scatter node's collection expression against the workflow's
/// input document (spec.md §4.F). Expression evaluation proper (path
/// traversal, function calls) is an external collaborator's concern
/// (spec.md §1); the engine only needs the resulting array's length, so
/// this recognizes the common case of a bare input name — or a
/// `a.b.c` dotted path into nested objects — and reads its length
/// directly out of the already-resolved JSON document. Anything else
/// (a real expression language) falls back to a single shard.
fn evaluate_collection_length(workflow: &Workflow, collection_expression: &str) -> usize {
    let mut current = workflow.inputs.get(
        collection_expression
            .split('.')
            .next()
            .unwrap_or(collection_expression),
    );
    for segment in collection_expression.split('.').skip(1) {
        current = current.and_then(|v| v.as_object()).and_then(|o| o.get(segment));
    }
    match current {
        Some(serde_json::Value::Array(items)) => items.len().max(1),
        _ => 1,
    }
}

enum PollVerdict {
    Succeeded(serde_json::Map<String, serde_json::Value>),
    Aborted,
    Retry {
        kind: FailureKind,
        preempted: bool,
        message: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheIndex;
    use crate::backend::LocalShellBackend;
    use crate::model::{GraphNode, WorkflowOptions};
    use crate::persistence::InMemoryPersistence;

    fn make_graph() -> TaskGraph {
        TaskGraph::new(vec![GraphNode {
            name: "hello".into(),
            kind: NodeKind::TaskCall,
            depends_on: vec![],
        }])
        .unwrap()
    }

    #[tokio::test]
    async fn supervisor_construction_and_backend_semaphore_lazily_created() {
        let persistence: Arc<dyn PersistenceAdapter> = Arc::new(InMemoryPersistence::new());
        let cache: Arc<dyn CacheIndex> = Arc::new(InMemoryCacheIndex::new());
        let mut backends: HashMap<String, Arc<dyn BackendContract>> = HashMap::new();
        let tmp = std::env::temp_dir().join(format!("supervisor-test-{}", uuid::Uuid::now_v7()));
        backends.insert("local".into(), Arc::new(LocalShellBackend::new(tmp)));

        let io: Arc<dyn crate::io::IoCapability> = Arc::new(crate::io::LocalIo);
        let (supervisor, _rx) = Supervisor::new(SupervisorConfig::default(), persistence, cache, backends, io);
        assert_eq!(supervisor.backend_semaphores.len(), 0);
        let _ = supervisor.backend_semaphore("local");
        assert_eq!(supervisor.backend_semaphores.len(), 1);
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected() {
        let persistence: Arc<dyn PersistenceAdapter> = Arc::new(InMemoryPersistence::new());
        let cache: Arc<dyn CacheIndex> = Arc::new(InMemoryCacheIndex::new());
        let backends: HashMap<String, Arc<dyn BackendContract>> = HashMap::new();
        let io: Arc<dyn crate::io::IoCapability> = Arc::new(crate::io::LocalIo);
        let (supervisor, _rx) = Supervisor::new(SupervisorConfig::default(), persistence, cache, backends, io);

        let workflow = Workflow::new(
            "echo hi",
            serde_json::Map::new(),
            WorkflowOptions::default(),
            BTreeMap::new(),
            "/tmp/root",
            "does-not-exist",
        );
        let err = supervisor
            .submit(workflow, make_graph(), "does-not-exist")
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownBackend(_)));
    }
}
