//! End-to-end scenario tests (spec.md §8, S1-S7): a deterministic fake
//! backend driven through the real `Supervisor`, in-memory persistence
//! and in-memory cache index — no real process spawning, no real sleeps
//! (`start_paused` advances the retry/poll-backoff clocks instantly).
//!
//! S5 drives a single-shard scatter through `Supervisor::submit` itself;
//! the multi-shard sibling-abort and tolerant-collector invariants are
//! covered directly in `scatter::tests`. S6 composes `classify_restart`
//! and the backend contract directly rather than going through
//! `Supervisor::restart_all`, since exercising a real resume end to end
//! needs a backend capable of surviving process restart, which the fake
//! backend here doesn't model.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use dagrunner_engine::prelude::*;
use dagrunner_engine::model::ShardIndex;
use dagrunner_engine::workflow::restart::{classify_restart, RestartAction};

#[derive(Clone)]
enum Step {
    Succeed,
    FailPreempted(String),
    FailRetryable(String),
    FailFatal(String),
}

#[derive(Clone)]
struct TaskConfig {
    command: String,
    runtime_attributes: serde_json::Map<String, serde_json::Value>,
}

/// A scriptable [`BackendContract`]: each `(task_name, shard)` gets its
/// own outcome sequence, consumed one step per attempt regardless of
/// attempt number (so a retried Call picks up the next scripted step).
struct FakeBackend {
    configs: DashMap<String, TaskConfig>,
    scripts: DashMap<(String, ShardIndex), Vec<Step>>,
    attempt_counters: DashMap<(String, ShardIndex), AtomicUsize>,
    execute_count: AtomicUsize,
    cache_hit_count: AtomicUsize,
}

impl FakeBackend {
    fn new() -> Self {
        Self {
            configs: DashMap::new(),
            scripts: DashMap::new(),
            attempt_counters: DashMap::new(),
            execute_count: AtomicUsize::new(0),
            cache_hit_count: AtomicUsize::new(0),
        }
    }

    fn set_task(&self, task_name: &str, command: &str, runtime_attributes: serde_json::Map<String, serde_json::Value>) {
        self.configs.insert(
            task_name.to_string(),
            TaskConfig {
                command: command.to_string(),
                runtime_attributes,
            },
        );
    }

    fn set_script(&self, task_name: &str, shard: ShardIndex, steps: Vec<Step>) {
        self.scripts.insert((task_name.to_string(), shard), steps);
    }

    fn execute_count(&self) -> usize {
        self.execute_count.load(Ordering::SeqCst)
    }

    fn cache_hit_count(&self) -> usize {
        self.cache_hit_count.load(Ordering::SeqCst)
    }
}

fn detail(return_code: i32) -> CallOutcomeDetail {
    CallOutcomeDetail {
        return_code: Some(return_code),
        stderr_size: 0,
        outputs: serde_json::Map::new(),
        events: vec![],
    }
}

#[async_trait]
impl BackendContract for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn validate_options(&self, _options: &dagrunner_engine::model::WorkflowOptions) -> Result<(), BackendError> {
        Ok(())
    }

    async fn initialize_workflow(&self, _workflow: &Workflow) -> Result<InitData, BackendError> {
        Ok(InitData::default())
    }

    async fn prepare_call(&self, call_key: &CallKey, _init_data: &InitData) -> Result<BoundCall, BackendError> {
        let (command, runtime_attributes) = match self.configs.get(&call_key.task_name) {
            Some(cfg) => (cfg.command.clone(), cfg.runtime_attributes.clone()),
            None => (call_key.task_name.clone(), serde_json::Map::new()),
        };
        Ok(BoundCall {
            call_key: call_key.clone(),
            call_root: format!("/tmp/fake/{}", call_key.call_root_segment()),
            command,
            input_mapping: BTreeMap::new(),
            runtime_attributes,
        })
    }

    async fn execute(&self, bound: &BoundCall) -> Result<ExecutionHandle, BackendError> {
        self.execute_count.fetch_add(1, Ordering::SeqCst);
        let task_name = bound.call_key.task_name.clone();
        let shard = bound.call_key.shard;
        let counter = self
            .attempt_counters
            .entry((task_name.clone(), shard))
            .or_insert_with(|| AtomicUsize::new(0));
        let step_index = counter.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionHandle(serde_json::json!({
            "task_name": task_name,
            "shard": shard,
            "step_index": step_index,
        })))
    }

    async fn resume(&self, _bound: &BoundCall, resume_token: &str) -> Result<ExecutionHandle, BackendError> {
        Ok(ExecutionHandle(serde_json::json!({
            "resumed": true,
            "token": resume_token,
        })))
    }

    async fn poll(&self, handle: &ExecutionHandle) -> Result<PollOutcome, BackendError> {
        let value = &handle.0;
        if value.get("resumed").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(PollOutcome::Succeeded(detail(0)));
        }
        let task_name = value["task_name"].as_str().unwrap_or_default().to_string();
        let shard = value.get("shard").and_then(|v| v.as_u64()).map(|v| v as u32);
        let step_index = value["step_index"].as_u64().unwrap_or(0) as usize;

        let step = self
            .scripts
            .get(&(task_name, shard))
            .and_then(|steps| steps.get(step_index).or_else(|| steps.last()).cloned())
            .unwrap_or(Step::Succeed);

        Ok(match step {
            Step::Succeed => PollOutcome::Succeeded(detail(0)),
            Step::FailPreempted(message) => PollOutcome::Failed {
                detail: detail(1),
                error_code: "PREEMPTED".into(),
                message,
                retryability_hint: RetryabilityHint::Preempted,
            },
            Step::FailRetryable(message) => PollOutcome::Failed {
                detail: detail(1),
                error_code: "RETRYABLE".into(),
                message,
                retryability_hint: RetryabilityHint::Retryable,
            },
            Step::FailFatal(message) => PollOutcome::Failed {
                detail: detail(1),
                error_code: "FATAL".into(),
                message,
                retryability_hint: RetryabilityHint::NonRetryable,
            },
        })
    }

    async fn abort(&self, _handle: &ExecutionHandle) -> Result<(), BackendError> {
        Ok(())
    }

    async fn copy_cache_hit(
        &self,
        _bound: &BoundCall,
        prior: &PriorResult,
        _strategy: HitStrategy,
    ) -> Result<serde_json::Map<String, serde_json::Value>, BackendError> {
        self.cache_hit_count.fetch_add(1, Ordering::SeqCst);
        Ok(prior.outputs.clone())
    }

    async fn cleanup_workflow(&self, _workflow: &Workflow, _init_data: &InitData) -> Result<(), BackendError> {
        Ok(())
    }
}

fn single_task_graph(name: &str) -> TaskGraph {
    TaskGraph::new(vec![GraphNode {
        name: name.to_string(),
        kind: NodeKind::TaskCall,
        depends_on: vec![],
    }])
    .unwrap()
}

fn options_from(pairs: &[(&str, serde_json::Value)]) -> dagrunner_engine::model::WorkflowOptions {
    let mut map = serde_json::Map::new();
    for (k, v) in pairs {
        map.insert(k.to_string(), v.clone());
    }
    dagrunner_engine::model::WorkflowOptions(map)
}

fn build_supervisor(
    backend: Arc<FakeBackend>,
    hit_strategy: HitStrategy,
) -> (
    Supervisor,
    Arc<dyn PersistenceAdapter>,
    tokio::sync::mpsc::Receiver<MetadataEvent>,
) {
    let persistence: Arc<dyn PersistenceAdapter> = Arc::new(InMemoryPersistence::new());
    let cache: Arc<dyn CacheIndex> = Arc::new(InMemoryCacheIndex::new());
    let mut backends: HashMap<String, Arc<dyn BackendContract>> = HashMap::new();
    backends.insert("fake".into(), backend as Arc<dyn BackendContract>);
    let config = SupervisorConfig {
        hit_strategy,
        ..SupervisorConfig::default()
    };
    let io: Arc<dyn IoCapability> = Arc::new(LocalIo);
    let (supervisor, rx) = Supervisor::new(config, persistence.clone(), cache, backends, io);
    (supervisor, persistence, rx)
}

// S1: a single task dispatches once and succeeds.
#[tokio::test(start_paused = true)]
async fn s1_happy_path_single_task_succeeds() {
    let backend = Arc::new(FakeBackend::new());
    backend.set_task("task_a", "echo hi", serde_json::Map::new());
    let (supervisor, _persistence, _rx) = build_supervisor(backend.clone(), HitStrategy::CopyOutputs);

    let workflow = Workflow::new("s1", serde_json::Map::new(), dagrunner_engine::model::WorkflowOptions::default(), BTreeMap::new(), "/tmp/s1", "fake");
    let status = supervisor.submit(workflow, single_task_graph("task_a"), "fake").await.unwrap();

    assert_eq!(status, WorkflowStatus::Succeeded);
    assert_eq!(backend.execute_count(), 1);
}

// S2: preempted twice, then succeeds within the preemption budget (P=3).
#[tokio::test(start_paused = true)]
async fn s2_preempt_then_succeed_within_budget() {
    let backend = Arc::new(FakeBackend::new());
    backend.set_task("task_a", "echo hi", serde_json::Map::new());
    backend.set_script(
        "task_a",
        None,
        vec![
            Step::FailPreempted("preempted".into()),
            Step::FailPreempted("preempted".into()),
            Step::Succeed,
        ],
    );
    let (supervisor, _persistence, _rx) = build_supervisor(backend.clone(), HitStrategy::CopyOutputs);

    let workflow = Workflow::new(
        "s2",
        serde_json::Map::new(),
        options_from(&[("preemptionBudget", serde_json::json!(3.0))]),
        BTreeMap::new(),
        "/tmp/s2",
        "fake",
    );
    let status = supervisor.submit(workflow, single_task_graph("task_a"), "fake").await.unwrap();

    assert_eq!(status, WorkflowStatus::Succeeded);
    assert_eq!(backend.execute_count(), 3);
}

// S3: preemption budget (P=2) exhausts after two preemptions; the third
// attempt switches to non-preemptible before succeeding.
#[tokio::test(start_paused = true)]
async fn s3_preempt_budget_exhausted_switches_to_non_preemptible() {
    let backend = Arc::new(FakeBackend::new());
    backend.set_task("task_a", "echo hi", serde_json::Map::new());
    backend.set_script(
        "task_a",
        None,
        vec![
            Step::FailPreempted("preempted".into()),
            Step::FailPreempted("preempted".into()),
            Step::Succeed,
        ],
    );
    let (supervisor, persistence, _rx) = build_supervisor(backend.clone(), HitStrategy::CopyOutputs);

    let workflow = Workflow::new(
        "s3",
        serde_json::Map::new(),
        options_from(&[("preemptionBudget", serde_json::json!(2.0))]),
        BTreeMap::new(),
        "/tmp/s3",
        "fake",
    );
    let workflow_id = workflow.id;
    let status = supervisor.submit(workflow, single_task_graph("task_a"), "fake").await.unwrap();

    assert_eq!(status, WorkflowStatus::Succeeded);
    assert_eq!(backend.execute_count(), 3);

    let calls = persistence.select_calls_by_workflow(workflow_id).await.unwrap();
    let final_call = calls.iter().find(|c| c.status == CallStatus::Succeeded).unwrap();
    assert_eq!(final_call.key.attempt, 3);
    assert!(
        !final_call.preemptible,
        "budget of 2 should be exhausted by the third attempt"
    );
}

// S4: a second submission with an identical fingerprint hits the cache
// under UseOriginal and never dispatches to the backend.
#[tokio::test(start_paused = true)]
async fn s4_cache_hit_use_original_skips_dispatch() {
    let backend = Arc::new(FakeBackend::new());
    backend.set_task("cacheable_task", "echo hi", serde_json::Map::new());
    let (supervisor, _persistence, _rx) = build_supervisor(backend.clone(), HitStrategy::UseOriginal);

    let first = Workflow::new("s4a", serde_json::Map::new(), dagrunner_engine::model::WorkflowOptions::default(), BTreeMap::new(), "/tmp/s4a", "fake");
    let status_a = supervisor
        .submit(first, single_task_graph("cacheable_task"), "fake")
        .await
        .unwrap();
    assert_eq!(status_a, WorkflowStatus::Succeeded);
    assert_eq!(backend.execute_count(), 1);

    let second = Workflow::new("s4b", serde_json::Map::new(), dagrunner_engine::model::WorkflowOptions::default(), BTreeMap::new(), "/tmp/s4b", "fake");
    let status_b = supervisor
        .submit(second, single_task_graph("cacheable_task"), "fake")
        .await
        .unwrap();

    assert_eq!(status_b, WorkflowStatus::Succeeded);
    assert_eq!(backend.execute_count(), 1, "second workflow must hit the cache, not dispatch");
    assert_eq!(backend.cache_hit_count(), 1);
}

// S5: a scatter node with a failing shard fails its collector and the
// workflow. This workflow has no `samples` array input, so the scatter
// evaluator falls back to a single shard; the multi-shard sibling-abort
// and tolerant-collector invariants are covered directly in
// `scatter::tests`.
#[tokio::test(start_paused = true)]
async fn s5_scatter_with_failing_shard_fails_workflow() {
    let backend = Arc::new(FakeBackend::new());
    backend.set_task("per_sample", "echo hi", serde_json::Map::new());
    backend.set_script("per_sample", Some(0), vec![Step::FailFatal("boom".into())]);
    let (supervisor, _persistence, _rx) = build_supervisor(backend.clone(), HitStrategy::CopyOutputs);

    let graph = TaskGraph::new(vec![GraphNode {
        name: "per_sample".into(),
        kind: NodeKind::Scatter {
            collection_expression: "samples".into(),
        },
        depends_on: vec![],
    }])
    .unwrap();

    let workflow = Workflow::new("s5", serde_json::Map::new(), dagrunner_engine::model::WorkflowOptions::default(), BTreeMap::new(), "/tmp/s5", "fake");
    let status = supervisor.submit(workflow, graph, "fake").await.unwrap();

    assert_eq!(status, WorkflowStatus::Failed);
    assert_eq!(backend.execute_count(), 1, "fatal failure must not retry");
}

// S6: a Call left `Running` with a recorded external id at restart is
// classified for `resume`, not reset, and the resumed backend handle
// settles it `Running -> Succeeded` without minting a new attempt. This
// composes `classify_restart`, the persistence adapter and the backend
// contract directly; `Supervisor::restart_all` drives the same
// primitives against a real backend (see its own tests).
#[tokio::test(start_paused = true)]
async fn s6_restart_with_running_external_id_resumes_without_new_attempt() {
    let persistence = InMemoryPersistence::new();
    let workflow = Workflow::new("s6", serde_json::Map::new(), dagrunner_engine::model::WorkflowOptions::default(), BTreeMap::new(), "/tmp/s6", "fake");
    persistence.insert_workflow(&workflow).await.unwrap();

    let mut call = Call::new(CallKey::first_attempt(workflow.id, "task_a", None), false);
    call.dispatch("/tmp/fake/call-task_a".into()).unwrap();
    call.acknowledge_running(Some("ext-xyz".into())).unwrap();
    persistence.insert_call(&call).await.unwrap();

    let non_terminal = persistence.select_non_terminal_calls(workflow.id).await.unwrap();
    let actions = classify_restart(&non_terminal, &[]).unwrap();
    assert_eq!(actions.len(), 1);
    let (key, action) = &actions[0];
    assert_eq!(*key, call.key);
    let external_id = match action {
        RestartAction::Resume { external_id } => external_id.clone(),
        other => panic!("expected a Resume action, got {other:?}"),
    };
    assert_eq!(external_id, "ext-xyz");

    let backend = FakeBackend::new();
    let bound = backend.prepare_call(&call.key, &InitData::default()).await.unwrap();
    let handle = backend.resume(&bound, &external_id).await.unwrap();
    match backend.poll(&handle).await.unwrap() {
        PollOutcome::Succeeded(detail) => call.succeed(detail.outputs).unwrap(),
        other => panic!("expected the resumed handle to report success, got {other:?}"),
    }

    assert_eq!(call.status, CallStatus::Succeeded);
    assert_eq!(call.key.attempt, 1, "resume must not mint a new attempt");
}

// S7: a retryable OOM failure scales memory by the configured
// multiplier (1.5x) across attempts until the call succeeds.
#[tokio::test(start_paused = true)]
async fn s7_memory_retry_scales_on_oom_signature() {
    let four_gib: u64 = 4 * 1024 * 1024 * 1024;
    let backend = Arc::new(FakeBackend::new());
    let mut attrs = serde_json::Map::new();
    attrs.insert("memoryBytes".into(), serde_json::json!(four_gib));
    backend.set_task("task_a", "echo hi", attrs);
    backend.set_script(
        "task_a",
        None,
        vec![
            Step::FailRetryable("container killed: OutOfMemory".into()),
            Step::FailRetryable("container killed: OutOfMemory".into()),
            Step::Succeed,
        ],
    );
    let (supervisor, persistence, _rx) = build_supervisor(backend.clone(), HitStrategy::CopyOutputs);

    let workflow = Workflow::new(
        "s7",
        serde_json::Map::new(),
        options_from(&[("memory_retry_multiplier", serde_json::json!(1.5))]),
        BTreeMap::new(),
        "/tmp/s7",
        "fake",
    );
    let workflow_id = workflow.id;
    let status = supervisor.submit(workflow, single_task_graph("task_a"), "fake").await.unwrap();

    assert_eq!(status, WorkflowStatus::Succeeded);
    assert_eq!(backend.execute_count(), 3);

    let calls = persistence.select_calls_by_workflow(workflow_id).await.unwrap();
    let final_call = calls.iter().find(|c| c.status == CallStatus::Succeeded).unwrap();
    assert_eq!(final_call.key.attempt, 3);
    // 4 GiB -> 6 GiB -> 9 GiB, each step an exact f64 multiply.
    assert_eq!(final_call.memory_request_bytes, Some(9 * 1024 * 1024 * 1024));
}
