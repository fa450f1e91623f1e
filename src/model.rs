//! Core data model: workflows, the task graph, and call keys.
//!
//! These types are shared by every other module; nothing here talks to
//! a backend, a store, or the filesystem.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit workflow identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Generate a new, time-ordered workflow id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A typed, open map used for workflow inputs and options.
pub type TypedMap = serde_json::Map<String, serde_json::Value>;

/// `workflow_root` and a handful of other options are recognized by the
/// engine itself (§6); everything else passes through to backends.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowOptions(pub TypedMap);

impl WorkflowOptions {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn bool_flag(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn f64_flag(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn string_flag(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }
}

/// The lifecycle of a workflow (spec.md §3). Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

/// A submitted workflow and the attributes that accompany it (spec.md §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub source_reference: String,
    pub inputs: TypedMap,
    pub options: WorkflowOptions,
    pub labels: BTreeMap<String, String>,
    pub import_bundle: Option<String>,
    pub root_output_location: String,
    /// Name of the [`crate::backend::BackendContract`] this workflow was
    /// submitted against, so a restart can resolve the right backend to
    /// resume `Running` calls on without the caller re-supplying it.
    pub backend_name: String,
    pub status: WorkflowStatus,
}

impl Workflow {
    pub fn new(
        source_reference: impl Into<String>,
        inputs: TypedMap,
        options: WorkflowOptions,
        labels: BTreeMap<String, String>,
        root_output_location: impl Into<String>,
        backend_name: impl Into<String>,
    ) -> Self {
        Self {
            id: WorkflowId::new(),
            source_reference: source_reference.into(),
            inputs,
            options,
            labels,
            import_bundle: None,
            root_output_location: root_output_location.into(),
            backend_name: backend_name.into(),
            status: WorkflowStatus::Submitted,
        }
    }

    /// Apply a terminal transition. Invariant (spec.md §3): exactly one
    /// terminal transition; callers must not call this twice.
    pub fn transition_terminal(&mut self, status: WorkflowStatus) -> Result<(), ModelError> {
        if self.status.is_terminal() {
            return Err(ModelError::AlreadyTerminal(self.id));
        }
        if !status.is_terminal() {
            return Err(ModelError::NotATerminalStatus(status));
        }
        self.status = status;
        Ok(())
    }
}

/// Shard index for a scattered call; `None` means the call is not scattered.
pub type ShardIndex = Option<u32>;

/// Uniquely identifies a Call: (workflow, fully qualified task name, shard, attempt).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallKey {
    pub workflow_id: WorkflowId,
    pub task_name: String,
    pub shard: ShardIndex,
    pub attempt: u32,
}

impl CallKey {
    pub fn first_attempt(workflow_id: WorkflowId, task_name: impl Into<String>, shard: ShardIndex) -> Self {
        Self {
            workflow_id,
            task_name: task_name.into(),
            shard,
            attempt: 1,
        }
    }

    /// The next attempt of the same call. Attempt numbers are strictly
    /// monotonic (spec.md §3 invariant).
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// A stable string suitable for directory names:
    /// `call-<taskName>[-<shardIndex>]`.
    pub fn call_root_segment(&self) -> String {
        match self.shard {
            Some(idx) => format!("call-{}-{}", self.task_name, idx),
            None => format!("call-{}", self.task_name),
        }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shard {
            Some(idx) => write!(
                f,
                "{}/{}[{}]#{}",
                self.workflow_id, self.task_name, idx, self.attempt
            ),
            None => write!(f, "{}/{}#{}", self.workflow_id, self.task_name, self.attempt),
        }
    }
}

/// Node kinds in the task graph derived from the workflow document (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeKind {
    TaskCall,
    Scatter { collection_expression: String },
    Conditional { condition_expression: String },
    OutputExpression,
}

/// A node in the (acyclic, deterministically ordered) task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub name: String,
    pub kind: NodeKind,
    /// Names of upstream nodes this node's input expressions depend on.
    pub depends_on: Vec<String>,
}

/// The task graph derived from the workflow document at start (spec.md §3).
///
/// Parsing and type-checking the document is an external collaborator
/// (spec.md §1); this struct is the typed result it hands back.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskGraph {
    nodes: Vec<GraphNode>,
}

/// Errors raised while building or querying a [`TaskGraph`].
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("task graph contains a cycle through {0:?}")]
    Cycle(Vec<String>),
    #[error("duplicate node name: {0}")]
    DuplicateNode(String),
    #[error("node {0} depends on unknown node {1}")]
    UnknownDependency(String, String),
}

impl TaskGraph {
    /// Build a graph from nodes already known to be acyclic, validating
    /// the acyclicity invariant (spec.md §3) rather than trusting the caller.
    pub fn new(nodes: Vec<GraphNode>) -> Result<Self, GraphError> {
        let mut seen = std::collections::HashSet::new();
        for node in &nodes {
            if !seen.insert(node.name.clone()) {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
        }
        for node in &nodes {
            for dep in &node.depends_on {
                if !seen.contains(dep) {
                    return Err(GraphError::UnknownDependency(node.name.clone(), dep.clone()));
                }
            }
        }
        let graph = Self { nodes };
        graph.topological_order()?;
        Ok(graph)
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Deterministic topological order (spec.md §3 invariant): ties are
    /// broken by declaration order, so the same document always yields
    /// the same order.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for node in &self.nodes {
            in_degree.entry(&node.name).or_insert(0);
            for dep in &node.depends_on {
                *in_degree.entry(&node.name).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(&node.name);
            }
        }

        let mut ready: Vec<&str> = self
            .nodes
            .iter()
            .map(|n| n.name.as_str())
            .filter(|n| in_degree[n] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut in_degree = in_degree;

        while let Some(pos) = ready
            .iter()
            .enumerate()
            .min_by_key(|(_, n)| self.nodes.iter().position(|g| &g.name == *n))
            .map(|(i, _)| i)
        {
            let name = ready.remove(pos);
            order.push(name.to_string());
            if let Some(next) = dependents.get(name) {
                for dependent in next {
                    let entry = in_degree.get_mut(dependent).unwrap();
                    *entry -= 1;
                    if *entry == 0 {
                        ready.push(dependent);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let remaining: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(n, _)| n.to_string())
                .collect();
            return Err(GraphError::Cycle(remaining));
        }
        Ok(order)
    }
}

/// Errors from [`Workflow`] lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("workflow {0} is already terminal")]
    AlreadyTerminal(WorkflowId),
    #[error("{0:?} is not a terminal status")]
    NotATerminalStatus(WorkflowStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_key_next_attempt_is_monotonic() {
        let wf = WorkflowId::new();
        let key = CallKey::first_attempt(wf, "my_task", None);
        let next = key.next_attempt();
        assert_eq!(key.attempt, 1);
        assert_eq!(next.attempt, 2);
        assert_eq!(next.task_name, key.task_name);
    }

    #[test]
    fn call_root_segment_includes_shard() {
        let wf = WorkflowId::new();
        let key = CallKey::first_attempt(wf, "scatter_task", Some(3));
        assert_eq!(key.call_root_segment(), "call-scatter_task-3");

        let unsharded = CallKey::first_attempt(wf, "plain_task", None);
        assert_eq!(unsharded.call_root_segment(), "call-plain_task");
    }

    #[test]
    fn workflow_terminal_transition_is_exactly_once() {
        let mut wf = Workflow::new("echo hi", TypedMap::new(), WorkflowOptions::default(), BTreeMap::new(), "/tmp/root", "local");
        wf.transition_terminal(WorkflowStatus::Succeeded).unwrap();
        assert!(wf.status.is_terminal());
        let err = wf.transition_terminal(WorkflowStatus::Failed).unwrap_err();
        assert!(matches!(err, ModelError::AlreadyTerminal(_)));
    }

    #[test]
    fn task_graph_rejects_cycles() {
        let nodes = vec![
            GraphNode {
                name: "a".into(),
                kind: NodeKind::TaskCall,
                depends_on: vec!["b".into()],
            },
            GraphNode {
                name: "b".into(),
                kind: NodeKind::TaskCall,
                depends_on: vec!["a".into()],
            },
        ];
        let err = TaskGraph::new(nodes).unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn task_graph_topological_order_is_deterministic() {
        let nodes = vec![
            GraphNode { name: "c".into(), kind: NodeKind::TaskCall, depends_on: vec!["a".into(), "b".into()] },
            GraphNode { name: "a".into(), kind: NodeKind::TaskCall, depends_on: vec![] },
            GraphNode { name: "b".into(), kind: NodeKind::TaskCall, depends_on: vec!["a".into()] },
        ];
        let graph = TaskGraph::new(nodes).unwrap();
        assert_eq!(graph.topological_order().unwrap(), vec!["a", "b", "c"]);
    }
}
