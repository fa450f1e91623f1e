//! Ready-node detection and terminal-status evaluation (spec.md §4.G)
//!
//! Drives the task graph: a node becomes ready when every upstream node
//! is terminal-success. Grounded on `durable::engine::executor`'s
//! action-processing loop (`process_actions`) in spirit — "inspect
//! current state, decide what becomes runnable next" — but over
//! [`crate::model::TaskGraph`] rather than a replayed event log.

use std::collections::HashMap;

use crate::model::{NodeKind, TaskGraph, WorkflowStatus};

/// Per-node outcome as tracked by the workflow runtime. A `TaskCall`
/// node's outcome mirrors its Call's terminal status; a `Scatter`
/// node's outcome mirrors its collector's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    Pending,
    Succeeded,
    Failed,
    Aborted,
}

impl NodeOutcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Nodes whose every upstream dependency has succeeded, and which are
/// themselves still pending — i.e. ready to become a Call or invoke the
/// Scatter Expander (spec.md §4.G).
pub fn ready_nodes(graph: &TaskGraph, outcomes: &HashMap<String, NodeOutcome>) -> Vec<String> {
    graph
        .nodes()
        .iter()
        .filter(|node| outcomes.get(&node.name).copied().unwrap_or(NodeOutcome::Pending) == NodeOutcome::Pending)
        .filter(|node| {
            node.depends_on
                .iter()
                .all(|dep| outcomes.get(dep).copied() == Some(NodeOutcome::Succeeded))
        })
        .map(|node| node.name.clone())
        .collect()
}

/// Whether the whole workflow has reached a terminal status, per
/// spec.md §4.G: Succeeded when every output-expression node has
/// evaluated (i.e. every node succeeded); Failed when any Call reaches
/// Failed with no attempts remaining and no `continueOnFailure`.
pub fn evaluate_workflow_status(
    graph: &TaskGraph,
    outcomes: &HashMap<String, NodeOutcome>,
    any_failed_without_continuation: bool,
) -> Option<WorkflowStatus> {
    if any_failed_without_continuation {
        return Some(WorkflowStatus::Failed);
    }
    let all_succeeded = graph
        .nodes()
        .iter()
        .all(|n| outcomes.get(&n.name).copied() == Some(NodeOutcome::Succeeded));
    if all_succeeded {
        Some(WorkflowStatus::Succeeded)
    } else {
        None
    }
}

/// Output-expression nodes evaluate only once every node they reference
/// has a value, which — since an `OutputExpression` node's
/// `depends_on` already lists those references — is exactly
/// [`ready_nodes`]'s definition of ready. Kept as a named helper since
/// spec.md calls this out as a distinct node kind.
pub fn is_output_expression(graph: &TaskGraph, node_name: &str) -> bool {
    matches!(
        graph.node(node_name).map(|n| &n.kind),
        Some(NodeKind::OutputExpression)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GraphNode;

    fn graph() -> TaskGraph {
        TaskGraph::new(vec![
            GraphNode {
                name: "a".into(),
                kind: NodeKind::TaskCall,
                depends_on: vec![],
            },
            GraphNode {
                name: "b".into(),
                kind: NodeKind::TaskCall,
                depends_on: vec!["a".into()],
            },
            GraphNode {
                name: "out".into(),
                kind: NodeKind::OutputExpression,
                depends_on: vec!["b".into()],
            },
        ])
        .unwrap()
    }

    #[test]
    fn root_nodes_are_ready_immediately() {
        let g = graph();
        let outcomes = HashMap::new();
        assert_eq!(ready_nodes(&g, &outcomes), vec!["a".to_string()]);
    }

    #[test]
    fn downstream_node_ready_once_upstream_succeeds() {
        let g = graph();
        let mut outcomes = HashMap::new();
        outcomes.insert("a".to_string(), NodeOutcome::Succeeded);
        assert_eq!(ready_nodes(&g, &outcomes), vec!["b".to_string()]);
    }

    #[test]
    fn workflow_succeeds_when_all_nodes_succeed() {
        let g = graph();
        let mut outcomes = HashMap::new();
        for name in ["a", "b", "out"] {
            outcomes.insert(name.to_string(), NodeOutcome::Succeeded);
        }
        assert_eq!(
            evaluate_workflow_status(&g, &outcomes, false),
            Some(WorkflowStatus::Succeeded)
        );
    }

    #[test]
    fn workflow_fails_on_unrecoverable_call_failure() {
        let g = graph();
        let outcomes = HashMap::new();
        assert_eq!(
            evaluate_workflow_status(&g, &outcomes, true),
            Some(WorkflowStatus::Failed)
        );
    }

    #[test]
    fn workflow_not_terminal_while_nodes_pending() {
        let g = graph();
        let mut outcomes = HashMap::new();
        outcomes.insert("a".to_string(), NodeOutcome::Succeeded);
        assert_eq!(evaluate_workflow_status(&g, &outcomes, false), None);
    }

    #[test]
    fn output_expression_node_is_identified() {
        let g = graph();
        assert!(is_output_expression(&g, "out"));
        assert!(!is_output_expression(&g, "a"));
    }
}
