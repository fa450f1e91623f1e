//! Scatter Expander (spec.md §4.F)
//!
//! No teacher module maps onto this directly — `durable` has no notion
//! of fan-out/collect. Shaped after the attempt/array bookkeeping
//! conventions [`crate::call::Call`] itself uses, so the two modules
//! read as one idiom rather than two styles glued together.

use serde::{Deserialize, Serialize};

use crate::model::{CallKey, ShardIndex, WorkflowId};

/// A scatter node expanded into its shard Calls plus one collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScatterGroup {
    pub workflow_id: WorkflowId,
    pub node_name: String,
    pub shard_keys: Vec<CallKey>,
    pub collector_status: CollectorStatus,
}

/// The collector's own lifecycle — deliberately narrower than
/// [`crate::call::CallStatus`]; a collector is never dispatched to a
/// backend, it just projects shard outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum ScatterError {
    #[error("collector {0} cannot leave NotStarted until all {1} shards are terminal")]
    ShardsNotTerminal(String, usize),
    #[error("empty collection expression for scatter node {0}")]
    EmptyCollection(String),
}

/// Expand a scatter node with collection length `length` into `length`
/// indexed shard keys (spec.md §4.F: "shards 0..L-1").
pub fn expand_shards(
    workflow_id: WorkflowId,
    node_name: &str,
    length: usize,
) -> Result<Vec<CallKey>, ScatterError> {
    if length == 0 {
        return Err(ScatterError::EmptyCollection(node_name.to_string()));
    }
    Ok((0..length as u32)
        .map(|idx| CallKey::first_attempt(workflow_id, node_name, ShardIndex::Some(idx)))
        .collect())
}

impl ScatterGroup {
    pub fn new(workflow_id: WorkflowId, node_name: impl Into<String>, shard_keys: Vec<CallKey>) -> Self {
        Self {
            workflow_id,
            node_name: node_name.into(),
            shard_keys,
            collector_status: CollectorStatus::NotStarted,
        }
    }

    /// Attempt to materialize the collector given each shard's terminal
    /// status (spec.md §4.F invariant: "collector cannot transition out
    /// of NotStarted until all shards are terminal"). `continue_on_failure`
    /// determines whether one Failed shard fails the whole collector or
    /// is tolerated in the projection.
    pub fn try_collect(
        &mut self,
        shard_statuses: &[crate::call::CallStatus],
        continue_on_failure: bool,
    ) -> Result<CollectorStatus, ScatterError> {
        if shard_statuses.len() != self.shard_keys.len() {
            return Err(ScatterError::ShardsNotTerminal(
                self.node_name.clone(),
                self.shard_keys.len(),
            ));
        }
        if !shard_statuses.iter().all(|s| s.is_terminal()) {
            return Ok(self.collector_status);
        }
        let any_failed = shard_statuses
            .iter()
            .any(|s| matches!(s, crate::call::CallStatus::Failed | crate::call::CallStatus::Aborted));
        self.collector_status = if any_failed && !continue_on_failure {
            CollectorStatus::Failed
        } else {
            CollectorStatus::Succeeded
        };
        Ok(self.collector_status)
    }

    /// Sibling-abort policy: on a shard failure without `continueOnFailure`,
    /// every other non-terminal shard must be aborted (spec.md §4.F).
    pub fn siblings_to_abort(
        &self,
        failed_shard: &CallKey,
        shard_statuses: &[(CallKey, crate::call::CallStatus)],
        continue_on_failure: bool,
    ) -> Vec<CallKey> {
        if continue_on_failure {
            return Vec::new();
        }
        shard_statuses
            .iter()
            .filter(|(key, status)| key != failed_shard && !status.is_terminal())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// A `Running` collector at restart must reset to `NotStarted`
    /// (spec.md §4.F: "shards are idempotent recomputations of the
    /// projection, not of the tasks").
    pub fn reset_running_collector_on_restart(&mut self) {
        if self.collector_status == CollectorStatus::Running {
            self.collector_status = CollectorStatus::NotStarted;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallStatus;

    #[test]
    fn expand_shards_produces_indexed_keys() {
        let wf = WorkflowId::new();
        let shards = expand_shards(wf, "per_sample", 3).unwrap();
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].shard, Some(0));
        assert_eq!(shards[2].shard, Some(2));
    }

    #[test]
    fn empty_collection_is_rejected() {
        let wf = WorkflowId::new();
        assert!(matches!(
            expand_shards(wf, "per_sample", 0),
            Err(ScatterError::EmptyCollection(_))
        ));
    }

    #[test]
    fn collector_waits_for_all_shards_terminal() {
        let wf = WorkflowId::new();
        let shards = expand_shards(wf, "per_sample", 2).unwrap();
        let mut group = ScatterGroup::new(wf, "per_sample", shards);
        let result = group
            .try_collect(&[CallStatus::Running, CallStatus::Succeeded], false)
            .unwrap();
        assert_eq!(result, CollectorStatus::NotStarted);
    }

    #[test]
    fn collector_succeeds_when_all_shards_succeed() {
        let wf = WorkflowId::new();
        let shards = expand_shards(wf, "per_sample", 2).unwrap();
        let mut group = ScatterGroup::new(wf, "per_sample", shards);
        let result = group
            .try_collect(&[CallStatus::Succeeded, CallStatus::Succeeded], false)
            .unwrap();
        assert_eq!(result, CollectorStatus::Succeeded);
    }

    #[test]
    fn collector_fails_on_any_shard_failure_without_continue_on_failure() {
        let wf = WorkflowId::new();
        let shards = expand_shards(wf, "per_sample", 2).unwrap();
        let mut group = ScatterGroup::new(wf, "per_sample", shards);
        let result = group
            .try_collect(&[CallStatus::Succeeded, CallStatus::Failed], false)
            .unwrap();
        assert_eq!(result, CollectorStatus::Failed);
    }

    #[test]
    fn continue_on_failure_tolerates_a_failed_shard() {
        let wf = WorkflowId::new();
        let shards = expand_shards(wf, "per_sample", 2).unwrap();
        let mut group = ScatterGroup::new(wf, "per_sample", shards);
        let result = group
            .try_collect(&[CallStatus::Succeeded, CallStatus::Failed], true)
            .unwrap();
        assert_eq!(result, CollectorStatus::Succeeded);
    }

    #[test]
    fn sibling_abort_excludes_terminal_and_failed_shard() {
        let wf = WorkflowId::new();
        let shards = expand_shards(wf, "per_sample", 3).unwrap();
        let group = ScatterGroup::new(wf, "per_sample", shards.clone());
        let statuses = vec![
            (shards[0].clone(), CallStatus::Failed),
            (shards[1].clone(), CallStatus::Running),
            (shards[2].clone(), CallStatus::Succeeded),
        ];
        let to_abort = group.siblings_to_abort(&shards[0], &statuses, false);
        assert_eq!(to_abort, vec![shards[1].clone()]);
    }

    #[test]
    fn restart_resets_running_collector_to_not_started() {
        let wf = WorkflowId::new();
        let shards = expand_shards(wf, "per_sample", 1).unwrap();
        let mut group = ScatterGroup::new(wf, "per_sample", shards);
        group.collector_status = CollectorStatus::Running;
        group.reset_running_collector_on_restart();
        assert_eq!(group.collector_status, CollectorStatus::NotStarted);
    }
}
