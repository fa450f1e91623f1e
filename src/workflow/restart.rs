//! Workflow restart/recovery rules (spec.md §4.G)
//!
//! Grounded on `durable::engine::executor::WorkflowExecutor`'s recovery
//! path (`process_workflow` replaying history to resume a workflow after
//! a crash) — the shape of "load everything non-terminal, reclassify,
//! resume or reset" is the same; the classification rules themselves are
//! spec.md's own, since the teacher's workflows don't scatter or use a
//! resumable backend handle.

use crate::call::{Call, CallStatus};
use crate::scatter::{CollectorStatus, ScatterGroup};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RestartError {
    #[error("workflow restart rejected: call {0} is in a non-retriable terminal failure state")]
    FailedOrAbortedCallPresent(String),
    #[error("workflow restart rejected: scatter node {0} is Starting (ambiguous whether shards were created)")]
    ScatterStarting(String),
}

/// What to do with one non-`NotStarted`, non-`Succeeded` Call at restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartAction {
    /// `Starting` calls, and `Running` calls without a recorded external
    /// id ("transient"), reset to `NotStarted`.
    ResetToNotStarted,
    /// `Running` calls with a recorded external id are resumed through
    /// the backend's `resume`.
    Resume { external_id: String },
}

/// Classify every non-terminal Call for one workflow's restart
/// (spec.md §4.G). Rejects the whole restart (without mutating
/// anything) if any Call is `Failed`/`Aborted`, or any scatter node is
/// `Starting`.
pub fn classify_restart(
    calls: &[Call],
    scatter_starting_nodes: &[String],
) -> Result<Vec<(crate::model::CallKey, RestartAction)>, RestartError> {
    for call in calls {
        if matches!(call.status, CallStatus::Failed | CallStatus::Aborted) {
            return Err(RestartError::FailedOrAbortedCallPresent(call.key.to_string()));
        }
    }
    if let Some(node) = scatter_starting_nodes.first() {
        return Err(RestartError::ScatterStarting(node.clone()));
    }

    let mut actions = Vec::new();
    for call in calls {
        match call.status {
            CallStatus::NotStarted | CallStatus::Succeeded => continue,
            CallStatus::Starting => actions.push((call.key.clone(), RestartAction::ResetToNotStarted)),
            CallStatus::Running => match &call.external_id {
                Some(external_id) => actions.push((
                    call.key.clone(),
                    RestartAction::Resume {
                        external_id: external_id.clone(),
                    },
                )),
                None => actions.push((call.key.clone(), RestartAction::ResetToNotStarted)),
            },
            CallStatus::RetryableFailure | CallStatus::Preempted => {
                // A new attempt row for these would already be NotStarted;
                // the row itself carries no further restart action.
            }
            CallStatus::Failed | CallStatus::Aborted => unreachable!("rejected above"),
        }
    }
    Ok(actions)
}

/// Per-scatter-group restart rule: a `Running` collector resets to
/// `NotStarted` (spec.md §4.F/§4.G).
pub fn reset_running_collectors(groups: &mut [ScatterGroup]) {
    for group in groups {
        if group.collector_status == CollectorStatus::Running {
            group.reset_running_collector_on_restart();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CallKey, WorkflowId};

    fn call_with_status(status: CallStatus) -> Call {
        let mut call = Call::new(CallKey::first_attempt(WorkflowId::new(), "t", None), false);
        call.status = status;
        call
    }

    #[test]
    fn failed_call_rejects_restart() {
        let calls = vec![call_with_status(CallStatus::Failed)];
        let err = classify_restart(&calls, &[]).unwrap_err();
        assert!(matches!(err, RestartError::FailedOrAbortedCallPresent(_)));
    }

    #[test]
    fn aborted_call_rejects_restart() {
        let calls = vec![call_with_status(CallStatus::Aborted)];
        assert!(classify_restart(&calls, &[]).is_err());
    }

    #[test]
    fn scatter_starting_rejects_restart() {
        let calls = vec![call_with_status(CallStatus::Running)];
        let err = classify_restart(&calls, &["per_sample".to_string()]).unwrap_err();
        assert!(matches!(err, RestartError::ScatterStarting(_)));
    }

    #[test]
    fn starting_call_resets_to_not_started() {
        let calls = vec![call_with_status(CallStatus::Starting)];
        let actions = classify_restart(&calls, &[]).unwrap();
        assert_eq!(actions[0].1, RestartAction::ResetToNotStarted);
    }

    #[test]
    fn running_without_external_id_is_transient_and_resets() {
        let calls = vec![call_with_status(CallStatus::Running)];
        let actions = classify_restart(&calls, &[]).unwrap();
        assert_eq!(actions[0].1, RestartAction::ResetToNotStarted);
    }

    #[test]
    fn running_with_external_id_resumes() {
        let mut call = call_with_status(CallStatus::Running);
        call.external_id = Some("ext-123".to_string());
        let actions = classify_restart(&[call], &[]).unwrap();
        assert_eq!(
            actions[0].1,
            RestartAction::Resume {
                external_id: "ext-123".to_string()
            }
        );
    }

    #[test]
    fn not_started_and_succeeded_need_no_action() {
        let calls = vec![
            call_with_status(CallStatus::NotStarted),
            call_with_status(CallStatus::Succeeded),
        ];
        let actions = classify_restart(&calls, &[]).unwrap();
        assert!(actions.is_empty());
    }
}
