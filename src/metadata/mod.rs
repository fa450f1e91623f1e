//! Metadata Publisher (spec.md §4.I)
//!
//! An append-only event stream keyed by (workflow id, optional call key,
//! key path, timestamp, value), fed by every state transition after its
//! persistence transaction commits (spec.md §4.H: "metadata events are
//! emitted only after the transaction commits"). Shaped after
//! `durable::worker::backpressure`'s bounded, load-aware state: a
//! fire-and-forget channel that prefers dropping an event over blocking
//! the caller, with loss surfaced through `tracing` rather than an error
//! the caller must handle.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::call::{CallStatus, CallKey};
use crate::model::{WorkflowId, WorkflowStatus};

/// One metadata fact. `call_key` is `None` for workflow-level events
/// (e.g. the `Submitted -> Running` transition).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEvent {
    pub workflow_id: WorkflowId,
    pub call_key: Option<CallKey>,
    pub key_path: String,
    pub value: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl MetadataEvent {
    fn new(workflow_id: WorkflowId, call_key: Option<CallKey>, key_path: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            workflow_id,
            call_key,
            key_path: key_path.into(),
            value,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn workflow_status(workflow_id: WorkflowId, status: WorkflowStatus) -> Self {
        Self::new(workflow_id, None, "status", serde_json::Value::String(status.to_string()))
    }

    pub fn call_status(call_key: CallKey, status: CallStatus) -> Self {
        Self::new(
            call_key.workflow_id,
            Some(call_key),
            "status",
            serde_json::Value::String(format!("{status:?}")),
        )
    }

    /// A runtime-attributes snapshot, recorded at Call start (spec.md §4.I).
    pub fn runtime_attributes(call_key: CallKey, attributes: serde_json::Value) -> Self {
        Self::new(call_key.workflow_id, Some(call_key), "runtimeAttributes", attributes)
    }

    /// Detritus path registration, recorded once a Call has a call root
    /// (spec.md §4.I).
    pub fn detritus_path(call_key: CallKey, detritus_key: &str, path: &str) -> Self {
        Self::new(
            call_key.workflow_id,
            Some(call_key),
            format!("detritus:{detritus_key}"),
            serde_json::Value::String(path.to_string()),
        )
    }
}

/// Errors are not surfaced to callers (spec.md §4.I: "fire-and-forget
/// with bounded buffering; loss is permitted but must be logged") —
/// this type exists only so [`MetadataPublisher::publish`] has a
/// distinguishable test-observable outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    Dropped,
}

/// Bounded, non-blocking publisher. `publish` never awaits: a full
/// buffer drops the event rather than back-pressuring the Call/Workflow
/// state machine that's reporting it.
#[derive(Clone)]
pub struct MetadataPublisher {
    sender: mpsc::Sender<MetadataEvent>,
}

impl MetadataPublisher {
    /// `capacity` bounds the buffer; a typical deployment sizes it to a
    /// few seconds of peak event volume, same tradeoff as
    /// `durable::worker::backpressure`'s watermark sizing.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MetadataEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    pub fn publish(&self, event: MetadataEvent) -> PublishOutcome {
        match self.sender.try_send(event) {
            Ok(()) => PublishOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    workflow_id = %event.workflow_id,
                    key_path = %event.key_path,
                    "metadata event dropped: publisher buffer full"
                );
                PublishOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(
                    workflow_id = %event.workflow_id,
                    key_path = %event.key_path,
                    "metadata event dropped: publisher closed"
                );
                PublishOutcome::Dropped
            }
        }
    }
}

/// A trivial no-op sink for callers (e.g. the local backend's own unit
/// tests) that don't want to drain a channel themselves.
pub struct NullPublisher;

impl NullPublisher {
    pub fn install(capacity: usize) -> MetadataPublisher {
        let (publisher, mut receiver) = MetadataPublisher::new(capacity);
        tokio::spawn(async move { while receiver.recv().await.is_some() {} });
        publisher
    }
}
