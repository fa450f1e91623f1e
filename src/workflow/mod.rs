//! Workflow State Machine (spec.md §4.G)
//!
//! - [`runtime`] — ready-node detection and terminal-status evaluation
//!   over [`crate::model::TaskGraph`]
//! - [`restart`] — the engine-start recovery rules for non-terminal
//!   workflows

pub mod restart;
pub mod runtime;

pub use restart::{classify_restart, reset_running_collectors, RestartAction, RestartError};
pub use runtime::{evaluate_workflow_status, is_output_expression, ready_nodes, NodeOutcome};
