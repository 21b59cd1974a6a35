//! Event types for the Tollgate workflow event bus.
//!
//! `WorkflowEvent` is broadcast as runs move through their lifecycle.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::DecisionKind;

/// Events emitted while a run executes, suspends, and resumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A run started (or a completed thread was continued).
    RunStarted { run_id: String, continued: bool },

    /// A node finished and the engine chose the next node.
    NodeCompleted {
        run_id: String,
        node: String,
        next: String,
        duration_ms: u64,
    },

    /// A run parked awaiting a human decision.
    RunSuspended {
        run_id: String,
        request_id: Uuid,
        capability: String,
    },

    /// A suspended run received a decision and is continuing.
    RunResumed {
        run_id: String,
        request_id: Uuid,
        decision: DecisionKind,
    },

    /// An invocation interrupted between nodes was picked up again at `node`.
    RunRecovered { run_id: String, node: String },

    /// A batched decision carried more than one response; the extras were dropped.
    DecisionsDiscarded {
        run_id: String,
        request_id: Uuid,
        discarded: usize,
    },

    /// A run reached the terminal node.
    RunCompleted {
        run_id: String,
        steps: u32,
        messages: usize,
    },

    /// A run aborted with a fatal error.
    RunFailed { run_id: String, error: String },
}

impl WorkflowEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::NodeCompleted { run_id, .. }
            | WorkflowEvent::RunSuspended { run_id, .. }
            | WorkflowEvent::RunResumed { run_id, .. }
            | WorkflowEvent::RunRecovered { run_id, .. }
            | WorkflowEvent::DecisionsDiscarded { run_id, .. }
            | WorkflowEvent::RunCompleted { run_id, .. }
            | WorkflowEvent::RunFailed { run_id, .. } => run_id,
        }
    }
}
