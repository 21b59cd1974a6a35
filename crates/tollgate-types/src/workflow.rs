//! Workflow state, state updates, and durable checkpoints.
//!
//! `WorkflowState` is the append-only message history that flows through a
//! run. Nodes never mutate it directly: they return a [`StateUpdate`] which
//! the engine applies atomically. A [`Checkpoint`] is the persisted snapshot
//! of a run, including the node to re-enter and any outstanding suspension.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::approval::ApprovalRequest;
use crate::message::{Message, MessageRole};

// ---------------------------------------------------------------------------
// State updates
// ---------------------------------------------------------------------------

/// A single change to the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateOp {
    /// Append a message to the end of the history.
    Append(Message),
    /// Replace the arguments of an existing tool call. Identity and
    /// capability name are untouched.
    ReplaceToolArguments {
        message_id: Uuid,
        tool_call_id: String,
        arguments: Map<String, Value>,
    },
}

/// An ordered batch of [`StateOp`]s applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    ops: Vec<StateOp>,
}

impl StateUpdate {
    /// An update that changes nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// An update appending a single message.
    pub fn append(message: Message) -> Self {
        Self {
            ops: vec![StateOp::Append(message)],
        }
    }

    /// An update replacing one tool call's arguments.
    pub fn replace_arguments(
        message_id: Uuid,
        tool_call_id: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            ops: vec![StateOp::ReplaceToolArguments {
                message_id,
                tool_call_id: tool_call_id.into(),
                arguments,
            }],
        }
    }

    /// Chain another append after the existing operations.
    pub fn then_append(mut self, message: Message) -> Self {
        self.ops.push(StateOp::Append(message));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[StateOp] {
        &self.ops
    }
}

/// Violations of the history invariants.
#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("message {0} already exists in history")]
    DuplicateMessage(Uuid),

    #[error("message {message_id} repeats tool call id '{tool_call_id}'")]
    DuplicateToolCall {
        message_id: Uuid,
        tool_call_id: String,
    },

    #[error("tool result message {0} does not name a tool call")]
    MissingToolCallId(Uuid),

    #[error("message {0} not found in history")]
    MessageNotFound(Uuid),

    #[error("tool call '{tool_call_id}' not found on message {message_id}")]
    ToolCallNotFound {
        message_id: Uuid,
        tool_call_id: String,
    },
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// Append-only message history of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    messages: Vec<Message>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from an initial history, validating it as a series of appends.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self, StateError> {
        let mut state = Self::new();
        for message in messages {
            state.push_checked(message)?;
        }
        Ok(state)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The most recent assistant message, wherever it sits in the history.
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
    }

    /// Apply an update atomically: either every operation succeeds or the
    /// state is left untouched.
    pub fn apply(&mut self, update: StateUpdate) -> Result<(), StateError> {
        if update.is_empty() {
            return Ok(());
        }

        let mut next = self.clone();
        for op in update.ops {
            match op {
                StateOp::Append(message) => next.push_checked(message)?,
                StateOp::ReplaceToolArguments {
                    message_id,
                    tool_call_id,
                    arguments,
                } => {
                    let message = next
                        .messages
                        .iter_mut()
                        .find(|m| m.id == message_id)
                        .ok_or(StateError::MessageNotFound(message_id))?;
                    let call = message
                        .tool_calls
                        .iter_mut()
                        .find(|c| c.id() == tool_call_id)
                        .ok_or_else(|| StateError::ToolCallNotFound {
                            message_id,
                            tool_call_id: tool_call_id.clone(),
                        })?;
                    call.set_arguments(arguments);
                }
            }
        }

        *self = next;
        Ok(())
    }

    fn push_checked(&mut self, message: Message) -> Result<(), StateError> {
        if self.messages.iter().any(|m| m.id == message.id) {
            return Err(StateError::DuplicateMessage(message.id));
        }

        let mut seen = HashSet::new();
        for call in &message.tool_calls {
            if !seen.insert(call.id()) {
                return Err(StateError::DuplicateToolCall {
                    message_id: message.id,
                    tool_call_id: call.id().to_string(),
                });
            }
        }

        if message.role == MessageRole::Tool && message.tool_call_id.is_none() {
            return Err(StateError::MissingToolCallId(message.id));
        }

        self.messages.push(message);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run status and checkpoints
// ---------------------------------------------------------------------------

/// Lifecycle status of a run as recorded in its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Suspended => write!(f, "suspended"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "suspended" => Ok(RunStatus::Suspended),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Durable snapshot of a run, keyed by its thread id.
///
/// Exactly one checkpoint exists per run; every write replaces the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run (thread) identity.
    pub run_id: String,
    /// History as of the last committed node.
    pub state: WorkflowState,
    /// Node to re-enter on resume. `None` once the run reached the terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node: Option<String>,
    /// The outstanding suspension, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<ApprovalRequest>,
    /// The request whose decision a `Running` checkpoint is carrying out.
    /// Lets an interrupted resume be retried without re-applying the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<Uuid>,
    pub status: RunStatus,
    /// Total node executions over the run's lifetime.
    pub steps: u32,
    /// Failure message for `Failed` runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Whether this checkpoint holds a suspension awaiting a decision.
    pub fn is_suspended(&self) -> bool {
        self.status == RunStatus::Suspended && self.pending.is_some()
    }

    /// Whether an invocation was interrupted between nodes. `next_node` is
    /// where it picks up again.
    pub fn is_interrupted(&self) -> bool {
        self.status == RunStatus::Running && self.next_node.is_some()
    }
}
