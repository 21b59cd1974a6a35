//! The node contract.
//!
//! A node reads the current state (and, when re-entered after a suspension,
//! the pending request plus the human's response) and returns a
//! [`NodeOutput`]. Nodes never touch the checkpoint store or the state
//! directly; the engine applies their updates.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use tollgate_types::approval::{ApprovalRequest, ApprovalResponse};
use tollgate_types::llm::LlmError;
use tollgate_types::workflow::{StateUpdate, WorkflowState};

use crate::agent::prompt::PromptError;

/// What a node asks the engine to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    /// Apply the update, then follow the node's static or conditional edge.
    Update(StateUpdate),
    /// Apply the update, then jump to `goto` (must be in the node's allow-list).
    Command { goto: String, update: StateUpdate },
    /// Apply the update, persist, and wait for a human decision.
    Suspend {
        request: ApprovalRequest,
        update: StateUpdate,
    },
}

impl NodeOutput {
    pub fn command(goto: impl Into<String>, update: StateUpdate) -> Self {
        NodeOutput::Command {
            goto: goto.into(),
            update,
        }
    }
}

/// The outstanding request and the authoritative response to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeInput {
    pub request: ApprovalRequest,
    pub response: ApprovalResponse,
}

/// Everything a node sees for one step.
#[derive(Debug, Clone, Copy)]
pub struct NodeContext<'a> {
    pub run_id: &'a str,
    pub state: &'a WorkflowState,
    /// Present only when the node is re-entered after its own suspension.
    pub resume: Option<&'a ResumeInput>,
    pub cancel: &'a CancellationToken,
}

/// Errors a node can raise. All of them abort the current invocation.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("malformed decision: {0}")]
    MalformedDecision(String),

    #[error("no tool call to act on")]
    NoToolCall,

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// A step in the workflow graph.
///
/// Uses native async fn in traits; the graph stores nodes through the
/// object-safe [`NodeDyn`] blanket impl.
pub trait Node: Send + Sync {
    fn run<'a>(
        &'a self,
        ctx: NodeContext<'a>,
    ) -> impl Future<Output = Result<NodeOutput, NodeError>> + Send + 'a;
}

/// Object-safe version of [`Node`] with a boxed future.
pub trait NodeDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        ctx: NodeContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<NodeOutput, NodeError>> + Send + 'a>>;
}

impl<T: Node> NodeDyn for T {
    fn run_boxed<'a>(
        &'a self,
        ctx: NodeContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<NodeOutput, NodeError>> + Send + 'a>> {
        Box::pin(self.run(ctx))
    }
}
