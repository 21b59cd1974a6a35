//! The reasoning / approval / execution workflow.
//!
//! - `prompt`: `PromptTemplate` with `{name}` placeholders
//! - `prefill`: `DefaultValuePolicy` and the shipped `FirstEntriesPolicy`
//! - `reasoning`: model turn plus the router that sends tool calls to approval
//! - `approval`: suspend for a human decision, then apply it
//! - `execution`: invoke the approved call and record the result

pub mod approval;
pub mod execution;
pub mod prefill;
pub mod prompt;
pub mod reasoning;

use std::sync::Arc;

use tollgate_types::config::TollgateConfig;

use crate::llm::BoxLlmProvider;
use crate::tool::ToolRegistry;
use crate::workflow::graph::{CompiledGraph, END, GraphBuilder, GraphError};

pub use approval::ApprovalNode;
pub use execution::ExecutionNode;
pub use prefill::{DefaultValuePolicy, FirstEntriesPolicy, NoDefaults};
pub use prompt::{PromptError, PromptTemplate};
pub use reasoning::{ReasoningNode, route_after_reasoning};

pub const REASONING: &str = "reasoning";
pub const APPROVAL: &str = "approval";
pub const EXECUTION: &str = "execution";

/// Wire the three nodes into the reasoning -> approval -> execution loop.
///
/// Reasoning routes to approval when the model proposed a call and to the
/// terminal otherwise; approval commands its way to execution or back to
/// reasoning; execution always returns to reasoning.
pub fn approval_workflow(
    reasoning: ReasoningNode,
    approval: ApprovalNode,
    execution: ExecutionNode,
) -> Result<CompiledGraph, GraphError> {
    GraphBuilder::new()
        .add_node(REASONING, reasoning)
        .add_node(APPROVAL, approval)
        .add_node(EXECUTION, execution)
        .set_entry(REASONING)
        .add_conditional_edges(REASONING, route_after_reasoning, &[APPROVAL, END])
        .allow_commands(APPROVAL, &[EXECUTION, REASONING])
        .add_edge(EXECUTION, REASONING)
        .compile()
}

/// Build the workflow from configuration, pre-filling with [`FirstEntriesPolicy`].
pub fn build_workflow(
    llm: BoxLlmProvider,
    tools: Arc<ToolRegistry>,
    template: PromptTemplate,
    config: &TollgateConfig,
) -> Result<CompiledGraph, GraphError> {
    let policy = Arc::new(FirstEntriesPolicy::new(config.prefill.clone()));
    approval_workflow(
        ReasoningNode::new(llm, Arc::clone(&tools), template),
        ApprovalNode::new(Arc::clone(&tools), config.approval.clone(), policy),
        ExecutionNode::new(tools),
    )
}
