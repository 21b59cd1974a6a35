//! Reasoning node: asks the model for the next assistant turn.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use tollgate_types::llm::{CompletionRequest, LlmError};
use tollgate_types::message::{Message, MessageRole};
use tollgate_types::workflow::{StateUpdate, WorkflowState};

use crate::llm::BoxLlmProvider;
use crate::tool::ToolRegistry;
use crate::workflow::graph::END;
use crate::workflow::node::{Node, NodeContext, NodeError, NodeOutput};

use super::APPROVAL;
use super::prompt::{PromptError, PromptTemplate};

/// Trailing instruction sent with every model call. Never persisted.
pub const CONTINUE_INSTRUCTION: &str = "The tool results above are not visible to the user. \
If your answer relies on them, explain them to the user. \
Continue from where you left off without repeating prior content.";

pub struct ReasoningNode {
    llm: BoxLlmProvider,
    tools: Arc<ToolRegistry>,
    template: PromptTemplate,
    context: HashMap<String, String>,
}

impl ReasoningNode {
    pub fn new(llm: BoxLlmProvider, tools: Arc<ToolRegistry>, template: PromptTemplate) -> Self {
        Self {
            llm,
            tools,
            template,
            context: HashMap::new(),
        }
    }

    /// Add a prompt variable. Caller values win over connect-time context.
    pub fn with_context(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(name.into(), value.into());
        self
    }

    /// Render the system prompt for this turn.
    ///
    /// `system_time` is filled with the current RFC 3339 time unless the
    /// caller supplied it.
    pub fn system_prompt(&self) -> Result<String, PromptError> {
        let mut vars = self.tools.context().clone();
        vars.extend(self.context.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.entry("system_time".to_string())
            .or_insert_with(|| Utc::now().to_rfc3339());
        self.template.format(&vars)
    }
}

impl Node for ReasoningNode {
    async fn run<'a>(&'a self, ctx: NodeContext<'a>) -> Result<NodeOutput, NodeError> {
        let system = self.system_prompt()?;

        let mut messages = ctx.state.messages().to_vec();
        messages.push(Message::user(CONTINUE_INSTRUCTION));

        let request = CompletionRequest {
            system: Some(system),
            messages,
            tools: self.tools.visible_tools(),
        };

        let reply = self.llm.complete(&request, ctx.cancel).await?;
        if reply.role != MessageRole::Assistant {
            return Err(LlmError::UnexpectedRole.into());
        }

        tracing::debug!(
            run_id = ctx.run_id,
            provider = self.llm.name(),
            tool_calls = reply.tool_calls.len(),
            "model replied"
        );
        Ok(NodeOutput::Update(StateUpdate::append(reply)))
    }
}

/// Router for the reasoning node's conditional edge.
///
/// An assistant message carrying tool calls always goes to approval.
pub fn route_after_reasoning(state: &WorkflowState) -> String {
    match state.last_message() {
        Some(m) if m.role == MessageRole::Assistant && m.has_tool_calls() => APPROVAL.to_string(),
        _ => END.to_string(),
    }
}
