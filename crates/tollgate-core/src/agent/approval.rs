//! Approval node: parks the run until a human rules on the proposed call.
//!
//! First entry builds an [`ApprovalRequest`] for the last tool call of the
//! last assistant message (after pre-fill) and suspends. Re-entry applies the
//! human's decision:
//!
//! | decision | next node   | state change                          |
//! |----------|-------------|---------------------------------------|
//! | accept   | execution   | none                                  |
//! | edit     | execution   | replace the call's arguments          |
//! | respond  | reasoning   | append a tool result with the payload |
//! | ignore   | --          | rejected as malformed                 |
//!
//! Only the last call of a message is reviewed. Whichever way the decision
//! goes, earlier calls in that message are answered as skipped.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;

use tollgate_types::approval::{ApprovalRequest, ApprovalResponse, DecisionKind};
use tollgate_types::config::ApprovalConfig;
use tollgate_types::message::{Message, ToolCall};
use tollgate_types::workflow::{StateUpdate, WorkflowState};

use crate::tool::ToolRegistry;
use crate::workflow::node::{Node, NodeContext, NodeError, NodeOutput, ResumeInput};

use super::prefill::DefaultValuePolicy;
use super::prompt::PromptTemplate;
use super::{EXECUTION, REASONING};

pub struct ApprovalNode {
    tools: Arc<ToolRegistry>,
    config: ApprovalConfig,
    policy: Arc<dyn DefaultValuePolicy>,
}

impl ApprovalNode {
    pub fn new(
        tools: Arc<ToolRegistry>,
        config: ApprovalConfig,
        policy: Arc<dyn DefaultValuePolicy>,
    ) -> Self {
        Self {
            tools,
            config,
            policy,
        }
    }

    fn request(&self, state: &WorkflowState) -> Result<NodeOutput, NodeError> {
        let (message, call) = target_call(state)?;
        let schema = self
            .tools
            .schema(call.name())
            .ok_or_else(|| NodeError::CapabilityNotFound(call.name().to_string()))?;

        let mut arguments = call.arguments().clone();
        let filled = self
            .policy
            .apply(schema, &mut arguments, self.tools.references());

        let update = if filled.is_empty() {
            StateUpdate::none()
        } else {
            StateUpdate::replace_arguments(message.id, call.id(), arguments.clone())
        };

        let mut vars = HashMap::new();
        vars.insert("capability".to_string(), call.name().to_string());
        vars.insert(
            "arguments".to_string(),
            Value::Object(arguments.clone()).to_string(),
        );
        let description = PromptTemplate::parse(self.config.description_for(call.name()))?
            .format(&vars)?;

        let request = ApprovalRequest {
            id: Uuid::now_v7(),
            tool_call_id: call.id().to_string(),
            capability: call.name().to_string(),
            arguments,
            allowed: self.config.allowed_for(call.name()).to_vec(),
            description,
        };

        tracing::debug!(
            capability = %request.capability,
            tool_call_id = %request.tool_call_id,
            prefilled = ?filled,
            "requesting approval"
        );
        Ok(NodeOutput::Suspend { request, update })
    }

    fn decide(&self, state: &WorkflowState, input: &ResumeInput) -> Result<NodeOutput, NodeError> {
        let ResumeInput { request, response } = input;
        let (message, call) = target_call(state)?;
        if call.id() != request.tool_call_id {
            return Err(NodeError::MalformedDecision(format!(
                "request {} targets tool call '{}', but the pending call is '{}'",
                request.id,
                request.tool_call_id,
                call.id()
            )));
        }

        let kind = response.kind();
        if kind == DecisionKind::Ignore || !request.permits(kind) {
            return Err(NodeError::MalformedDecision(format!(
                "'{kind}' is not a permitted decision for {}",
                request.capability
            )));
        }

        match response {
            ApprovalResponse::Accept => Ok(NodeOutput::command(EXECUTION, StateUpdate::none())),
            ApprovalResponse::Edit { args } => Ok(NodeOutput::command(
                EXECUTION,
                StateUpdate::replace_arguments(message.id, call.id(), args.clone()),
            )),
            ApprovalResponse::Respond { args } => {
                let content = match args {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let update = skip_unreviewed(state, message)
                    .then_append(Message::tool_result(call.id(), content));
                Ok(NodeOutput::command(REASONING, update))
            }
            ApprovalResponse::Ignore => Err(NodeError::MalformedDecision(
                "ignore is not supported".to_string(),
            )),
        }
    }
}

impl Node for ApprovalNode {
    async fn run<'a>(&'a self, ctx: NodeContext<'a>) -> Result<NodeOutput, NodeError> {
        match ctx.resume {
            None => self.request(ctx.state),
            Some(input) => self.decide(ctx.state, input),
        }
    }
}

/// Last tool call of the last assistant message.
pub(crate) fn target_call(state: &WorkflowState) -> Result<(&Message, &ToolCall), NodeError> {
    let message = state.last_assistant().ok_or(NodeError::NoToolCall)?;
    let call = message.last_tool_call().ok_or(NodeError::NoToolCall)?;
    Ok((message, call))
}

/// Failure results for the calls of `message` before its last one that have
/// no answer in `state` yet.
pub(crate) fn skip_unreviewed(state: &WorkflowState, message: &Message) -> StateUpdate {
    let earlier = &message.tool_calls[..message.tool_calls.len().saturating_sub(1)];
    earlier
        .iter()
        .filter(|call| {
            !state
                .messages()
                .iter()
                .any(|m| m.tool_call_id.as_deref() == Some(call.id()))
        })
        .fold(StateUpdate::none(), |update, call| {
            let payload = json!({
                "error": "skipped: only the last proposed call is reviewed and executed",
                "capability": call.name(),
            });
            update.then_append(Message::tool_failure(call.id(), payload.to_string()))
        })
}
