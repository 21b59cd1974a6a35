//! Execution node: invokes the approved tool call and records the result.

use std::sync::Arc;

use serde_json::{Value, json};

use tollgate_types::message::Message;
use tollgate_types::tool::ToolError;

use crate::tool::ToolRegistry;
use crate::workflow::node::{Node, NodeContext, NodeError, NodeOutput};

use super::approval::{skip_unreviewed, target_call};

pub struct ExecutionNode {
    tools: Arc<ToolRegistry>,
}

impl ExecutionNode {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

impl Node for ExecutionNode {
    async fn run<'a>(&'a self, ctx: NodeContext<'a>) -> Result<NodeOutput, NodeError> {
        let (message, call) = target_call(ctx.state)?;
        let update = skip_unreviewed(ctx.state, message);

        let result = self
            .tools
            .invoke(call.name(), call.arguments(), ctx.cancel)
            .await;

        let reply = match result {
            Ok(value) => {
                tracing::debug!(run_id = ctx.run_id, capability = call.name(), "capability succeeded");
                let content = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Message::tool_result(call.id(), content)
            }
            Err(ToolError::NotFound(name)) => return Err(NodeError::CapabilityNotFound(name)),
            Err(err) => {
                tracing::warn!(
                    run_id = ctx.run_id,
                    capability = call.name(),
                    error = %err,
                    "capability failed; reporting failure to the model"
                );
                let payload = json!({
                    "error": err.to_string(),
                    "capability": call.name(),
                });
                Message::tool_failure(call.id(), payload.to_string())
            }
        };

        Ok(NodeOutput::Update(update.then_append(reply)))
    }
}
