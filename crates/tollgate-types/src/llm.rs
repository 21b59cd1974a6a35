//! LLM request types for Tollgate.
//!
//! The engine speaks to a model only through these shapes; how a provider
//! maps them onto a vendor API is its own business.

use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::tool::ToolSchema;

/// Request to an LLM provider for the next assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
    /// Capabilities the model may propose calls to.
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
}

/// Errors from LLM provider operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider error: {message}")]
    Provider { message: String },

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("response was not an assistant message")]
    UnexpectedRole,
}
