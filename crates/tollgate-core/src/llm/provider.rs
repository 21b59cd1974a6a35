//! LlmProvider trait definition.
//!
//! The engine never talks to a model vendor directly. Everything it needs is
//! a single call: given the system prompt, the history and the capabilities
//! the model may use, produce the next assistant message.

use tokio_util::sync::CancellationToken;

use tollgate_types::llm::{CompletionRequest, LlmError};
use tollgate_types::message::Message;

/// Trait for LLM provider backends.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). Wrap an
/// implementation in [`BoxLlmProvider`](super::BoxLlmProvider) to select it at
/// runtime.
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name (e.g., "anthropic", "scripted").
    fn name(&self) -> &str;

    /// Produce the next assistant message, optionally proposing tool calls.
    ///
    /// Implementations should stop early and return an error once `cancel`
    /// fires; the engine discards whatever they return after that point.
    fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> impl std::future::Future<Output = Result<Message, LlmError>> + Send;
}
