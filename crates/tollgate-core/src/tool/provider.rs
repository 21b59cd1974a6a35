//! ToolProvider trait definition.

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use tollgate_types::tool::{ToolError, ToolSchema};

/// Trait for capability providers (an MCP server, an in-process table, ...).
///
/// Implementations live outside this crate; the engine only discovers and
/// invokes capabilities by name.
pub trait ToolProvider: Send + Sync {
    /// Human-readable provider name.
    fn name(&self) -> &str;

    /// List every capability the provider offers.
    fn discover(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ToolSchema>, ToolError>> + Send;

    /// Invoke a capability with the given argument mapping.
    fn invoke(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> impl std::future::Future<Output = Result<Value, ToolError>> + Send;
}
