//! BoxToolProvider -- object-safe dynamic dispatch wrapper for ToolProvider.
//!
//! Same blanket-impl pattern as `BoxLlmProvider`.

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use tollgate_types::tool::{ToolError, ToolSchema};

use super::provider::ToolProvider;

/// Object-safe version of [`ToolProvider`] with boxed futures.
pub trait ToolProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn discover_boxed(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ToolSchema>, ToolError>> + Send + '_>>;

    fn invoke_boxed<'a>(
        &'a self,
        name: &'a str,
        arguments: &'a Map<String, Value>,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;
}

impl<T: ToolProvider> ToolProviderDyn for T {
    fn name(&self) -> &str {
        ToolProvider::name(self)
    }

    fn discover_boxed(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ToolSchema>, ToolError>> + Send + '_>> {
        Box::pin(self.discover())
    }

    fn invoke_boxed<'a>(
        &'a self,
        name: &'a str,
        arguments: &'a Map<String, Value>,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>> {
        Box::pin(self.invoke(name, arguments, cancel))
    }
}

/// Type-erased tool provider.
pub struct BoxToolProvider {
    inner: Box<dyn ToolProviderDyn + Send + Sync>,
}

impl BoxToolProvider {
    /// Wrap a concrete `ToolProvider` in a type-erased box.
    pub fn new<T: ToolProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn discover(&self) -> Result<Vec<ToolSchema>, ToolError> {
        self.inner.discover_boxed().await
    }

    pub async fn invoke(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        self.inner.invoke_boxed(name, arguments, cancel).await
    }
}

impl std::fmt::Debug for BoxToolProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxToolProvider")
            .field("name", &self.inner.name())
            .finish()
    }
}
