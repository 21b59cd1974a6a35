//! Connected tool registry.
//!
//! `ToolRegistry::connect` discovers every capability once, loads the
//! configured reference lists and prompt context through helper capabilities,
//! and keeps helpers listed in `hidden_capabilities` away from the model:
//! they are not offered, and [`ToolRegistry::schema`] and
//! [`ToolRegistry::invoke`] treat them as unknown. Only connect-time loading
//! reaches them. Discovery failure here is fatal: no run can start without a
//! registry.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use tollgate_types::config::{ContextSource, ReferenceSource, TollgateConfig};
use tollgate_types::tool::{ToolError, ToolSchema};

use super::box_provider::BoxToolProvider;

/// Named reference lists, keyed by `[[reference]].name`.
pub type ReferenceLists = HashMap<String, Vec<Value>>;

/// Errors raised while connecting a registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The provider was unreachable or discovery failed.
    #[error("tool provider connection failure: {0}")]
    ConnectionFailure(String),

    /// A reference or context source returned something unusable.
    #[error("invalid source '{name}': {reason}")]
    InvalidSource { name: String, reason: String },
}

/// Discovered capabilities plus connect-time data loaded from helper capabilities.
pub struct ToolRegistry {
    provider: BoxToolProvider,
    tools: Vec<ToolSchema>,
    hidden: HashSet<String>,
    references: ReferenceLists,
    context: HashMap<String, String>,
}

impl ToolRegistry {
    /// Discover capabilities and load reference lists and context values.
    pub async fn connect(
        provider: BoxToolProvider,
        config: &TollgateConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, RegistryError> {
        let tools = provider
            .discover()
            .await
            .map_err(|e| RegistryError::ConnectionFailure(e.to_string()))?;

        tracing::info!(
            provider = provider.name(),
            tools = tools.len(),
            "connected to tool provider"
        );

        let hidden: HashSet<String> = config.hidden_capabilities.iter().cloned().collect();
        for name in &hidden {
            if !tools.iter().any(|t| &t.name == name) {
                tracing::warn!(capability = %name, "hidden capability was not discovered");
            }
        }

        let mut registry = Self {
            provider,
            tools,
            hidden,
            references: HashMap::new(),
            context: HashMap::new(),
        };

        for source in &config.reference {
            let list = registry.load_reference(source, cancel).await?;
            tracing::debug!(reference = %source.name, entries = list.len(), "loaded reference list");
            registry.references.insert(source.name.clone(), list);
        }

        for source in &config.context {
            let value = registry.load_context(source, cancel).await?;
            tracing::debug!(variable = %source.variable, bytes = value.len(), "loaded prompt context");
            registry.context.insert(source.variable.clone(), value);
        }

        Ok(registry)
    }

    /// Capabilities offered to the model (hidden helpers excluded).
    pub fn visible_tools(&self) -> Vec<ToolSchema> {
        self.visible().cloned().collect()
    }

    /// Schema of a capability the model may call. `None` for hidden helpers.
    pub fn schema(&self, name: &str) -> Option<&ToolSchema> {
        self.visible().find(|t| t.name == name)
    }

    pub fn is_hidden(&self, name: &str) -> bool {
        self.hidden.contains(name)
    }

    fn visible(&self) -> impl Iterator<Item = &ToolSchema> {
        self.tools.iter().filter(|t| !self.hidden.contains(&t.name))
    }

    pub fn references(&self) -> &ReferenceLists {
        &self.references
    }

    /// Context values loaded at connect time, keyed by prompt variable.
    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Invoke a capability the model may call. Hidden helpers are `NotFound`.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        if self.schema(name).is_none() {
            if self.is_hidden(name) {
                tracing::warn!(capability = name, "refused model call to a hidden capability");
            }
            return Err(ToolError::NotFound(name.to_string()));
        }
        self.provider.invoke(name, arguments, cancel).await
    }

    async fn fetch(
        &self,
        source_name: &str,
        capability: &str,
        arguments: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, RegistryError> {
        if !self.tools.iter().any(|t| t.name == capability) {
            return Err(RegistryError::InvalidSource {
                name: source_name.to_string(),
                reason: format!("capability '{capability}' was not discovered"),
            });
        }
        let value = self
            .provider
            .invoke(capability, arguments, cancel)
            .await
            .map_err(|e| RegistryError::ConnectionFailure(e.to_string()))?;
        Ok(decode_payload(value))
    }

    async fn load_reference(
        &self,
        source: &ReferenceSource,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, RegistryError> {
        let value = self
            .fetch(&source.name, &source.capability, &source.arguments, cancel)
            .await?;

        let target = match &source.pointer {
            Some(pointer) => value.pointer(pointer).cloned().ok_or_else(|| {
                RegistryError::InvalidSource {
                    name: source.name.clone(),
                    reason: format!("pointer '{pointer}' matched nothing"),
                }
            })?,
            None => value,
        };

        match target {
            Value::Array(items) => Ok(items),
            other => Err(RegistryError::InvalidSource {
                name: source.name.clone(),
                reason: format!("expected an array, got {}", json_kind(&other)),
            }),
        }
    }

    async fn load_context(
        &self,
        source: &ContextSource,
        cancel: &CancellationToken,
    ) -> Result<String, RegistryError> {
        let value = self
            .fetch(&source.variable, &source.capability, &source.arguments, cancel)
            .await?;

        Ok(match value {
            Value::Array(items) => render_csv(&items),
            Value::String(s) => s,
            other => other.to_string(),
        })
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("provider", &self.provider.name())
            .field("tools", &self.tools.len())
            .field("hidden", &self.hidden)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Helper capabilities often return JSON encoded as text.
fn decode_payload(value: Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        other => other,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Render rows as CSV with a quoted header line.
///
/// Columns are the union of object keys in first-seen order. Strings are
/// quoted, numbers and booleans are bare, nulls and missing keys are empty.
pub fn render_csv(rows: &[Value]) -> String {
    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        if let Value::Object(map) = row {
            for key in map.keys() {
                if !columns.contains(&key.as_str()) {
                    columns.push(key);
                }
            }
        }
    }

    if columns.is_empty() {
        return rows.iter().map(csv_cell).collect::<Vec<_>>().join("\n");
    }

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(
        columns
            .iter()
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(","),
    );
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| row.get(*c).map(csv_cell).unwrap_or_default())
            .collect();
        lines.push(cells.join(","));
    }
    lines.join("\n")
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        other => quote(&other.to_string()),
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}
