//! Capability (tool) descriptions and invocation errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// A discovered capability and its argument schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the argument object.
    #[serde(default = "empty_object")]
    pub input_schema: Value,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// Field names listed under the schema's top-level `required` array.
    pub fn required_fields(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| fields.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn requires(&self, field: &str) -> bool {
        self.required_fields().contains(&field)
    }
}

/// Errors from tool provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The provider does not know this capability.
    #[error("capability not found: {0}")]
    NotFound(String),

    /// The capability ran and reported a failure.
    #[error("capability '{capability}' failed: {message}")]
    Execution { capability: String, message: String },

    /// The provider could not be reached.
    #[error("tool provider connection error: {0}")]
    Connection(String),
}
