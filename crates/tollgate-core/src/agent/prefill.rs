//! Default values for required fields the model left out.
//!
//! A [`DefaultValuePolicy`] runs before a tool call is shown to a human, so
//! the request (and the persisted history) already carries the defaults.

use serde_json::{Map, Value};

use tollgate_types::config::PrefillRule;
use tollgate_types::tool::ToolSchema;

use crate::tool::registry::ReferenceLists;

/// Pluggable pre-fill strategy.
pub trait DefaultValuePolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Populate omitted fields in place. Returns the names of the fields filled.
    fn apply(
        &self,
        schema: &ToolSchema,
        arguments: &mut Map<String, Value>,
        references: &ReferenceLists,
    ) -> Vec<String>;
}

/// Leaves every call untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDefaults;

impl DefaultValuePolicy for NoDefaults {
    fn name(&self) -> &str {
        "none"
    }

    fn apply(&self, _: &ToolSchema, _: &mut Map<String, Value>, _: &ReferenceLists) -> Vec<String> {
        Vec::new()
    }
}

/// Copies the first `take` entries of a reference list into a required field.
///
/// A rule only fires when the capability schema lists the field under
/// `required` and the model omitted it (absent or `null`). With `fields`
/// set, each entry is projected onto those keys.
#[derive(Debug, Clone, Default)]
pub struct FirstEntriesPolicy {
    rules: Vec<PrefillRule>,
}

impl FirstEntriesPolicy {
    pub fn new(rules: Vec<PrefillRule>) -> Self {
        Self { rules }
    }
}

impl DefaultValuePolicy for FirstEntriesPolicy {
    fn name(&self) -> &str {
        "first_entries"
    }

    fn apply(
        &self,
        schema: &ToolSchema,
        arguments: &mut Map<String, Value>,
        references: &ReferenceLists,
    ) -> Vec<String> {
        let mut filled = Vec::new();

        for rule in self.rules.iter().filter(|r| r.capability == schema.name) {
            if !schema.requires(&rule.field) {
                continue;
            }
            if arguments.get(&rule.field).is_some_and(|v| !v.is_null()) {
                continue;
            }
            let Some(list) = references.get(&rule.reference) else {
                tracing::warn!(
                    capability = %rule.capability,
                    reference = %rule.reference,
                    "pre-fill reference list was not loaded"
                );
                continue;
            };
            if list.is_empty() {
                continue;
            }

            let entries: Vec<Value> = list
                .iter()
                .take(rule.take)
                .map(|entry| project(entry, rule.fields.as_deref()))
                .collect();

            tracing::debug!(
                capability = %rule.capability,
                field = %rule.field,
                entries = entries.len(),
                "pre-filled omitted field"
            );
            arguments.insert(rule.field.clone(), Value::Array(entries));
            filled.push(rule.field.clone());
        }

        filled
    }
}

fn project(entry: &Value, fields: Option<&[String]>) -> Value {
    match (entry, fields) {
        (Value::Object(map), Some(fields)) => Value::Object(
            map.iter()
                .filter(|(k, _)| fields.iter().any(|f| f == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        _ => entry.clone(),
    }
}
