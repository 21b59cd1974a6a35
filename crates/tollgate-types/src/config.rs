//! Configuration types for Tollgate.
//!
//! `TollgateConfig` represents the top-level `config.toml`: engine limits,
//! approval call-site permissions, default-value (pre-fill) rules, connect-time
//! reference and context sources, and the checkpoint store location.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::approval::DecisionKind;

/// Top-level configuration. Every field has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,

    /// Default-value rules applied before a tool call is shown to a human.
    #[serde(default)]
    pub prefill: Vec<PrefillRule>,

    /// Named reference lists loaded through the tool provider at connect time.
    #[serde(default)]
    pub reference: Vec<ReferenceSource>,

    /// Prompt context values loaded through the tool provider at connect time.
    #[serde(default)]
    pub context: Vec<ContextSource>,

    /// Helper capabilities used internally but never offered to the model.
    #[serde(default)]
    pub hidden_capabilities: Vec<String>,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Run-loop limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum node executions per invocation before the run is aborted.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Deadline for a single node (LLM or tool call included).
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,

    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_steps() -> u32 {
    25
}

fn default_node_timeout_secs() -> u64 {
    300
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            node_timeout_secs: default_node_timeout_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Which decisions a human may return, and how requests are described.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Decision kinds permitted when no override matches.
    #[serde(default = "default_allowed_decisions")]
    pub allowed_decisions: Vec<DecisionKind>,

    /// Description template; `{capability}` and `{arguments}` are substituted.
    #[serde(default = "default_description")]
    pub description: String,

    /// Per-capability call-site overrides.
    #[serde(default)]
    pub overrides: Vec<ApprovalOverride>,
}

fn default_allowed_decisions() -> Vec<DecisionKind> {
    vec![
        DecisionKind::Accept,
        DecisionKind::Edit,
        DecisionKind::Respond,
    ]
}

fn default_description() -> String {
    "Review the call to {capability} with arguments {arguments}".to_string()
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            allowed_decisions: default_allowed_decisions(),
            description: default_description(),
            overrides: Vec::new(),
        }
    }
}

impl ApprovalConfig {
    /// Permitted decisions for a capability's call site.
    pub fn allowed_for(&self, capability: &str) -> &[DecisionKind] {
        self.overrides
            .iter()
            .find(|o| o.capability == capability)
            .and_then(|o| o.allowed_decisions.as_deref())
            .unwrap_or(&self.allowed_decisions)
    }

    /// Description template for a capability's call site.
    pub fn description_for(&self, capability: &str) -> &str {
        self.overrides
            .iter()
            .find(|o| o.capability == capability)
            .and_then(|o| o.description.as_deref())
            .unwrap_or(&self.description)
    }
}

/// Call-site settings for one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalOverride {
    pub capability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_decisions: Option<Vec<DecisionKind>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Fill `field` of `capability` with the first `take` entries of the
/// reference list `reference` when the model omitted a required field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefillRule {
    pub capability: String,
    pub field: String,
    pub reference: String,
    pub take: usize,
    /// Keep only these keys of each entry (all keys when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

/// A reference list loaded by invoking a helper capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceSource {
    pub name: String,
    pub capability: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// JSON pointer to the array inside the capability result (root when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
}

/// A prompt context variable loaded by invoking a helper capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSource {
    pub variable: String,
    pub capability: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// Checkpoint store location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite URL; derived from the data directory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}
