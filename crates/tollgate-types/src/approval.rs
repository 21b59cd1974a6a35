//! Human approval contract.
//!
//! When a run suspends it surfaces an [`ApprovalRequest`]; the decision comes
//! back later, possibly days afterward, as a [`Resume`] wrapping one or more
//! [`ApprovalResponse`]s. Only the first response of a batch is authoritative.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// The kinds of decision a human may return for a pending tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Run the call exactly as presented.
    Accept,
    /// Run the call with replacement arguments.
    Edit,
    /// Drop the call.
    Ignore,
    /// Skip the call and hand the model a substitute result.
    Respond,
}

impl DecisionKind {
    pub const ALL: [DecisionKind; 4] = [
        DecisionKind::Accept,
        DecisionKind::Edit,
        DecisionKind::Ignore,
        DecisionKind::Respond,
    ];
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionKind::Accept => write!(f, "accept"),
            DecisionKind::Edit => write!(f, "edit"),
            DecisionKind::Ignore => write!(f, "ignore"),
            DecisionKind::Respond => write!(f, "respond"),
        }
    }
}

impl FromStr for DecisionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "accept" => Ok(DecisionKind::Accept),
            "edit" => Ok(DecisionKind::Edit),
            "ignore" => Ok(DecisionKind::Ignore),
            "respond" => Ok(DecisionKind::Respond),
            other => Err(format!("invalid decision kind: '{other}'")),
        }
    }
}

/// A suspended run's question to a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique per suspension; a resume may name it to guard against answering
    /// the wrong question.
    pub id: Uuid,
    /// Identity of the tool call under review.
    pub tool_call_id: String,
    /// Capability the model wants to invoke.
    pub capability: String,
    /// Arguments exactly as they will run on accept (including any pre-fill).
    pub arguments: Map<String, Value>,
    /// Decision kinds this call site permits.
    pub allowed: Vec<DecisionKind>,
    /// Human-readable description shown alongside the request.
    pub description: String,
}

impl ApprovalRequest {
    pub fn permits(&self, kind: DecisionKind) -> bool {
        self.allowed.contains(&kind)
    }

    /// A decision bound to this request. Prefer this over [`Resume::new`]:
    /// a bound decision is refused by any run that is not waiting on it.
    pub fn decide(&self, value: impl Into<ResumeValue>) -> Resume {
        Resume::new(value).for_request(self.id)
    }
}

/// A human's decision on a pending [`ApprovalRequest`].
///
/// Wire form is internally tagged by `type`:
/// ```json
/// {"type": "edit", "args": {"name": "X", "dept": [{"code": "01"}]}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalResponse {
    Accept,
    Edit {
        args: Map<String, Value>,
    },
    Ignore,
    Respond {
        args: Value,
    },
}

impl ApprovalResponse {
    pub fn kind(&self) -> DecisionKind {
        match self {
            ApprovalResponse::Accept => DecisionKind::Accept,
            ApprovalResponse::Edit { .. } => DecisionKind::Edit,
            ApprovalResponse::Ignore => DecisionKind::Ignore,
            ApprovalResponse::Respond { .. } => DecisionKind::Respond,
        }
    }
}

/// A decision as delivered by the decision channel: one response or a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResumeValue {
    Batch(Vec<ApprovalResponse>),
    Single(ApprovalResponse),
}

impl ResumeValue {
    /// Parse a raw decision payload.
    ///
    /// Unknown decision kinds and payloads of the wrong shape are rejected
    /// here rather than coerced into some other kind.
    pub fn from_json(value: Value) -> Result<Self, DecisionError> {
        serde_json::from_value(value).map_err(|e| DecisionError::Unparseable(e.to_string()))
    }

    /// Number of responses delivered.
    pub fn len(&self) -> usize {
        match self {
            ResumeValue::Batch(items) => items.len(),
            ResumeValue::Single(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split into the authoritative (first) response and the count of
    /// responses that were discarded.
    pub fn into_authoritative(self) -> Result<(ApprovalResponse, usize), DecisionError> {
        match self {
            ResumeValue::Single(response) => Ok((response, 0)),
            ResumeValue::Batch(items) => {
                let discarded = items.len().saturating_sub(1);
                let first = items.into_iter().next().ok_or(DecisionError::EmptyBatch)?;
                Ok((first, discarded))
            }
        }
    }
}

impl From<ApprovalResponse> for ResumeValue {
    fn from(response: ApprovalResponse) -> Self {
        ResumeValue::Single(response)
    }
}

/// A caller's request to continue a suspended run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resume {
    /// The pending request this decision answers. When present it must match
    /// the run's outstanding suspension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    pub value: ResumeValue,
}

impl Resume {
    /// An unbound decision, applied to whatever request the run is waiting
    /// on. Nothing stops it from landing on the wrong run; callers that
    /// hold the [`ApprovalRequest`] should use [`ApprovalRequest::decide`].
    pub fn new(value: impl Into<ResumeValue>) -> Self {
        Self {
            request_id: None,
            value: value.into(),
        }
    }

    /// Bind this decision to a specific pending request.
    pub fn for_request(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

/// Errors decoding a decision payload.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("unparseable decision: {0}")]
    Unparseable(String),

    #[error("decision batch is empty")]
    EmptyBatch,
}
