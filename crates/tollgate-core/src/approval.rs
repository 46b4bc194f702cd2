use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::InstanceId;

/// Token linking a submitted approval request to its eventual response.
///
/// Issued by the broker from its instance prefix and a sequence number, never
/// from payload content.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for console display.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pending approval request, as broadcast to listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: CorrelationId,
    pub instance_id: InstanceId,
    /// Name of the artifact under review (e.g. "image").
    pub subject: String,
    /// The artifact itself. Opaque to the engine.
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Decision on an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected { feedback: String },
}

impl ApprovalDecision {
    /// Build a decision from the wire shape `{approved, feedback?}`.
    /// Feedback on an approval is dropped.
    pub fn from_parts(approved: bool, feedback: Option<String>) -> Self {
        if approved {
            Self::Approved
        } else {
            Self::Rejected {
                feedback: feedback.unwrap_or_default(),
            }
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// How a suspended approval wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Decided(ApprovalDecision),
    /// The maximum wait elapsed; the correlation id was invalidated.
    TimedOut,
    /// The owning instance was abandoned.
    Cancelled,
}

impl ApprovalOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Decided(ApprovalDecision::Approved) => "approved",
            Self::Decided(ApprovalDecision::Rejected { .. }) => "rejected",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Decided(ApprovalDecision::Approved))
    }
}

impl fmt::Display for ApprovalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
