use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::{ApprovalRequest, CorrelationId};

/// Unique workflow instance identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification of a step in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Plain,
    ApprovalGate,
}

/// Events emitted while workflows run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        instance_id: InstanceId,
        entry: String,
    },
    StepStarted {
        instance_id: InstanceId,
        step_id: String,
        step_kind: StepKind,
    },
    StepCompleted {
        instance_id: InstanceId,
        step_id: String,
        elapsed_ms: u64,
    },
    StepFailed {
        instance_id: InstanceId,
        step_id: String,
        error: String,
    },
    ApprovalRequested {
        request: ApprovalRequest,
    },
    ApprovalResolved {
        request_id: CorrelationId,
        instance_id: InstanceId,
        outcome: String,
    },
    RunComplete {
        instance_id: InstanceId,
        steps_executed: u64,
        state: serde_json::Value,
    },
    RunFailed {
        instance_id: InstanceId,
        step_id: String,
        error: String,
    },
}

impl WorkflowEvent {
    /// The instance an event belongs to.
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::RunStarted { instance_id, .. }
            | Self::StepStarted { instance_id, .. }
            | Self::StepCompleted { instance_id, .. }
            | Self::StepFailed { instance_id, .. }
            | Self::ApprovalResolved { instance_id, .. }
            | Self::RunComplete { instance_id, .. }
            | Self::RunFailed { instance_id, .. } => instance_id,
            Self::ApprovalRequested { request } => &request.instance_id,
        }
    }
}

/// Request to the content generation service.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<String>,
    /// Ask the service for a JSON object reply.
    pub json: bool,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: vec![],
            json: false,
        }
    }

    /// Append a user message.
    pub fn user(mut self, text: impl Into<String>) -> Self {
        self.messages.push(text.into());
        self
    }

    /// Request a JSON object reply.
    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_are_unique() {
        assert_ne!(InstanceId::new(), InstanceId::new());
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let evt = WorkflowEvent::StepStarted {
            instance_id: InstanceId::from_string("i-1"),
            step_id: "plan".into(),
            step_kind: StepKind::Plain,
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["kind"], "step_started");
        assert_eq!(json["step_id"], "plan");
        assert_eq!(evt.instance_id().as_str(), "i-1");
    }

    #[test]
    fn completion_request_builder() {
        let req = CompletionRequest::new("system")
            .user("plan")
            .user("Feedback: too dark")
            .json();
        assert_eq!(req.messages.len(), 2);
        assert!(req.json);
    }
}
