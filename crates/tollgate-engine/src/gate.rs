use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info};

use tollgate_core::approval::{ApprovalDecision, ApprovalOutcome, CorrelationId};
use tollgate_core::error::Result;
use tollgate_core::state::{ArtifactFields, StateRecord};
use tollgate_core::traits::{Step, StepContext};

use crate::broker::ApprovalBroker;

type PayloadFn = dyn Fn(&StateRecord, &str) -> Result<Value> + Send + Sync;

/// Progress of one traversal of a gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    AwaitingSubmission,
    PendingResponse { request_id: CorrelationId },
    Approved,
    Rejected { feedback: String },
    /// Timed out or cancelled; neither approve nor reject.
    Abandoned { reason: &'static str },
}

impl GateState {
    /// The request has been handed to the broker.
    pub fn submitted(self, request_id: CorrelationId) -> Self {
        match self {
            Self::AwaitingSubmission => Self::PendingResponse { request_id },
            other => other,
        }
    }

    /// The broker wait has ended.
    pub fn resolved(self, outcome: &ApprovalOutcome) -> Self {
        match self {
            Self::PendingResponse { .. } => match outcome {
                ApprovalOutcome::Decided(ApprovalDecision::Approved) => Self::Approved,
                ApprovalOutcome::Decided(ApprovalDecision::Rejected { feedback }) => {
                    Self::Rejected {
                        feedback: feedback.clone(),
                    }
                }
                other => Self::Abandoned {
                    reason: other.label(),
                },
            },
            other => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Approved | Self::Rejected { .. } | Self::Abandoned { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::AwaitingSubmission => "awaiting_submission",
            Self::PendingResponse { .. } => "pending_response",
            Self::Approved => "approved",
            Self::Rejected { .. } => "rejected",
            Self::Abandoned { reason } => *reason,
        }
    }
}

/// A step that suspends the workflow until a listener approves or rejects an
/// artifact.
///
/// On approval it sets `{artifact}_approved = true` and clears
/// `{artifact}_feedback`; on rejection it sets `{artifact}_approved = false`
/// and stores the feedback for the regenerating step. A timeout or
/// cancellation records `{artifact}_approved = false` without feedback.
/// `{artifact}_decision` holds the outcome label and `{artifact}_reviews`
/// counts traversals.
pub struct ApprovalGate {
    fields: ArtifactFields,
    broker: Arc<ApprovalBroker>,
    timeout: Option<Duration>,
    payload: Option<Box<PayloadFn>>,
}

impl ApprovalGate {
    pub fn new(artifact: impl Into<String>, broker: Arc<ApprovalBroker>) -> Self {
        Self {
            fields: ArtifactFields::new(artifact),
            broker,
            timeout: None,
            payload: None,
        }
    }

    /// Maximum wait for a decision.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the reviewed payload from the state instead of sending the raw
    /// artifact field.
    pub fn with_payload<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateRecord, &str) -> Result<Value> + Send + Sync + 'static,
    {
        self.payload = Some(Box::new(f));
        self
    }

    pub fn fields(&self) -> &ArtifactFields {
        &self.fields
    }

    /// Run one traversal: submit, wait, then write the outcome fields.
    /// Returns the terminal traversal state.
    pub async fn review(&self, state: &mut StateRecord, ctx: &StepContext) -> Result<GateState> {
        let payload = match &self.payload {
            Some(build) => build(&*state, &ctx.step_id)?,
            None => state.require(&ctx.step_id, &self.fields.artifact)?.clone(),
        };

        let mut traversal = GateState::AwaitingSubmission;
        let ticket = self
            .broker
            .request(&ctx.instance_id, &self.fields.artifact, payload)
            .await;
        traversal = traversal.submitted(ticket.id.clone());
        debug!(step_id = %ctx.step_id, state = ?traversal, "Awaiting approval");

        let outcome = self.broker.wait(ticket, self.timeout, &ctx.cancel).await;
        traversal = traversal.resolved(&outcome);

        record_traversal(state, &self.fields, &traversal);
        info!(
            step_id = %ctx.step_id,
            artifact = %self.fields.artifact,
            outcome = traversal.label(),
            "Approval gate resolved"
        );
        Ok(traversal)
    }
}

impl Step for ApprovalGate {
    fn execute<'a>(
        &'a self,
        state: &'a mut StateRecord,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.review(state, ctx).await?;
            Ok(())
        })
    }
}

/// Write a finished traversal into the state record.
///
/// Returns `false` and leaves the record untouched for a traversal that has
/// not reached a terminal state.
pub fn record_traversal(state: &mut StateRecord, fields: &ArtifactFields, traversal: &GateState) -> bool {
    match traversal {
        GateState::AwaitingSubmission | GateState::PendingResponse { .. } => return false,
        GateState::Approved => {
            state.set_bool(fields.approved.clone(), true);
            state.remove(&fields.feedback);
        }
        GateState::Rejected { feedback } if !feedback.trim().is_empty() => {
            state.set_bool(fields.approved.clone(), false);
            state.set_str(fields.feedback.clone(), feedback.clone());
        }
        GateState::Rejected { .. } | GateState::Abandoned { .. } => {
            state.set_bool(fields.approved.clone(), false);
            state.remove(&fields.feedback);
        }
    }
    state.bump(&fields.reviews);
    state.set_str(fields.decision.clone(), traversal.label());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::event::EventBus;
    use tollgate_core::types::InstanceId;
    use tollgate_core::TollgateError;

    fn broker() -> Arc<ApprovalBroker> {
        Arc::new(ApprovalBroker::new(Arc::new(EventBus::default())))
    }

    /// Answer every request on a fresh listener with the given decisions, in order.
    async fn answer_with(broker: &Arc<ApprovalBroker>, decisions: Vec<ApprovalDecision>) {
        let mut listener = broker.register_listener().await;
        let broker = broker.clone();
        tokio::spawn(async move {
            for decision in decisions {
                let Some(req) = listener.recv().await else { break };
                broker.respond(req.id.as_str(), decision).await;
            }
        });
    }

    #[test]
    fn state_machine_transitions() {
        let id = CorrelationId::from_string("c-1");
        let s = GateState::AwaitingSubmission.submitted(id.clone());
        assert_eq!(s, GateState::PendingResponse { request_id: id });
        assert!(!s.is_terminal());

        let approved = s
            .clone()
            .resolved(&ApprovalOutcome::Decided(ApprovalDecision::Approved));
        assert_eq!(approved, GateState::Approved);

        let timed_out = s.resolved(&ApprovalOutcome::TimedOut);
        assert_eq!(timed_out, GateState::Abandoned { reason: "timed_out" });
        assert!(timed_out.is_terminal());

        // Resolving before submission is not a transition.
        let idle = GateState::AwaitingSubmission.resolved(&ApprovalOutcome::Cancelled);
        assert_eq!(idle, GateState::AwaitingSubmission);
    }

    #[test]
    fn approval_clears_prior_feedback() {
        let fields = ArtifactFields::new("image");
        let mut state = StateRecord::new().with("image_feedback", "too dark");
        assert!(record_traversal(&mut state, &fields, &GateState::Approved));
        assert_eq!(state.get_bool("image_approved"), Some(true));
        assert!(!state.contains("image_feedback"));
        assert_eq!(state.get_str("image_decision"), Some("approved"));
        assert_eq!(state.get("image_reviews").and_then(|v| v.as_u64()), Some(1));
    }

    #[test]
    fn timeout_records_no_feedback() {
        let fields = ArtifactFields::new("text");
        let mut state = StateRecord::new();
        let traversal = GateState::PendingResponse {
            request_id: CorrelationId::from_string("c-2"),
        }
        .resolved(&ApprovalOutcome::TimedOut);
        assert!(record_traversal(&mut state, &fields, &traversal));
        assert_eq!(state.get_bool("text_approved"), Some(false));
        assert!(!state.contains("text_feedback"));
        assert_eq!(state.get_str("text_decision"), Some("timed_out"));
    }

    #[test]
    fn unfinished_traversal_is_not_recorded() {
        let fields = ArtifactFields::new("plan");
        let mut state = StateRecord::new();
        let pending = GateState::AwaitingSubmission.submitted(CorrelationId::from_string("c-3"));
        assert!(!record_traversal(&mut state, &fields, &pending));
        assert!(state.is_empty());
    }

    #[test]
    fn blank_rejection_stores_no_feedback() {
        let fields = ArtifactFields::new("image");
        let mut state = StateRecord::new().with("image_feedback", "too dark");
        let rejected = GateState::Rejected {
            feedback: "  ".into(),
        };
        assert!(record_traversal(&mut state, &fields, &rejected));
        assert_eq!(state.get_bool("image_approved"), Some(false));
        assert_eq!(state.get_str("image_decision"), Some("rejected"));
        assert!(!state.contains("image_feedback"));
    }

    #[tokio::test]
    async fn gate_records_rejection_feedback() {
        let broker = broker();
        answer_with(
            &broker,
            vec![ApprovalDecision::Rejected {
                feedback: "too dark".into(),
            }],
        )
        .await;

        let gate = ApprovalGate::new("image", broker.clone());
        let mut state = StateRecord::new().with("image", "ref-1");
        let ctx = StepContext::new(InstanceId::new(), "image_approval");
        let traversal = gate.review(&mut state, &ctx).await.unwrap();
        assert_eq!(
            traversal,
            GateState::Rejected {
                feedback: "too dark".into()
            }
        );

        assert_eq!(state.get_bool("image_approved"), Some(false));
        assert_eq!(state.get_str("image_feedback"), Some("too dark"));
        assert_eq!(state.get_str("image_decision"), Some("rejected"));
    }

    #[tokio::test]
    async fn gate_sends_custom_payload() {
        let broker = broker();
        let mut listener = broker.register_listener().await;
        let responder = broker.clone();
        let seen = tokio::spawn(async move {
            let req = listener.recv().await.unwrap();
            responder
                .respond(req.id.as_str(), ApprovalDecision::Approved)
                .await;
            req
        });

        let gate = ApprovalGate::new("text", broker.clone()).with_payload(|state, step| {
            let text = state.require(step, "text")?;
            Ok(serde_json::json!({"headline": text["headline"]}))
        });
        let mut state = StateRecord::new().with(
            "text",
            serde_json::json!({"headline": "Go Live", "subtext": "Join us"}),
        );
        let ctx = StepContext::new(InstanceId::new(), "text_approval");
        gate.execute(&mut state, &ctx).await.unwrap();

        let req = seen.await.unwrap();
        assert_eq!(req.subject, "text");
        assert_eq!(req.payload, serde_json::json!({"headline": "Go Live"}));
        assert_eq!(state.get_bool("text_approved"), Some(true));
    }

    #[tokio::test]
    async fn gate_without_artifact_is_missing_field() {
        let gate = ApprovalGate::new("image", broker());
        let mut state = StateRecord::new();
        let ctx = StepContext::new(InstanceId::new(), "image_approval");
        let err = gate.execute(&mut state, &ctx).await.unwrap_err();
        assert!(matches!(err, TollgateError::MissingField { .. }));
    }

    #[tokio::test]
    async fn gate_times_out() {
        let gate = ApprovalGate::new("plan", broker()).with_timeout(Some(Duration::from_millis(5)));
        let mut state = StateRecord::new().with("plan", "outline");
        let ctx = StepContext::new(InstanceId::new(), "plan_approval");
        let traversal = gate.review(&mut state, &ctx).await.unwrap();
        assert_eq!(traversal, GateState::Abandoned { reason: "timed_out" });
        assert_eq!(state.get_str("plan_decision"), Some("timed_out"));
        assert_eq!(state.get_bool("plan_approved"), Some(false));
    }
}
