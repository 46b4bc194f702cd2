use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use tollgate_core::error::Result;
use tollgate_core::event::EventBus;
use tollgate_core::state::{ArtifactFields, StateRecord};
use tollgate_core::traits::{step_fn, ContentGenerator, OutputSink};
use tollgate_engine::broker::ApprovalBroker;
use tollgate_engine::gate::ApprovalGate;
use tollgate_engine::graph::{Edge, GraphEngine, StepDescriptor, Target};

use crate::fields;
use crate::options::PipelineOptions;
use crate::steps::{ComposeStep, ImageStep, PlanStep, TextStep};

/// Initial state for a flyer run.
pub fn initial_state(description: &str) -> StateRecord {
    StateRecord::new().with(fields::DESCRIPTION, description)
}

/// Assembles the flyer pipeline graph.
///
/// ```text
/// plan ─(plan_approval ─ dispatch)─┬─ image ─ image_approval ─┐
///                                  └─ text ── text_approval ──┴─ check_approvals ─ compose
/// ```
///
/// Each approval gate loops back to its generator on rejection. A gate that
/// times out, is cancelled or exhausts its revisions ends its branch, and
/// `check_approvals` (a join) only proceeds to `compose` when both the image
/// and the text are approved.
pub struct FlyerPipeline {
    generator: Arc<dyn ContentGenerator>,
    broker: Arc<ApprovalBroker>,
    sink: Option<Arc<dyn OutputSink>>,
    options: PipelineOptions,
    event_bus: Option<Arc<EventBus>>,
}

impl FlyerPipeline {
    pub fn new(generator: Arc<dyn ContentGenerator>, broker: Arc<ApprovalBroker>) -> Self {
        Self {
            generator,
            broker,
            sink: None,
            options: PipelineOptions::default(),
            event_bus: None,
        }
    }

    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<GraphEngine> {
        let opts = &self.options;
        let mut graph = GraphEngine::builder(fields::STEP_PLAN)
            .history_limit(opts.history_limit)
            .add_step(
                StepDescriptor::new(fields::STEP_PLAN, PlanStep::new(self.generator.clone()))
                    .with_requires([fields::DESCRIPTION]),
            )
            .add_step(
                StepDescriptor::new(fields::STEP_IMAGE, ImageStep::new(self.generator.clone()))
                    .with_requires([fields::PLAN]),
            )
            .add_step(
                StepDescriptor::new(
                    fields::STEP_TEXT,
                    TextStep::new(self.generator.clone()).auto_approve(!opts.text_review),
                )
                .with_requires([fields::PLAN]),
            )
            .add_step(StepDescriptor::gate(
                fields::STEP_IMAGE_APPROVAL,
                self.gate(fields::IMAGE).with_payload(|state, step| {
                    Ok(json!({
                        "image": state.require_str(step, fields::IMAGE)?,
                        "prompt": state.get_str(fields::IMAGE_PROMPT),
                    }))
                }),
            ))
            .add_step(
                StepDescriptor::new(fields::STEP_CHECK, step_fn(|_, _| Ok(()))).as_join(),
            )
            .add_step(
                StepDescriptor::new(fields::STEP_COMPOSE, ComposeStep::new(self.sink.clone()))
                    .with_requires([fields::IMAGE, fields::TEXT]),
            );

        if let Some(bus) = &self.event_bus {
            graph = graph.event_bus(bus.clone());
        }

        // Planning, with an optional review loop before fanning out.
        let fan_out_from = if opts.plan_review {
            graph = graph
                .add_step(StepDescriptor::gate(
                    fields::STEP_PLAN_APPROVAL,
                    self.gate(fields::PLAN),
                ))
                .add_step(
                    StepDescriptor::new(fields::STEP_DISPATCH, step_fn(|_, _| Ok(())))
                        .with_requires([fields::PLAN]),
                )
                .add_edge(Edge::always(fields::STEP_PLAN, fields::STEP_PLAN_APPROVAL))
                .add_edge(self.review_route(
                    fields::STEP_PLAN_APPROVAL,
                    fields::PLAN,
                    fields::STEP_PLAN,
                    fields::STEP_DISPATCH,
                ));
            fields::STEP_DISPATCH
        } else {
            fields::STEP_PLAN
        };
        graph = graph
            .add_edge(Edge::always(fan_out_from, fields::STEP_IMAGE))
            .add_edge(Edge::always(fan_out_from, fields::STEP_TEXT));

        // Image branch.
        graph = graph
            .add_edge(Edge::always(fields::STEP_IMAGE, fields::STEP_IMAGE_APPROVAL))
            .add_edge(self.review_route(
                fields::STEP_IMAGE_APPROVAL,
                fields::IMAGE,
                fields::STEP_IMAGE,
                fields::STEP_CHECK,
            ));

        // Text branch.
        if opts.text_review {
            graph = graph
                .add_step(StepDescriptor::gate(
                    fields::STEP_TEXT_APPROVAL,
                    self.gate(fields::TEXT),
                ))
                .add_edge(Edge::always(fields::STEP_TEXT, fields::STEP_TEXT_APPROVAL))
                .add_edge(self.review_route(
                    fields::STEP_TEXT_APPROVAL,
                    fields::TEXT,
                    fields::STEP_TEXT,
                    fields::STEP_CHECK,
                ));
        } else {
            graph = graph.add_edge(Edge::always(fields::STEP_TEXT, fields::STEP_CHECK));
        }

        // Join.
        graph = graph
            .add_edge(Edge::select(fields::STEP_CHECK, |state| {
                if approved(state, fields::IMAGE) && approved(state, fields::TEXT) {
                    Target::step(fields::STEP_COMPOSE)
                } else {
                    Target::End
                }
            }))
            .add_edge(Edge::to_end(fields::STEP_COMPOSE));

        graph.build()
    }

    fn gate(&self, artifact: &str) -> ApprovalGate {
        ApprovalGate::new(artifact, self.broker.clone()).with_timeout(self.options.approval_timeout)
    }

    /// Route out of a gate: approved goes on, rejected regenerates while
    /// revisions remain, anything else ends the branch.
    fn review_route(&self, gate: &str, artifact: &str, regenerate: &str, next: &str) -> Edge {
        let review = ArtifactFields::new(artifact);
        let options = self.options.clone();
        let regenerate = Target::step(regenerate);
        let next = Target::step(next);
        Edge::select(gate, move |state| {
            if state.get_bool(&review.approved) == Some(true) {
                return next.clone();
            }
            let rejected = state.get_str(&review.decision) == Some("rejected");
            let reviews = state.get(&review.reviews).and_then(Value::as_u64).unwrap_or(0);
            if rejected && options.may_revise(reviews) {
                regenerate.clone()
            } else {
                Target::End
            }
        })
    }
}

fn approved(state: &StateRecord, artifact: &str) -> bool {
    state.get_bool(&format!("{artifact}_approved")) == Some(true)
}

/// How a finished flyer run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlyerOutcome {
    Composed {
        flyer: Value,
        location: Option<String>,
    },
    /// The run ended without composing; `decisions` lists the last review
    /// outcome of each artifact that was not approved.
    Abandoned { decisions: Vec<(String, String)> },
}

impl FlyerOutcome {
    pub fn from_state(state: &StateRecord) -> Self {
        if let Some(flyer) = state.get(fields::FLYER) {
            return Self::Composed {
                flyer: flyer.clone(),
                location: state.get_str(fields::FLYER_LOCATION).map(str::to_string),
            };
        }
        let decisions = [fields::PLAN, fields::IMAGE, fields::TEXT]
            .into_iter()
            .map(ArtifactFields::new)
            .filter(|f| state.get_bool(&f.approved) == Some(false))
            .map(|f| {
                let decision = state.get_str(&f.decision).unwrap_or("unreviewed").to_string();
                (f.artifact, decision)
            })
            .collect();
        Self::Abandoned { decisions }
    }

    pub fn is_composed(&self) -> bool {
        matches!(self, Self::Composed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tollgate_core::approval::ApprovalDecision;
    use tollgate_core::error::TollgateError;
    use tollgate_test_utils::{text_reply, AutoResponder, RecordingSink, ScriptedGenerator};

    fn generator() -> Arc<ScriptedGenerator> {
        Arc::new(
            ScriptedGenerator::new()
                .reply("flyer designer", "PLAN")
                .reply("image generation prompt", "PROMPT")
                .reply(
                    "text elements",
                    &text_reply("Summer Jazz", "Blues under the stars", "center"),
                ),
        )
    }

    fn broker() -> Arc<ApprovalBroker> {
        Arc::new(ApprovalBroker::new(Arc::new(EventBus::default())))
    }

    async fn run(engine: &GraphEngine) -> StateRecord {
        tokio::time::timeout(
            Duration::from_secs(5),
            engine.run(initial_state("summer jazz festival")),
        )
        .await
        .expect("pipeline finished")
        .expect("pipeline succeeded")
        .state
    }

    #[tokio::test]
    async fn test_rejected_image_is_regenerated_with_feedback() {
        let gen = generator();
        let broker = broker();
        let sink = Arc::new(RecordingSink::new());
        let responder = AutoResponder::reject_first(broker.clone(), "image", 1, "too dark").await;

        let engine = FlyerPipeline::new(gen.clone(), broker.clone())
            .sink(sink.clone())
            .build()
            .unwrap();
        let state = run(&engine).await;

        let flyer = state.get(fields::FLYER).unwrap();
        assert_eq!(flyer["image"], "https://images.test/2.png");
        assert_eq!(flyer["headline"], "Summer Jazz");
        assert_eq!(flyer["position"], "center");
        assert_eq!(sink.outputs().len(), 1);

        let image_requests = gen.requests_matching("image generation prompt");
        assert_eq!(image_requests.len(), 2);
        assert!(image_requests[1]
            .messages
            .iter()
            .any(|m| m.contains("too dark")));

        assert_eq!(
            responder.seen_subjects(),
            vec!["image", "text", "image"]
        );
        assert!(FlyerOutcome::from_state(&state).is_composed());
    }

    #[tokio::test]
    async fn test_text_review_disabled_skips_text_gate() {
        let broker = broker();
        let responder = AutoResponder::approve_all(broker.clone()).await;
        let engine = FlyerPipeline::new(generator(), broker.clone())
            .options(PipelineOptions {
                text_review: false,
                ..Default::default()
            })
            .build()
            .unwrap();
        let state = run(&engine).await;

        assert!(state.contains(fields::FLYER));
        assert_eq!(responder.seen_subjects(), vec!["image"]);
    }

    #[tokio::test]
    async fn test_plan_review_loop() {
        let gen = generator();
        let broker = broker();
        let responder = AutoResponder::reject_first(broker.clone(), "plan", 2, "more brass").await;
        let engine = FlyerPipeline::new(gen.clone(), broker.clone())
            .options(PipelineOptions {
                plan_review: true,
                ..Default::default()
            })
            .build()
            .unwrap();
        let state = run(&engine).await;

        assert!(state.contains(fields::FLYER));
        assert_eq!(gen.requests_matching("flyer designer").len(), 3);
        assert_eq!(
            responder.seen_subjects(),
            vec!["plan", "plan", "plan", "image", "text"]
        );
    }

    #[tokio::test]
    async fn test_revision_cap_ends_without_flyer() {
        let broker = broker();
        let _responder = AutoResponder::always_reject(broker.clone(), "image", "no").await;
        let engine = FlyerPipeline::new(generator(), broker.clone())
            .options(PipelineOptions {
                max_revisions: 2,
                ..Default::default()
            })
            .build()
            .unwrap();
        let state = run(&engine).await;

        assert!(!state.contains(fields::FLYER));
        assert_eq!(state.get("image_reviews").and_then(Value::as_u64), Some(3));
        assert_eq!(
            FlyerOutcome::from_state(&state),
            FlyerOutcome::Abandoned {
                decisions: vec![("image".to_string(), "rejected".to_string())]
            }
        );
    }

    #[tokio::test]
    async fn test_timed_out_gate_ends_branch() {
        let broker = broker();
        // Approve text, never answer image.
        let _responder = AutoResponder::spawn(broker.clone(), |req, _| {
            (req.subject == "text").then_some(ApprovalDecision::Approved)
        })
        .await;
        let engine = FlyerPipeline::new(generator(), broker.clone())
            .options(PipelineOptions {
                approval_timeout: Some(Duration::from_millis(20)),
                ..Default::default()
            })
            .build()
            .unwrap();
        let state = run(&engine).await;

        assert!(!state.contains(fields::FLYER));
        assert_eq!(state.get_str("image_decision"), Some("timed_out"));
        assert_eq!(state.get_bool("text_approved"), Some(true));
        assert!(broker.pending_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_text_fails_run() {
        let gen = Arc::new(
            ScriptedGenerator::new()
                .reply("flyer designer", "PLAN")
                .reply("text elements", "{headline: nope"),
        );
        let broker = broker();
        let _responder = AutoResponder::approve_all(broker.clone()).await;
        let engine = FlyerPipeline::new(gen, broker).build().unwrap();

        let failure = engine
            .run(initial_state("jazz"))
            .await
            .unwrap_err();
        assert_eq!(failure.step_id, fields::STEP_TEXT);
        assert!(matches!(failure.error, TollgateError::Parse(_)));
        assert_eq!(failure.state.get_str(fields::PLAN), Some("PLAN"));
    }
}
