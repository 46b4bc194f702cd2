use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use tollgate_core::error::{Result, TollgateError};
use tollgate_core::state::{ArtifactFields, StateRecord};
use tollgate_core::traits::{ContentGenerator, OutputSink, Step, StepContext};
use tollgate_core::types::CompletionRequest;

use crate::fields;
use crate::prompts;

const DEFAULT_POSITION: &str = "top-left";

/// Text elements of a flyer, as returned by the text step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextElements {
    pub headline: String,
    pub subtext: String,
    #[serde(default)]
    pub position: Option<String>,
}

impl TextElements {
    /// Parse a JSON-mode completion. Tolerates a surrounding code fence.
    pub fn parse(raw: &str) -> Result<Self> {
        let body = strip_fence(raw.trim());
        let elements: TextElements = serde_json::from_str(body)
            .map_err(|e| TollgateError::Parse(format!("text elements: {}", e)))?;
        if elements.headline.trim().is_empty() {
            return Err(TollgateError::Parse("text elements: empty headline".into()));
        }
        Ok(elements)
    }

    pub fn position_or_default(&self) -> &str {
        self.position
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(DEFAULT_POSITION)
    }
}

fn strip_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Non-blank feedback left by a rejected review of `artifact`.
fn reviewer_feedback<'a>(state: &'a StateRecord, artifact: &ArtifactFields) -> Option<&'a str> {
    state
        .get_str(&artifact.feedback)
        .map(str::trim)
        .filter(|f| !f.is_empty())
}

/// Feedback left by a rejected review of `artifact`, with the rejected value.
fn pending_revision(state: &StateRecord, artifact: &ArtifactFields, previous: &str) -> Option<String> {
    let feedback = reviewer_feedback(state, artifact)?;
    Some(prompts::revision_note(
        &artifact.artifact,
        state.get_str(previous),
        feedback,
    ))
}

/// Turns the user's description into a design plan.
pub struct PlanStep {
    generator: Arc<dyn ContentGenerator>,
    review: ArtifactFields,
}

impl PlanStep {
    pub fn new(generator: Arc<dyn ContentGenerator>) -> Self {
        Self {
            generator,
            review: ArtifactFields::new(fields::PLAN),
        }
    }

    async fn run(&self, state: &mut StateRecord, ctx: &StepContext) -> Result<()> {
        let description = state.require_str(&ctx.step_id, fields::DESCRIPTION)?;
        let mut request = CompletionRequest::new(prompts::PLANNER).user(description);
        if let Some(note) = pending_revision(state, &self.review, fields::PLAN) {
            request = request.user(note);
        }

        let plan = self.generator.complete(request).await?;
        debug!(step_id = %ctx.step_id, chars = plan.len(), "Plan generated");
        state.set_str(fields::PLAN, plan);
        Ok(())
    }
}

impl Step for PlanStep {
    fn execute<'a>(
        &'a self,
        state: &'a mut StateRecord,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.run(state, ctx))
    }
}

/// Turns the plan into an image prompt, then into an image reference.
pub struct ImageStep {
    generator: Arc<dyn ContentGenerator>,
    review: ArtifactFields,
}

impl ImageStep {
    pub fn new(generator: Arc<dyn ContentGenerator>) -> Self {
        Self {
            generator,
            review: ArtifactFields::new(fields::IMAGE),
        }
    }

    async fn run(&self, state: &mut StateRecord, ctx: &StepContext) -> Result<()> {
        let plan = state.require_str(&ctx.step_id, fields::PLAN)?;
        let mut request = CompletionRequest::new(prompts::IMAGE_PROMPT).user(plan);
        if let Some(note) = pending_revision(state, &self.review, fields::IMAGE_PROMPT) {
            request = request.user(note);
        }

        let prompt = self.generator.complete(request).await?;
        let image = self.generator.generate_image(prompt.clone()).await?;
        info!(step_id = %ctx.step_id, image = %image, "Image generated");
        state.set_str(fields::IMAGE_PROMPT, prompt);
        state.set_str(fields::IMAGE, image);
        Ok(())
    }
}

impl Step for ImageStep {
    fn execute<'a>(
        &'a self,
        state: &'a mut StateRecord,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.run(state, ctx))
    }
}

/// Generates headline, subtext and position in JSON mode.
///
/// With `auto_approve` the text skips review and is marked approved directly.
pub struct TextStep {
    generator: Arc<dyn ContentGenerator>,
    review: ArtifactFields,
    auto_approve: bool,
}

impl TextStep {
    pub fn new(generator: Arc<dyn ContentGenerator>) -> Self {
        Self {
            generator,
            review: ArtifactFields::new(fields::TEXT),
            auto_approve: false,
        }
    }

    pub fn auto_approve(mut self, yes: bool) -> Self {
        self.auto_approve = yes;
        self
    }

    async fn run(&self, state: &mut StateRecord, ctx: &StepContext) -> Result<()> {
        let plan = state.require_str(&ctx.step_id, fields::PLAN)?;
        let mut request = CompletionRequest::new(prompts::TEXT_ELEMENTS)
            .user(plan)
            .json();
        if let Some(feedback) = reviewer_feedback(state, &self.review) {
            let previous = state.get(fields::TEXT).map(|v| v.to_string());
            request = request.user(prompts::revision_note(
                fields::TEXT,
                previous.as_deref(),
                feedback,
            ));
        }

        let raw = self.generator.complete(request).await?;
        let elements = TextElements::parse(&raw)?;
        info!(step_id = %ctx.step_id, headline = %elements.headline, "Text generated");
        state.set(fields::TEXT, serde_json::to_value(&elements)?);
        if self.auto_approve {
            state.set_bool(self.review.approved.clone(), true);
        }
        Ok(())
    }
}

impl Step for TextStep {
    fn execute<'a>(
        &'a self,
        state: &'a mut StateRecord,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.run(state, ctx))
    }
}

/// Combines the approved image and text into the flyer and hands it to the sink.
pub struct ComposeStep {
    sink: Option<Arc<dyn OutputSink>>,
}

impl ComposeStep {
    pub fn new(sink: Option<Arc<dyn OutputSink>>) -> Self {
        Self { sink }
    }

    async fn run(&self, state: &mut StateRecord, ctx: &StepContext) -> Result<()> {
        let step = ctx.step_id.as_str();
        let image = state.require_str(step, fields::IMAGE)?.to_string();
        let text: TextElements = serde_json::from_value(state.require(step, fields::TEXT)?.clone())
            .map_err(|_| TollgateError::FieldType {
                step: step.to_string(),
                field: fields::TEXT.to_string(),
                expected: "text elements object",
            })?;

        let flyer = json!({
            "description": state.get_str(fields::DESCRIPTION),
            "plan": state.get_str(fields::PLAN),
            "image": image,
            "headline": text.headline,
            "subtext": text.subtext,
            "position": text.position_or_default(),
        });

        if let Some(sink) = &self.sink {
            let location = sink.write(&flyer).await?;
            info!(step_id = %step, location = %location, "Flyer written");
            state.set_str(fields::FLYER_LOCATION, location);
        }
        state.set(fields::FLYER, flyer);
        Ok(())
    }
}

impl Step for ComposeStep {
    fn execute<'a>(
        &'a self,
        state: &'a mut StateRecord,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.run(state, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::types::InstanceId;
    use tollgate_test_utils::{text_reply, RecordingSink, ScriptedGenerator};

    fn ctx(step: &str) -> StepContext {
        StepContext::new(InstanceId::new(), step)
    }

    #[test]
    fn test_parse_text_elements() {
        let t = TextElements::parse(&text_reply("Jazz Nights", "Live blues all summer", "center"))
            .unwrap();
        assert_eq!(t.headline, "Jazz Nights");
        assert_eq!(t.position_or_default(), "center");
    }

    #[test]
    fn test_parse_text_elements_optional_position() {
        let t = TextElements::parse(r#"{"headline": "Hi", "subtext": "there"}"#).unwrap();
        assert_eq!(t.position, None);
        assert_eq!(t.position_or_default(), "top-left");
    }

    #[test]
    fn test_parse_text_elements_fenced() {
        let raw = "```json\n{\"headline\": \"Hi\", \"subtext\": \"there\"}\n```";
        assert_eq!(TextElements::parse(raw).unwrap().headline, "Hi");
    }

    #[test]
    fn test_parse_text_elements_rejects_malformed() {
        assert!(matches!(
            TextElements::parse("{'headline': 'python dict'}"),
            Err(TollgateError::Parse(_))
        ));
        assert!(TextElements::parse(r#"{"headline": "only"}"#).is_err());
        assert!(TextElements::parse(r#"{"headline": " ", "subtext": "x"}"#).is_err());
    }

    #[tokio::test]
    async fn test_plan_step_includes_feedback() {
        let gen = Arc::new(ScriptedGenerator::new().reply("flyer designer", "PLAN v2"));
        let step = PlanStep::new(gen.clone());
        let mut state = StateRecord::new()
            .with(fields::DESCRIPTION, "summer jazz festival")
            .with(fields::PLAN, "PLAN v1")
            .with("plan_feedback", "more color");
        step.execute(&mut state, &ctx("plan")).await.unwrap();

        assert_eq!(state.get_str(fields::PLAN), Some("PLAN v2"));
        let req = &gen.requests()[0];
        assert_eq!(req.messages[0], "summer jazz festival");
        assert!(req.messages[1].contains("more color"));
        assert!(req.messages[1].contains("PLAN v1"));
    }

    #[tokio::test]
    async fn test_blank_feedback_adds_no_revision_note() {
        let gen = Arc::new(
            ScriptedGenerator::new()
                .reply("flyer designer", "PLAN v2")
                .reply("text elements", &text_reply("Jazz", "Friday night", "center")),
        );
        let mut state = StateRecord::new()
            .with(fields::DESCRIPTION, "summer jazz festival")
            .with(fields::PLAN, "PLAN v1")
            .with("plan_feedback", "")
            .with("text_feedback", "   ");

        PlanStep::new(gen.clone())
            .execute(&mut state, &ctx("plan"))
            .await
            .unwrap();
        TextStep::new(gen.clone())
            .execute(&mut state, &ctx("text"))
            .await
            .unwrap();

        let requests = gen.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].messages, vec!["summer jazz festival".to_string()]);
        assert_eq!(requests[1].messages, vec!["PLAN v2".to_string()]);
        assert!(requests
            .iter()
            .all(|r| r.messages.iter().all(|m| !m.contains("rejected"))));
    }

    #[tokio::test]
    async fn test_plan_step_requires_description() {
        let step = PlanStep::new(Arc::new(ScriptedGenerator::new()));
        let err = step
            .execute(&mut StateRecord::new(), &ctx("plan"))
            .await
            .unwrap_err();
        assert!(err.is_missing_field());
    }

    #[tokio::test]
    async fn test_image_step_prompt_then_image() {
        let gen = Arc::new(ScriptedGenerator::new().reply("image generation prompt", "a neon stage"));
        let step = ImageStep::new(gen.clone());
        let mut state = StateRecord::new().with(fields::PLAN, "plan");
        step.execute(&mut state, &ctx("image")).await.unwrap();

        assert_eq!(state.get_str(fields::IMAGE_PROMPT), Some("a neon stage"));
        assert_eq!(state.get_str(fields::IMAGE), Some("https://images.test/1.png"));
        assert_eq!(gen.image_prompts(), vec!["a neon stage".to_string()]);
    }

    #[tokio::test]
    async fn test_text_step_marks_approved_when_unreviewed() {
        let gen = Arc::new(
            ScriptedGenerator::new().reply("text elements", &text_reply("A", "B", "center")),
        );
        let step = TextStep::new(gen.clone()).auto_approve(true);
        let mut state = StateRecord::new().with(fields::PLAN, "plan");
        step.execute(&mut state, &ctx("text")).await.unwrap();

        assert_eq!(state.get_bool("text_approved"), Some(true));
        assert_eq!(state.get(fields::TEXT).unwrap()["headline"], "A");
        assert!(gen.requests()[0].json);
    }

    #[tokio::test]
    async fn test_text_step_malformed_reply_fails() {
        let gen = Arc::new(ScriptedGenerator::new().reply("text elements", "not json at all"));
        let step = TextStep::new(gen);
        let mut state = StateRecord::new().with(fields::PLAN, "plan");
        let err = step.execute(&mut state, &ctx("text")).await.unwrap_err();
        assert!(matches!(err, TollgateError::Parse(_)));
        assert!(!state.contains(fields::TEXT));
    }

    #[tokio::test]
    async fn test_compose_writes_to_sink() {
        let sink = Arc::new(RecordingSink::new());
        let step = ComposeStep::new(Some(sink.clone()));
        let mut state = StateRecord::new()
            .with(fields::DESCRIPTION, "jazz")
            .with(fields::IMAGE, "https://images.test/2.png")
            .with(
                fields::TEXT,
                serde_json::json!({"headline": "Jazz", "subtext": "Live"}),
            );
        step.execute(&mut state, &ctx("compose")).await.unwrap();

        let flyer = state.get(fields::FLYER).unwrap();
        assert_eq!(flyer["image"], "https://images.test/2.png");
        assert_eq!(flyer["position"], "top-left");
        assert_eq!(state.get_str(fields::FLYER_LOCATION), Some("memory://1"));
        assert_eq!(sink.outputs().len(), 1);
    }

    #[tokio::test]
    async fn test_compose_rejects_wrong_text_shape() {
        let step = ComposeStep::new(None);
        let mut state = StateRecord::new()
            .with(fields::IMAGE, "img")
            .with(fields::TEXT, "just a string");
        let err = step.execute(&mut state, &ctx("compose")).await.unwrap_err();
        assert!(matches!(err, TollgateError::FieldType { .. }));
    }
}
