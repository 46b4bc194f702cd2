use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::state::StateRecord;
use crate::types::{CompletionRequest, InstanceId};

/// Per-invocation context handed to a step alongside the state record.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub instance_id: InstanceId,
    pub step_id: String,
    /// Triggered when the owning instance is abandoned.
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn new(instance_id: InstanceId, step_id: impl Into<String>) -> Self {
        Self {
            instance_id,
            step_id: step_id.into(),
            cancel: CancellationToken::new(),
        }
    }
}

/// A named unit of work transforming the state record.
///
/// The engine runs at most one step per instance at a time, so a step owns the
/// record exclusively for the duration of `execute`.
pub trait Step: Send + Sync + 'static {
    fn execute<'a>(
        &'a self,
        state: &'a mut StateRecord,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Adapter turning a synchronous closure into a [`Step`].
pub struct FnStep<F>(F);

impl<F> Step for FnStep<F>
where
    F: Fn(&mut StateRecord, &StepContext) -> Result<()> + Send + Sync + 'static,
{
    fn execute<'a>(
        &'a self,
        state: &'a mut StateRecord,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<()>> {
        let result = (self.0)(state, ctx);
        Box::pin(async move { result })
    }
}

/// Wrap a synchronous closure as a step.
pub fn step_fn<F>(f: F) -> FnStep<F>
where
    F: Fn(&mut StateRecord, &StepContext) -> Result<()> + Send + Sync + 'static,
{
    FnStep(f)
}

/// Content generation service: text completions and images.
pub trait ContentGenerator: Send + Sync + 'static {
    /// Return the text of a single completion.
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>>;

    /// Generate an image from a prompt and return a reference to it (usually a URL).
    fn generate_image(&self, prompt: String) -> BoxFuture<'_, Result<String>>;
}

/// Sink for a finished workflow's output.
pub trait OutputSink: Send + Sync + 'static {
    /// Persist the value and return a human-readable location.
    fn write(&self, output: &Value) -> BoxFuture<'_, Result<String>>;
}
