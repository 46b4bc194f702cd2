pub mod openai;
pub mod retry;

use std::sync::Arc;

use tracing::debug;

use tollgate_core::config::ModelConfig;
use tollgate_core::traits::ContentGenerator;

pub use openai::OpenAiGenerator;
pub use retry::RetryingGenerator;

/// Create a content generator for the configured provider.
///
/// Every provider name is served by the OpenAI-compatible client; a `[model.retry]`
/// section wraps it in a retrying generator.
pub fn create_generator(config: &ModelConfig) -> Arc<dyn ContentGenerator> {
    debug!(provider = %config.provider, model = %config.model_id, "Creating content generator");
    let client = OpenAiGenerator::new(config.clone());
    match &config.retry {
        Some(retry) => Arc::new(RetryingGenerator::new(Arc::new(client), retry.clone())),
        None => Arc::new(client),
    }
}
