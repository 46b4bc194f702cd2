use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use tollgate_core::config::RetryConfig;
use tollgate_core::error::{Result, TollgateError};
use tollgate_core::traits::ContentGenerator;
use tollgate_core::types::CompletionRequest;

/// A generator that retries transient failures with jittered exponential backoff.
pub struct RetryingGenerator {
    inner: Arc<dyn ContentGenerator>,
    retry_config: RetryConfig,
}

impl RetryingGenerator {
    pub fn new(inner: Arc<dyn ContentGenerator>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }

    async fn retrying<'a, T>(
        &'a self,
        op: &'static str,
        call: impl Fn() -> BoxFuture<'a, Result<T>>,
    ) -> Result<T> {
        let max_retries = self.retry_config.max_retries;
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if is_retryable(&e) && attempt < max_retries => {
                    let backoff = calculate_backoff(attempt, &self.retry_config);
                    warn!(
                        op,
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying generation request"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_retryable(e: &TollgateError) -> bool {
    match e {
        TollgateError::Generation(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("timed out")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl ContentGenerator for RetryingGenerator {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.retrying("complete", || self.inner.complete(request.clone()))
                .await
        })
    }

    fn generate_image(&self, prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.retrying("generate_image", || self.inner.generate_image(prompt.clone()))
                .await
        })
    }
}
