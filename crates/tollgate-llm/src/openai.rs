use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tollgate_core::config::ModelConfig;
use tollgate_core::error::{Result, TollgateError};
use tollgate_core::traits::ContentGenerator;
use tollgate_core::types::CompletionRequest;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// OpenAI-compatible generator. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiGenerator {
    http: Client,
    config: ModelConfig,
}

impl OpenAiGenerator {
    pub fn new(config: ModelConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                Client::new()
            });
        Self { http, config }
    }

    fn endpoint(&self, path: &str) -> String {
        endpoint(self.config.base_url.as_deref(), path)
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<String> {
        let url = self.endpoint(path);
        let mut req = self.http.post(&url).json(body);
        if let Some(api_key) = &self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| TollgateError::Generation(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TollgateError::Generation(e.to_string()))?;
        if !status.is_success() {
            return Err(TollgateError::Generation(format!("HTTP {}: {}", status, text)));
        }
        Ok(text)
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

#[derive(Serialize)]
struct ImageRequest {
    model: String,
    prompt: String,
    size: String,
    quality: String,
    n: u32,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Deserialize, Debug)]
struct ImageData {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
}

fn endpoint(base_url: Option<&str>, path: &str) -> String {
    let base = base_url.unwrap_or(OPENAI_API_BASE).trim_end_matches('/');
    format!("{}/{}", base, path.trim_start_matches('/'))
}

fn chat_body(config: &ModelConfig, request: CompletionRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !request.system.is_empty() {
        messages.push(OaiMessage {
            role: "system",
            content: request.system,
        });
    }
    messages.extend(request.messages.into_iter().map(|content| OaiMessage {
        role: "user",
        content,
    }));

    ChatRequest {
        model: config.model_id.clone(),
        messages,
        max_tokens: config.max_tokens,
        temperature: (config.temperature > 0.0).then_some(config.temperature),
        response_format: request.json.then_some(ResponseFormat {
            r#type: "json_object",
        }),
    }
}

fn image_body(config: &ModelConfig, prompt: String) -> ImageRequest {
    ImageRequest {
        model: config.image_model.clone(),
        prompt,
        size: config.image_size.clone(),
        quality: config.image_quality.clone(),
        n: 1,
    }
}

fn parse_chat_response(body: &str) -> Result<String> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| TollgateError::Generation(format!("invalid completion response: {}", e)))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| TollgateError::Generation("completion returned no content".into()))
}

/// Returns the image URL, or a `data:` URI when the service inlines the bytes.
fn parse_image_response(body: &str) -> Result<String> {
    let parsed: ImageResponse = serde_json::from_str(body)
        .map_err(|e| TollgateError::Generation(format!("invalid image response: {}", e)))?;
    let image = parsed
        .data
        .into_iter()
        .next()
        .ok_or_else(|| TollgateError::Generation("image generation returned no data".into()))?;
    match (image.url, image.b64_json) {
        (Some(url), _) => Ok(url),
        (None, Some(b64)) => Ok(format!("data:image/png;base64,{}", b64)),
        (None, None) => Err(TollgateError::Generation(
            "image generation returned neither url nor data".into(),
        )),
    }
}

impl ContentGenerator for OpenAiGenerator {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let body = chat_body(&self.config, request);
            debug!(model = %body.model, messages = body.messages.len(), "Chat completion request");
            let text = self.post("chat/completions", &body).await?;
            parse_chat_response(&text)
        })
    }

    fn generate_image(&self, prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let body = image_body(&self.config, prompt);
            debug!(model = %body.model, size = %body.size, "Image generation request");
            let text = self.post("images/generations", &body).await?;
            parse_image_response(&text)
        })
    }
}
