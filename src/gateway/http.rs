//! HTTP provider backends.
//!
//! - [`OpenAiCompatibleBackend`]: `POST {base}/v1/chat/completions` with a
//!   bearer key. Covers OpenAI and the many providers exposing the same
//!   schema (DeepSeek, Mistral, Groq, …) via `with_base_url`.
//! - [`AnthropicBackend`]: `POST {base}/v1/messages` with `x-api-key`.
//!
//! Both map HTTP status codes onto [`FailureKind`] with [`classify_status`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{estimate_tokens, BackendError, BackendRequest, FailureKind, Generation, ProviderBackend};

const POLICY_MARKERS: &[&str] = &[
    "content_policy",
    "content policy",
    "content_filter",
    "safety system",
    "flagged",
];

const MISSING_MODEL_MARKERS: &[&str] = &[
    "model_not_found",
    "does not exist",
    "unknown model",
    "unsupported model",
    "not_found_error",
];

/// Map an HTTP status and error body onto a [`FailureKind`].
///
/// # Panics
///
/// This function never panics.
pub fn classify_status(status: u16, body: &str) -> FailureKind {
    let lower = body.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));
    match status {
        429 => FailureKind::RateLimited,
        401 | 403 => FailureKind::Authentication,
        404 => FailureKind::UnsupportedModel,
        408 => FailureKind::Timeout,
        400 | 422 if has(POLICY_MARKERS) => FailureKind::ContentPolicy,
        400 | 422 if has(MISSING_MODEL_MARKERS) => FailureKind::UnsupportedModel,
        500..=599 => FailureKind::ServerError,
        _ => FailureKind::MalformedRequest,
    }
}

fn transport_error(provider: &str, e: &reqwest::Error) -> BackendError {
    let kind = if e.is_timeout() {
        FailureKind::Timeout
    } else {
        FailureKind::Transport
    };
    BackendError::new(kind, format!("{provider} request failed: {e}"))
}

async fn status_error(response: reqwest::Response) -> BackendError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let kind = classify_status(status, &body);
    BackendError::new(kind, format!("HTTP {status}: {body}"))
}

// ============================================================================
// OpenAI-compatible chat completions
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: u64,
}

/// OpenAI-compatible chat completions backend.
///
/// ## Example
///
/// ```no_run
/// use critique_orchestrator::gateway::OpenAiCompatibleBackend;
///
/// let deepseek = OpenAiCompatibleBackend::new()
///     .with_base_url("https://api.deepseek.com")
///     .with_max_tokens(1024);
/// ```
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleBackend {
    client: reqwest::Client,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
}

impl Default for OpenAiCompatibleBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiCompatibleBackend {
    /// Backend pointed at `https://api.openai.com`.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com".to_string(),
            max_tokens: 1024,
            temperature: 0.7,
        }
    }

    /// Override the API root (no trailing `/v1`).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set maximum completion tokens.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set sampling temperature (0.0 - 2.0).
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl ProviderBackend for OpenAiCompatibleBackend {
    async fn generate(&self, request: &BackendRequest) -> Result<Generation, BackendError> {
        let body = ChatRequest {
            model: &request.model_id,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(request.api_key.expose())
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&request.provider, &e))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            BackendError::new(
                FailureKind::ServerError,
                format!("failed to parse response: {e}"),
            )
        })?;

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(BackendError::new(
                FailureKind::ServerError,
                "no choices in response",
            ));
        };
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(BackendError::new(
                FailureKind::ContentPolicy,
                "completion withheld by content filter",
            ));
        }

        let text = choice.message.content.unwrap_or_default();
        let tokens = parsed
            .usage
            .map_or_else(|| estimate_tokens(&request.prompt, &text), |u| u.total_tokens);
        debug!(provider = %request.provider, tokens, "chat completion received");
        Ok(Generation { text, tokens })
    }
}

// ============================================================================
// Anthropic Messages
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u64,
    output_tokens: u64,
}

/// Anthropic Messages API backend.
#[derive(Debug, Clone)]
pub struct AnthropicBackend {
    client: reqwest::Client,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
}

impl Default for AnthropicBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AnthropicBackend {
    /// Backend pointed at `https://api.anthropic.com`.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 1024,
            temperature: 1.0,
        }
    }

    /// Override the API root (no trailing `/v1`).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set maximum completion tokens.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set sampling temperature (0.0 - 1.0).
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl ProviderBackend for AnthropicBackend {
    async fn generate(&self, request: &BackendRequest) -> Result<Generation, BackendError> {
        let body = MessagesRequest {
            model: &request.model_id,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", request.api_key.expose())
            .header("anthropic-version", "2023-06-01")
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&request.provider, &e))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let parsed: MessagesResponse = response.json().await.map_err(|e| {
            BackendError::new(
                FailureKind::ServerError,
                format!("failed to parse response: {e}"),
            )
        })?;

        if parsed.stop_reason.as_deref() == Some("refusal") {
            return Err(BackendError::new(
                FailureKind::ContentPolicy,
                "model refused the request",
            ));
        }

        let text: String = parsed
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        let tokens = parsed.usage.map_or_else(
            || estimate_tokens(&request.prompt, &text),
            |u| u.input_tokens + u.output_tokens,
        );
        debug!(provider = %request.provider, tokens, "message received");
        Ok(Generation { text, tokens })
    }
}
