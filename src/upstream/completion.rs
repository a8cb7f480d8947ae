//! Chat completion adapter (OpenAI-compatible `/chat/completions`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::classify_transport;
use super::{Upstream, UpstreamError};
use crate::budget::Service;
use crate::cache::{CacheKey, KeyClass};

/// One consolidated completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    /// Identifies the prompt template; part of the cache key.
    pub template_id: String,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Precomputed from the model, template and trip parameters.
    pub key: CacheKey,
}

/// Token usage as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Text returned by the completion service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Completion {
    pub text: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    model: Option<String>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Parse a successful `/chat/completions` body.
pub(crate) fn parse_chat_response(body: &str) -> Result<Completion, UpstreamError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| UpstreamError::malformed(format!("unparseable completion response: {}", e)))?;

    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| UpstreamError::malformed("completion response had no content"))?;

    Ok(Completion {
        text,
        model: response.model,
        usage: response.usage,
    })
}

/// HTTP client for an OpenAI-compatible completion API.
pub struct OpenAiCompletionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompletionClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }
}

#[async_trait]
impl Upstream for OpenAiCompletionClient {
    type Params = CompletionRequest;
    type Output = Completion;

    fn service(&self) -> Service {
        Service::Completion
    }

    fn key_class(&self) -> KeyClass {
        KeyClass::Completion
    }

    fn cache_key(&self, params: &CompletionRequest) -> CacheKey {
        params.key.clone()
    }

    async fn call(&self, params: &CompletionRequest) -> Result<Completion, UpstreamError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| UpstreamError::unauthorized("completion API key is not configured"))?;

        let body = ChatRequest {
            model: &params.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &params.system,
                },
                ChatMessage {
                    role: "user",
                    content: &params.prompt,
                },
            ],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| classify_transport(&e))?;
        if !status.is_success() {
            return Err(UpstreamError::from_http(status.as_u16(), &text));
        }

        let completion = parse_chat_response(&text)?;
        tracing::debug!(
            model = completion.model.as_deref().unwrap_or(&params.model),
            total_tokens = completion.usage.as_ref().map(|u| u.total_tokens),
            "Completion received"
        );
        Ok(completion)
    }
}
