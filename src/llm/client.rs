use crate::pipeline::candidate::TokenUsage;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const ERROR_BODY_PREVIEW_CHARS: usize = 300;

/// Errors surfaced by a model transport.
#[derive(Debug)]
pub enum ModelError {
    /// Non-success HTTP status from the API, with a body preview.
    Status { code: u16, body: String },
    /// The request ran past the transport timeout.
    Timeout,
    /// Connection-level failure: reset, refused, DNS, interrupted transfer.
    Connect(String),
    /// The response body was not the expected completion shape.
    Decode(String),
    /// The reply carried no usable message content.
    EmptyReply,
}

impl ModelError {
    /// Transient failures worth another attempt after backoff. Everything
    /// else indicates a request or account problem that retrying cannot fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Status { code, .. } => matches!(code, 429 | 500 | 502 | 503),
            ModelError::Timeout | ModelError::Connect(_) => true,
            ModelError::Decode(_) | ModelError::EmptyReply => false,
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Status { code, body } => {
                if body.is_empty() {
                    write!(f, "model API returned HTTP {code}")
                } else {
                    write!(f, "model API returned HTTP {code}: {body}")
                }
            }
            ModelError::Timeout => write!(f, "model API request timed out"),
            ModelError::Connect(detail) => write!(f, "model API connection failed: {detail}"),
            ModelError::Decode(detail) => write!(f, "model API reply was undecodable: {detail}"),
            ModelError::EmptyReply => write!(f, "model API reply carried no content"),
        }
    }
}

impl std::error::Error for ModelError {}

/// One chat-style completion request.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub user: String,
}

/// Decoded completion reply with token accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReply {
    pub content: String,
    pub usage: TokenUsage,
}

/// Transport seam for chat-completion calls.
pub trait ModelClient: Send + Sync {
    fn complete(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelReply, ModelError>>;
}

/// `ModelClient` over an OpenAI-style `POST {base}/chat/completions`.
pub struct ChatApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ChatApiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building the model API client")?;

        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
        })
    }

    async fn complete_inner(&self, request: ModelRequest) -> Result<ModelReply, ModelError> {
        let payload = ChatRequest {
            model: &request.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                code: status.as_u16(),
                body: clip(&body, ERROR_BODY_PREVIEW_CHARS),
            });
        }

        let decoded: ChatResponse = response
            .json()
            .await
            .map_err(|err| ModelError::Decode(err.to_string()))?;

        let usage = decoded
            .usage
            .map(|usage| TokenUsage::new(usage.prompt_tokens, usage.completion_tokens))
            .unwrap_or_default();

        let content = decoded
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ModelError::EmptyReply);
        }

        Ok(ModelReply { content, usage })
    }
}

impl ModelClient for ChatApiClient {
    fn complete(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelReply, ModelError>> {
        Box::pin(self.complete_inner(request))
    }
}

fn map_transport_error(err: reqwest::Error) -> ModelError {
    if err.is_timeout() {
        ModelError::Timeout
    } else {
        ModelError::Connect(err.to_string())
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}
