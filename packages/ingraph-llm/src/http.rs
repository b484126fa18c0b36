//! An OpenAI-compatible HTTP provider. Talks to any vendor that speaks the
//! `/chat/completions` and `/embeddings` wire format (OpenAI itself, and most
//! self-hosted gateways in front of open models), so one client covers the
//! common case instead of one per vendor. Grounded on the remote client shape
//! in `pcastone-orca`'s `llm/src/remote/openai.rs` (config struct holding a
//! built `reqwest::Client`, request/response structs private to the module,
//! conversion helpers at the edges).

use crate::error::{LlmError, Result};
use crate::provider::{
    ChatMessage, ChatRequest, ChatResponse, CompletionRequest, CompletionResponse,
    EmbeddingRequest, EmbeddingResponse, LlmProvider,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection details for an OpenAI-compatible endpoint. `base_url` has no
/// trailing slash, e.g. `https://api.openai.com/v1`.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl HttpProviderConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct HttpProvider {
    config: HttpProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(LlmError::HttpError)?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }

    async fn send<B: Serialize, R: for<'de> Deserialize<'de>>(&self, path: &str, body: &B) -> Result<R> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(e.to_string())
                } else {
                    LlmError::HttpError(e)
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(LlmError::AuthenticationError(status.to_string()));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimitExceeded {
                message: status.to_string(),
                retry_after,
            });
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(LlmError::ModelNotFound(status.to_string()));
        }
        if status.is_server_error() {
            return Err(LlmError::ServiceUnavailable(status.to_string()));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::InvalidRequest(format!("{status}: {text}")));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    role: String,
    content: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let chat = self
            .chat(ChatRequest {
                model: request.model,
                messages: vec![ChatMessage::user(request.prompt)],
                max_tokens: request.max_tokens,
                temperature: request.temperature,
            })
            .await?;
        Ok(CompletionResponse {
            text: chat.message.content,
            tokens_used: chat.tokens_used,
        })
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let messages = request
            .messages
            .iter()
            .map(|m| WireMessage {
                role: &m.role,
                content: &m.content,
            })
            .collect();
        let wire = ChatCompletionRequest {
            model: &request.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response: ChatCompletionResponse = self.send("/chat/completions", &wire).await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices in chat completion response".into()))?;

        Ok(ChatResponse {
            message: ChatMessage {
                role: choice.message.role,
                content: choice.message.content,
            },
            tokens_used: response.usage.unwrap_or_default().total_tokens,
        })
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        let wire = EmbeddingsRequest {
            model: &request.model,
            input: &request.input,
        };
        let response: EmbeddingsResponse = self.send("/embeddings", &wire).await?;
        let data = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no embedding data in response".into()))?;
        Ok(EmbeddingResponse { embedding: data.embedding })
    }
}
