//! The LLM Gateway: the sole point of contact with the external model
//! service (spec §5). Routes calls by role to a configured model name and
//! retries transient failures with exponential backoff and jitter.

use crate::error::{LlmError, Result};
use crate::metrics::GatewayMetrics;
use crate::provider::{
    ChatRequest, ChatResponse, CompletionRequest, CompletionResponse, EmbeddingRequest,
    EmbeddingResponse, LlmProvider, Role,
};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{instrument, warn};

/// Role→model routing table (spec §6 "model-role map {chat, reasoning,
/// embedding}").
#[derive(Debug, Clone)]
pub struct ModelRoutes {
    routes: HashMap<Role, String>,
}

impl ModelRoutes {
    pub fn new(chat: impl Into<String>, reasoning: impl Into<String>, embedding: impl Into<String>) -> Self {
        let mut routes = HashMap::new();
        routes.insert(Role::Chat, chat.into());
        routes.insert(Role::Reasoning, reasoning.into());
        routes.insert(Role::Embedding, embedding.into());
        Self { routes }
    }

    pub fn model_for(&self, role: Role) -> Result<&str> {
        self.routes
            .get(&role)
            .map(String::as_str)
            .ok_or_else(|| LlmError::ConfigError(format!("no model configured for role {role:?}")))
    }
}

/// Per-call overrides for `max_tokens`/`temperature` (spec §4.2
/// `complete(prompt, model, options)` / `chat(messages, model, options)`).
/// Reasoning-role calls always ignore these (spec §4.2: "Reasoning-role
/// calls omit temperature/max-token options").
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

fn effective_options(role: Role, options: &CallOptions) -> (Option<u32>, Option<f32>) {
    if role == Role::Reasoning {
        (None, None)
    } else {
        (options.max_tokens, options.temperature)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 200,
            backoff_cap_ms: 10_000,
        }
    }
}

/// Wraps any `LlmProvider` with role-based model routing, retry, and
/// metrics. Steps never talk to a provider directly.
pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    routes: ModelRoutes,
    config: GatewayConfig,
    metrics: GatewayMetrics,
}

impl LlmGateway {
    pub fn new(provider: Arc<dyn LlmProvider>, routes: ModelRoutes, config: GatewayConfig) -> Self {
        Self {
            provider,
            routes,
            config,
            metrics: GatewayMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Server-advised delay if present, else exponential backoff with
    /// jitter (spec §4.2: "sleep per server-advised delay (or exponential
    /// backoff with jitter if absent)").
    fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(delay) = retry_after {
            return delay;
        }
        let exp = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.config.backoff_cap_ms);
        let jitter = rand::thread_rng().gen_range(0..=exp / 4 + 1);
        Duration::from_millis(exp + jitter)
    }

    async fn with_retry<T, F, Fut>(&self, role: Role, model: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            self.metrics.record_request(role, model);
            let started = Instant::now();
            let outcome = call().await;
            self.metrics.record_latency(role, model, started.elapsed());
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let retry_after = if let LlmError::RateLimitExceeded { retry_after, .. } = &err {
                        self.metrics.record_rate_limited();
                        *retry_after
                    } else {
                        None
                    };
                    self.metrics.record_retry(role, model);
                    warn!(attempt, error = %err, "llm call failed, retrying");
                    last_err = Some(err);
                    tokio::time::sleep(self.backoff(attempt, retry_after)).await;
                }
                Err(err) => {
                    self.metrics.record_failure(role, model);
                    return Err(err);
                }
            }
        }
        self.metrics.record_failure(role, model);
        Err(LlmError::RetriesExhausted {
            attempts: self.config.max_retries + 1,
            last: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    #[instrument(skip(self, prompt, options))]
    pub async fn complete(
        &self,
        role: Role,
        prompt: String,
        options: CallOptions,
    ) -> Result<CompletionResponse> {
        let model = self.routes.model_for(role)?.to_string();
        let (max_tokens, temperature) = effective_options(role, &options);
        let response = self
            .with_retry(role, &model, || {
                let model = model.clone();
                let prompt = prompt.clone();
                async move {
                    self.provider
                        .complete(CompletionRequest {
                            model,
                            prompt,
                            max_tokens,
                            temperature,
                        })
                        .await
                }
            })
            .await?;
        self.metrics.record_tokens(response.tokens_used);
        Ok(response)
    }

    #[instrument(skip(self, messages, options))]
    pub async fn chat(
        &self,
        role: Role,
        messages: Vec<crate::provider::ChatMessage>,
        options: CallOptions,
    ) -> Result<ChatResponse> {
        let model = self.routes.model_for(role)?.to_string();
        let (max_tokens, temperature) = effective_options(role, &options);
        let response = self
            .with_retry(role, &model, || {
                let model = model.clone();
                let messages = messages.clone();
                async move {
                    self.provider
                        .chat(ChatRequest {
                            model,
                            messages,
                            max_tokens,
                            temperature,
                        })
                        .await
                }
            })
            .await?;
        self.metrics.record_tokens(response.tokens_used);
        Ok(response)
    }

    #[instrument(skip(self, input))]
    pub async fn embed(&self, input: String) -> Result<EmbeddingResponse> {
        let model = self.routes.model_for(Role::Embedding)?.to_string();
        self.with_retry(Role::Embedding, &model, || {
            let model = model.clone();
            let input = input.clone();
            async move { self.provider.embed(EmbeddingRequest { model, input }).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use crate::provider::ChatMessage;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn routes() -> ModelRoutes {
        ModelRoutes::new("gpt-chat", "gpt-reasoning", "text-embedding")
    }

    #[tokio::test]
    async fn test_complete_routes_to_chat_model_role() {
        let gateway = LlmGateway::new(
            Arc::new(MockProvider::canned("hello")),
            routes(),
            GatewayConfig::default(),
        );
        let resp = gateway
            .complete(Role::Chat, "hi".into(), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.text, "hello");
    }

    #[tokio::test]
    async fn test_chat_increments_request_metric() {
        let gateway = LlmGateway::new(
            Arc::new(MockProvider::canned("hi there")),
            routes(),
            GatewayConfig::default(),
        );
        gateway
            .chat(Role::Chat, vec![ChatMessage::user("hello")], CallOptions::default())
            .await
            .unwrap();
        assert_eq!(gateway.metrics().snapshot().requests_total, 1);
    }

    #[tokio::test]
    async fn test_retries_transient_failures_then_succeeds() {
        let fail_then_succeed = Arc::new(AtomicU32::new(0));
        let provider = MockProvider::flaky(fail_then_succeed.clone(), 2, "recovered");
        let mut cfg = GatewayConfig::default();
        cfg.backoff_base_ms = 1;
        cfg.backoff_cap_ms = 2;
        let gateway = LlmGateway::new(Arc::new(provider), routes(), cfg);
        let resp = gateway
            .complete(Role::Chat, "retry me".into(), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.text, "recovered");
        assert_eq!(fail_then_succeed.load(Ordering::SeqCst), 3);
        assert_eq!(gateway.metrics().snapshot().retries_total, 2);
    }

    #[tokio::test]
    async fn test_exhausts_retry_budget_and_surfaces_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = MockProvider::always_fails(calls.clone());
        let mut cfg = GatewayConfig::default();
        cfg.max_retries = 2;
        cfg.backoff_base_ms = 1;
        cfg.backoff_cap_ms = 2;
        let gateway = LlmGateway::new(Arc::new(provider), routes(), cfg);
        let result = gateway.complete(Role::Chat, "x".into(), CallOptions::default()).await;
        assert!(matches!(result, Err(LlmError::RetriesExhausted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unconfigured_role_is_config_error() {
        let mut routes_map = HashMap::new();
        routes_map.insert(Role::Chat, "only-chat".to_string());
        let routes = ModelRoutes { routes: routes_map };
        let gateway = LlmGateway::new(
            Arc::new(MockProvider::canned("x")),
            routes,
            GatewayConfig::default(),
        );
        let result = gateway.embed("text".into()).await;
        assert!(matches!(result, Err(LlmError::ConfigError(_))));
    }

    /// Records the `max_tokens`/`temperature` of the last `chat` call it saw.
    struct RecordingProvider {
        last_options: std::sync::Mutex<Option<(Option<u32>, Option<f32>)>>,
    }

    impl RecordingProvider {
        fn new() -> Self {
            Self { last_options: std::sync::Mutex::new(None) }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for RecordingProvider {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            unreachable!("test only exercises chat")
        }

        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
            *self.last_options.lock().unwrap() = Some((request.max_tokens, request.temperature));
            Ok(ChatResponse {
                message: crate::provider::ChatMessage::user("ok"),
                tokens_used: 1,
            })
        }

        async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse> {
            unreachable!("test only exercises chat")
        }
    }

    #[tokio::test]
    async fn test_chat_options_reach_the_provider() {
        let provider = Arc::new(RecordingProvider::new());
        let gateway = LlmGateway::new(provider.clone(), routes(), GatewayConfig::default());
        let options = CallOptions { max_tokens: Some(256), temperature: Some(0.2) };
        gateway
            .chat(Role::Chat, vec![ChatMessage::user("hi")], options)
            .await
            .unwrap();
        assert_eq!(*provider.last_options.lock().unwrap(), Some((Some(256), Some(0.2))));
    }

    #[tokio::test]
    async fn test_reasoning_role_drops_options() {
        let provider = Arc::new(RecordingProvider::new());
        let gateway = LlmGateway::new(provider.clone(), routes(), GatewayConfig::default());
        let options = CallOptions { max_tokens: Some(256), temperature: Some(0.2) };
        gateway
            .chat(Role::Reasoning, vec![ChatMessage::user("hi")], options)
            .await
            .unwrap();
        assert_eq!(*provider.last_options.lock().unwrap(), Some((None, None)));
    }
}
