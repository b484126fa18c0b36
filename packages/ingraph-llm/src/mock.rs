//! A deterministic provider used by tests and local development. Real
//! vendor integrations (see `http::HttpProvider`) plug in behind the same
//! trait without touching the gateway.

use crate::error::{LlmError, Result};
use crate::provider::{
    ChatMessage, ChatRequest, ChatResponse, CompletionRequest, CompletionResponse,
    EmbeddingRequest, EmbeddingResponse, LlmProvider,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Always returns a fixed response. Useful for steps that only care about
/// shape (embedding dimension, non-empty text), not content.
pub struct MockProvider {
    response_text: String,
    embedding_dim: usize,
    fail_until: Option<(Arc<AtomicU32>, u32)>,
    always_fail: Option<Arc<AtomicU32>>,
}

impl MockProvider {
    pub fn canned(text: impl Into<String>) -> Self {
        Self {
            response_text: text.into(),
            embedding_dim: 8,
            fail_until: None,
            always_fail: None,
        }
    }

    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    /// Fails with a retryable error for the first `failures` calls (counted
    /// via `counter`), then succeeds with `text`.
    pub fn flaky(counter: Arc<AtomicU32>, failures: u32, text: impl Into<String>) -> Self {
        Self {
            response_text: text.into(),
            embedding_dim: 8,
            fail_until: Some((counter, failures)),
            always_fail: None,
        }
    }

    pub fn always_fails(counter: Arc<AtomicU32>) -> Self {
        Self {
            response_text: String::new(),
            embedding_dim: 8,
            fail_until: None,
            always_fail: Some(counter),
        }
    }

    fn maybe_fail(&self) -> Result<()> {
        if let Some(counter) = &self.always_fail {
            counter.fetch_add(1, Ordering::SeqCst);
            return Err(LlmError::ServiceUnavailable("mock always fails".into()));
        }
        if let Some((counter, failures)) = &self.fail_until {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < *failures {
                return Err(LlmError::ServiceUnavailable(format!("mock failure {n}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
        self.maybe_fail()?;
        Ok(CompletionResponse {
            text: self.response_text.clone(),
            tokens_used: self.response_text.split_whitespace().count() as u32,
        })
    }

    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse> {
        self.maybe_fail()?;
        Ok(ChatResponse {
            message: ChatMessage {
                role: "assistant".to_string(),
                content: self.response_text.clone(),
            },
            tokens_used: self.response_text.split_whitespace().count() as u32,
        })
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        self.maybe_fail()?;
        // Deterministic pseudo-embedding derived from input length so tests
        // can assert on dimension without pulling in a real model.
        let seed = request.input.len() as f32;
        let embedding = (0..self.embedding_dim)
            .map(|i| ((seed + i as f32).sin()))
            .collect();
        Ok(EmbeddingResponse { embedding })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_canned_provider_returns_fixed_text() {
        let provider = MockProvider::canned("hello world");
        let resp = provider
            .complete(CompletionRequest {
                model: "x".into(),
                prompt: "anything".into(),
                max_tokens: None,
                temperature: None,
            })
            .await
            .unwrap();
        assert_eq!(resp.text, "hello world");
    }

    #[tokio::test]
    async fn test_embed_returns_configured_dimension() {
        let provider = MockProvider::canned("x").with_embedding_dim(16);
        let resp = provider
            .embed(EmbeddingRequest {
                model: "embed".into(),
                input: "some code".into(),
            })
            .await
            .unwrap();
        assert_eq!(resp.embedding.len(), 16);
    }

    #[tokio::test]
    async fn test_embed_is_deterministic_for_same_input() {
        let provider = MockProvider::canned("x");
        let a = provider
            .embed(EmbeddingRequest {
                model: "m".into(),
                input: "same text".into(),
            })
            .await
            .unwrap();
        let b = provider
            .embed(EmbeddingRequest {
                model: "m".into(),
                input: "same text".into(),
            })
            .await
            .unwrap();
        assert_eq!(a.embedding, b.embedding);
    }
}
