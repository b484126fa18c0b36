//! A provider that dispatches each call to a different underlying provider
//! per role. The concrete adapter point for mixing vendors — e.g. a chat
//! model from one vendor and an embedding model from another — without the
//! gateway knowing.

use crate::error::{LlmError, Result};
use crate::provider::{
    ChatRequest, ChatResponse, CompletionRequest, CompletionResponse, EmbeddingRequest,
    EmbeddingResponse, LlmProvider, Role,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub struct CompositeProvider {
    by_role: HashMap<Role, Arc<dyn LlmProvider>>,
}

impl CompositeProvider {
    pub fn new() -> Self {
        Self {
            by_role: HashMap::new(),
        }
    }

    pub fn with_provider(mut self, role: Role, provider: Arc<dyn LlmProvider>) -> Self {
        self.by_role.insert(role, provider);
        self
    }

    fn for_role(&self, role: Role) -> Result<&Arc<dyn LlmProvider>> {
        self.by_role
            .get(&role)
            .ok_or_else(|| LlmError::ConfigError(format!("no provider registered for role {role:?}")))
    }
}

impl Default for CompositeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for CompositeProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.for_role(Role::Chat)?.complete(request).await
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.for_role(Role::Chat)?.chat(request).await
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        self.for_role(Role::Embedding)?.embed(request).await
    }
}
