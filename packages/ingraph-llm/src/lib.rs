//! LLM Gateway (spec §4.2): a unified `complete`/`chat`/`embed` surface over
//! a pluggable provider, with role-based model routing, retry with
//! exponential backoff and jitter, and per-call metrics.

pub mod composite;
pub mod error;
pub mod gateway;
pub mod http;
pub mod metrics;
pub mod mock;
pub mod provider;

pub use composite::CompositeProvider;
pub use error::{LlmError, Result};
pub use gateway::{CallOptions, GatewayConfig, LlmGateway, ModelRoutes};
pub use http::{HttpProvider, HttpProviderConfig};
pub use metrics::{CallMetrics, GatewayMetrics, MetricsSnapshot};
pub use mock::MockProvider;
pub use provider::{
    ChatMessage, ChatRequest, ChatResponse, CompletionRequest, CompletionResponse,
    EmbeddingRequest, EmbeddingResponse, LlmProvider, Role,
};
