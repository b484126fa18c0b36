//! Declarative engine configuration (spec §6 "steps, concurrency, retries,
//! options; graph-store URI/pool/timeout; LLM endpoint/model-role map"),
//! parsed once at startup with `serde_yaml` into an immutable snapshot and
//! distributed by `Arc`. Grounded on `pcastone-orca`'s `ServerConfig::load`
//! (config-from-file-with-env-fallback shape); hot-reload follows spec.md §9
//! "no process-wide mutable state" by publishing new snapshots through a
//! `tokio::sync::watch` channel rather than mutating one in place.

use anyhow::{Context, Result};
use ingraph_jobs::StepDescriptor;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStoreConfig {
    /// Candidate connection strings tried in order (`ingraph_storage::CandidateChain`).
    pub candidates: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStoreConfig {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoutesConfig {
    pub chat: String,
    pub reasoning: String,
    pub embedding: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible endpoint. Omitted in local/dev
    /// configs, which fall back to `ingraph_llm::MockProvider`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub models: ModelRoutesConfig,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_cap_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AstParserConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The engine's full declarative configuration. Immutable once loaded; a
/// running process only ever sees new values by swapping its `Arc` via the
/// watch channel in `ConfigHandle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub graph_store: GraphStoreConfig,
    pub job_store: JobStoreConfig,
    pub llm: LlmConfig,
    pub ast_parser: AstParserConfig,
    pub steps: Vec<StepDescriptor>,
}

impl EngineConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("parsing engine configuration")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        Self::from_yaml_str(&raw)
    }

    pub fn step(&self, name: &str) -> Option<&StepDescriptor> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.llm.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.llm.backoff_cap_ms)
    }
}

/// A single-writer, many-reader hot-reload channel over `EngineConfig`
/// snapshots. Holding a `watch::Receiver` lets any component read the
/// latest config without ever taking a lock on shared mutable state.
pub struct ConfigHandle {
    sender: watch::Sender<Arc<EngineConfig>>,
}

impl ConfigHandle {
    pub fn new(initial: EngineConfig) -> Self {
        let (sender, _receiver) = watch::channel(Arc::new(initial));
        Self { sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<EngineConfig>> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> Arc<EngineConfig> {
        self.sender.borrow().clone()
    }

    /// Publishes a freshly loaded config as the new snapshot. Subscribers
    /// observe it on their next poll; in-flight work keeps the `Arc` it
    /// already holds.
    pub fn publish(&self, next: EngineConfig) {
        let _ = self.sender.send(Arc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
graph_store:
  candidates:
    - "sqlite://var/ingraph.db"
    - ":memory:"
job_store:
  uri: "sqlite://var/jobs.db"
llm:
  models:
    chat: "gpt-4o-mini"
    reasoning: "gpt-4o"
    embedding: "text-embedding-3-small"
ast_parser:
  program: "ingraph-parser"
steps:
  - name: "filesystem"
    concurrency: 1
    retries: 2
    backoff_seconds: 1
  - name: "ast"
    concurrency: 1
    retries: 2
    backoff_seconds: 1
"#
    }

    #[test]
    fn test_parses_minimal_config_with_defaults() {
        let config = EngineConfig::from_yaml_str(sample_yaml()).unwrap();
        assert_eq!(config.llm.max_retries, 3);
        assert_eq!(config.graph_store.max_attempts, 3);
        assert_eq!(config.steps.len(), 2);
        assert!(config.llm.base_url.is_none());
    }

    #[test]
    fn test_step_lookup_by_name() {
        let config = EngineConfig::from_yaml_str(sample_yaml()).unwrap();
        assert!(config.step("ast").is_some());
        assert!(config.step("summarizer").is_none());
    }

    #[test]
    fn test_malformed_yaml_is_rejected() {
        let err = EngineConfig::from_yaml_str("not: [valid, engine, config").unwrap_err();
        assert!(err.to_string().contains("parsing engine configuration"));
    }

    #[tokio::test]
    async fn test_config_handle_publishes_new_snapshot() {
        let config = EngineConfig::from_yaml_str(sample_yaml()).unwrap();
        let handle = ConfigHandle::new(config.clone());
        let mut receiver = handle.subscribe();

        let mut updated = config;
        updated.llm.max_retries = 9;
        handle.publish(updated);

        receiver.changed().await.unwrap();
        assert_eq!(receiver.borrow().llm.max_retries, 9);
    }
}
