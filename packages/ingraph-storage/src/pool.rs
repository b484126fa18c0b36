//! Connection policy: fallback-candidate chain and exponential-backoff retry
//! (spec §4.1 "Connection policy" / "Retry"). Backend-agnostic; the SQLite
//! adapter uses it over an ordered list of file paths, standing in for the
//! spec's host-candidate chain over a real service.

use crate::error::{Result, StorageError};
use std::time::Duration;
use tracing::{info, warn};

/// Exponential backoff with a cap, mirroring the ingestion producers'
/// `RetryConfig` shape elsewhere in this lineage (base delay, hard cap,
/// bounded attempt count).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(20));
        Duration::from_millis(exp.min(self.max_delay_ms))
    }
}

/// An ordered list of connection candidates tried in sequence at startup and
/// on first failure (spec §4.1). The first candidate to succeed is cached
/// for the process lifetime until a failure forces re-selection.
#[derive(Debug, Clone)]
pub struct CandidateChain {
    candidates: Vec<String>,
}

impl CandidateChain {
    pub fn new(candidates: Vec<String>) -> Result<Self> {
        if candidates.is_empty() {
            return Err(StorageError::config("candidate chain must not be empty"));
        }
        Ok(Self { candidates })
    }

    pub fn single(candidate: impl Into<String>) -> Self {
        Self {
            candidates: vec![candidate.into()],
        }
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Tries `connect` against each candidate in order, retrying each one up
    /// to `retry.max_attempts` times with exponential backoff before moving
    /// to the next candidate. Returns the first successful connection and
    /// the candidate that produced it.
    pub async fn connect<T, F, Fut>(&self, retry: &RetryConfig, mut connect: F) -> Result<(T, String)>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_err: Option<StorageError> = None;
        for candidate in &self.candidates {
            for attempt in 0..retry.max_attempts {
                match connect(candidate.clone()).await {
                    Ok(conn) => {
                        if attempt > 0 {
                            info!(candidate = %candidate, attempt, "connected after retry");
                        }
                        return Ok((conn, candidate.clone()));
                    }
                    Err(err) if err.retryable && attempt + 1 < retry.max_attempts => {
                        warn!(candidate = %candidate, attempt, error = %err, "connect attempt failed, retrying");
                        tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                        last_err = Some(err);
                    }
                    Err(err) => {
                        warn!(candidate = %candidate, attempt, error = %err, "candidate exhausted");
                        last_err = Some(err);
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| StorageError::connection("no candidates configured")))
    }
}
