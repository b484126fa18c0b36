//! Per-call gateway metrics, tagged by role and model (spec §4.2: "per-call
//! counters {calls, retries, failures, latency_ms} tagged by model and
//! role"). Atomic counters per tag by default; an optional `prometheus`
//! feature registers the same aggregate counters with a real registry,
//! matching the orchestration crate's own optional metrics feature.

use crate::provider::Role;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    latency_ms_total: AtomicU64,
}

pub struct GatewayMetrics {
    by_tag: DashMap<(Role, String), Arc<Counters>>,
    rate_limited_total: AtomicU64,
    tokens_used_total: AtomicU64,

    #[cfg(feature = "metrics")]
    prom: PromCounters,
}

#[cfg(feature = "metrics")]
struct PromCounters {
    requests: prometheus::IntCounter,
    failures: prometheus::IntCounter,
    retries: prometheus::IntCounter,
}

#[cfg(feature = "metrics")]
impl Default for PromCounters {
    fn default() -> Self {
        Self {
            requests: prometheus::IntCounter::new("llm_requests_total", "LLM calls issued")
                .expect("valid metric"),
            failures: prometheus::IntCounter::new("llm_requests_failed_total", "LLM calls failed")
                .expect("valid metric"),
            retries: prometheus::IntCounter::new("llm_retries_total", "LLM call retries")
                .expect("valid metric"),
        }
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            by_tag: DashMap::new(),
            rate_limited_total: AtomicU64::new(0),
            tokens_used_total: AtomicU64::new(0),
            #[cfg(feature = "metrics")]
            prom: PromCounters::default(),
        }
    }

    fn counters_for(&self, role: Role, model: &str) -> Arc<Counters> {
        self.by_tag
            .entry((role, model.to_string()))
            .or_insert_with(|| Arc::new(Counters::default()))
            .clone()
    }

    pub fn record_request(&self, role: Role, model: &str) {
        self.counters_for(role, model).calls.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        self.prom.requests.inc();
    }

    pub fn record_failure(&self, role: Role, model: &str) {
        self.counters_for(role, model).failures.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        self.prom.failures.inc();
    }

    pub fn record_retry(&self, role: Role, model: &str) {
        self.counters_for(role, model).retries.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        self.prom.retries.inc();
    }

    pub fn record_latency(&self, role: Role, model: &str, elapsed: Duration) {
        self.counters_for(role, model)
            .latency_ms_total
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tokens(&self, tokens: u32) {
        self.tokens_used_total.fetch_add(tokens as u64, Ordering::Relaxed);
    }

    /// Snapshot of counters for one `(role, model)` tag.
    pub fn snapshot_for(&self, role: Role, model: &str) -> CallMetrics {
        let counters = self.counters_for(role, model);
        CallMetrics {
            calls: counters.calls.load(Ordering::Relaxed),
            retries: counters.retries.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            latency_ms_total: counters.latency_ms_total.load(Ordering::Relaxed),
        }
    }

    /// Snapshot aggregated across every tag seen so far.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut requests_total = 0;
        let mut retries_total = 0;
        let mut requests_failed = 0;
        let mut latency_ms_total = 0;
        for entry in self.by_tag.iter() {
            requests_total += entry.calls.load(Ordering::Relaxed);
            retries_total += entry.retries.load(Ordering::Relaxed);
            requests_failed += entry.failures.load(Ordering::Relaxed);
            latency_ms_total += entry.latency_ms_total.load(Ordering::Relaxed);
        }
        MetricsSnapshot {
            requests_total,
            requests_failed,
            retries_total,
            rate_limited_total: self.rate_limited_total.load(Ordering::Relaxed),
            tokens_used_total: self.tokens_used_total.load(Ordering::Relaxed),
            latency_ms_total,
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for a single `(role, model)` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallMetrics {
    pub calls: u64,
    pub retries: u64,
    pub failures: u64,
    pub latency_ms_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub retries_total: u64,
    pub rate_limited_total: u64,
    pub tokens_used_total: u64,
    pub latency_ms_total: u64,
}
