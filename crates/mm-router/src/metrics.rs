//! Aggregate metrics reporting.
//!
//! Builds a JSON-serializable report straight from the store plus live cache
//! and health state, so it is never staler than the last recorded event.
//! The same `RecordFilter` the store understands scopes the report by time
//! range, model, provider, or agent type.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mm_core::{FailoverEvent, RecordFilter, RouterStore};

use crate::cache::{CacheManager, CacheStats};
use crate::error::RouterError;
use crate::health::{HealthChecker, ModelStatus};

// ---------------------------------------------------------------------------
// Report shape
// ---------------------------------------------------------------------------

/// Aggregates for one model inside a report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model_id: String,
    pub requests: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub total_cost_usd: f64,
    pub cost_per_request: f64,
}

/// The full aggregate report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub generated_at: DateTime<Utc>,
    pub requests: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub cost_per_request: f64,
    pub per_model: Vec<ModelMetrics>,
    pub cache: CacheStats,
    pub health: Vec<ModelStatus>,
    pub recent_failovers: Vec<FailoverEvent>,
}

// ---------------------------------------------------------------------------
// MetricsExporter
// ---------------------------------------------------------------------------

pub struct MetricsExporter {
    store: Arc<RouterStore>,
    cache: Arc<CacheManager>,
    health: Arc<HealthChecker>,
}

impl MetricsExporter {
    pub fn new(
        store: Arc<RouterStore>,
        cache: Arc<CacheManager>,
        health: Arc<HealthChecker>,
    ) -> Self {
        Self {
            store,
            cache,
            health,
        }
    }

    /// Build a report over the filtered range. Failover history honors the
    /// filter's `since` bound, defaulting to the trailing 24 hours.
    pub async fn report(&self, filter: RecordFilter) -> Result<MetricsReport, RouterError> {
        let perf_records = self.store.query_performance_records(filter.clone()).await?;
        let cost_records = self.store.query_cost_records(filter.clone()).await?;
        let failover_since = filter
            .since
            .unwrap_or_else(|| Utc::now() - chrono::Duration::hours(24));
        let recent_failovers = self
            .store
            .failover_history(filter.model_id.as_deref(), failover_since)
            .await?;

        let requests = perf_records.len() as u64;
        let successes = perf_records.iter().filter(|r| r.success).count() as u64;
        let mut latencies: Vec<u64> = perf_records.iter().map(|r| r.latency_ms).collect();
        latencies.sort_unstable();

        let total_cost_usd: f64 = cost_records.iter().map(|r| r.cost_usd).sum();
        let total_input_tokens: u64 = cost_records.iter().map(|r| r.input_tokens).sum();
        let total_output_tokens: u64 = cost_records.iter().map(|r| r.output_tokens).sum();

        // Per-model breakdown, id-sorted via the BTreeMap.
        let mut by_model: BTreeMap<String, (Vec<u64>, u64, u64, f64)> = BTreeMap::new();
        for record in &perf_records {
            let entry = by_model.entry(record.model_id.clone()).or_default();
            entry.0.push(record.latency_ms);
            entry.1 += 1;
            if record.success {
                entry.2 += 1;
            }
        }
        for record in &cost_records {
            let entry = by_model.entry(record.model_id.clone()).or_default();
            entry.3 += record.cost_usd;
        }
        let per_model = by_model
            .into_iter()
            .map(|(model_id, (mut lat, count, ok, cost))| {
                lat.sort_unstable();
                ModelMetrics {
                    model_id,
                    requests: count,
                    success_rate: ratio(ok, count),
                    avg_latency_ms: mean(&lat),
                    p95_latency_ms: percentile_95(&lat),
                    total_cost_usd: cost,
                    cost_per_request: if count > 0 { cost / count as f64 } else { 0.0 },
                }
            })
            .collect();

        Ok(MetricsReport {
            generated_at: Utc::now(),
            requests,
            success_rate: ratio(successes, requests),
            avg_latency_ms: mean(&latencies),
            p95_latency_ms: percentile_95(&latencies),
            total_input_tokens,
            total_output_tokens,
            total_cost_usd,
            cost_per_request: if requests > 0 {
                total_cost_usd / requests as f64
            } else {
                0.0
            },
            per_model,
            cache: self.cache.stats().await,
            health: self.health.all_statuses(),
            recent_failovers,
        })
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn mean(sorted: &[u64]) -> f64 {
    if sorted.is_empty() {
        0.0
    } else {
        sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
    }
}

/// 95th percentile of an ascending-sorted slice; 0 when empty.
fn percentile_95(sorted: &[u64]) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
    sorted[index]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
