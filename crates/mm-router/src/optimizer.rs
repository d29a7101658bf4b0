//! Bridge to the legacy workflow optimizer.
//!
//! The legacy component keeps its own per-agent-type model assignments and
//! statistics; this bridge keeps the two systems honest with each other
//! without reimplementing the optimizer. Three duties: serve legacy-shaped
//! assignment lookups from live selection, push performance feedback after
//! recorded observations, and notify the legacy side whenever a failover
//! overrode its assignment.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use mm_core::{FailoverEvent, ModelRequest, TaskPriority};

use crate::error::RouterError;
use crate::perf::PerformanceSnapshot;
use crate::selector::ModelSelector;

// ---------------------------------------------------------------------------
// Legacy-shaped assignment
// ---------------------------------------------------------------------------

/// A model assignment in the shape the legacy optimizer expects: one primary
/// plus ordered fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAssignment {
    pub agent_type: String,
    pub primary_model: String,
    pub fallback_models: Vec<String>,
}

// ---------------------------------------------------------------------------
// ModelOptimizer trait
// ---------------------------------------------------------------------------

/// The legacy optimizer's receiving side. The real component lives outside
/// this crate; callers plug in their own implementation.
#[async_trait]
pub trait ModelOptimizer: Send + Sync {
    /// Feedback hook: latest rolling performance for one model.
    async fn push_performance(&self, snapshot: &PerformanceSnapshot);

    /// The router overrode an assignment mid-request.
    async fn notify_failover(&self, event: &FailoverEvent);
}

/// Records every call it receives. Doubles as the no-op default in tests and
/// embedded setups that run without the legacy optimizer.
#[derive(Default)]
pub struct RecordingOptimizer {
    pushed: Mutex<Vec<PerformanceSnapshot>>,
    notified: Mutex<Vec<FailoverEvent>>,
}

impl RecordingOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pushed_snapshots(&self) -> Vec<PerformanceSnapshot> {
        self.pushed.lock().await.clone()
    }

    pub async fn failover_notifications(&self) -> Vec<FailoverEvent> {
        self.notified.lock().await.clone()
    }
}

#[async_trait]
impl ModelOptimizer for RecordingOptimizer {
    async fn push_performance(&self, snapshot: &PerformanceSnapshot) {
        self.pushed.lock().await.push(snapshot.clone());
    }

    async fn notify_failover(&self, event: &FailoverEvent) {
        self.notified.lock().await.push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// OptimizerBridge
// ---------------------------------------------------------------------------

pub struct OptimizerBridge {
    selector: Arc<ModelSelector>,
    optimizer: Arc<dyn ModelOptimizer>,
    /// Fallbacks included in an assignment, after the primary.
    fallback_count: usize,
}

impl OptimizerBridge {
    pub fn new(selector: Arc<ModelSelector>, optimizer: Arc<dyn ModelOptimizer>) -> Self {
        Self {
            selector,
            optimizer,
            fallback_count: 2,
        }
    }

    /// Legacy-compatible assignment lookup: ranks the catalog for a synthetic
    /// request with the given capabilities and returns primary + fallbacks.
    pub async fn assignment_for(
        &self,
        agent_type: &str,
        required_capabilities: &[String],
    ) -> Result<ModelAssignment, RouterError> {
        let mut request = ModelRequest::new("", agent_type).with_priority(TaskPriority::Normal);
        request.required_capabilities = required_capabilities.to_vec();

        let ranked = self.selector.rank_candidates(&request).await?;
        let mut ids = ranked.iter().map(|c| c.model.id.clone());
        let primary_model = ids.next().ok_or(RouterError::NoAvailableModel {
            request_id: request.task_id,
            required: required_capabilities.to_vec(),
        })?;
        let fallback_models: Vec<String> = ids.take(self.fallback_count).collect();

        debug!(
            agent_type,
            primary = %primary_model,
            fallbacks = fallback_models.len(),
            "assignment resolved for legacy caller"
        );
        Ok(ModelAssignment {
            agent_type: agent_type.to_string(),
            primary_model,
            fallback_models,
        })
    }

    /// Forward the latest rolling metrics for a model to the legacy side.
    pub async fn push_performance(&self, snapshot: &PerformanceSnapshot) {
        self.optimizer.push_performance(snapshot).await;
    }

    /// Tell the legacy side its assignment was overridden.
    pub async fn notify_failover(&self, event: &FailoverEvent) {
        self.optimizer.notify_failover(event).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthChecker;
    use crate::perf::PerformanceMonitor;
    use crate::rate_limiter::RateLimiter;
    use crate::registry::ModelRegistry;
    use chrono::Utc;
    use mm_core::config::{HealthSettings, PerformanceSettings};
    use mm_core::{FailoverReason, ModelMetadata};
    use std::time::Duration;
    use uuid::Uuid;

    fn model(id: &str, rate: f64) -> ModelMetadata {
        ModelMetadata {
            id: id.into(),
            provider: "anthropic".into(),
            capabilities: ["code"].into_iter().map(String::from).collect(),
            cost_per_1k_input: rate,
            cost_per_1k_output: rate * 2.0,
            requests_per_window: 100,
            tokens_per_window: None,
            context_window: 100_000,
            enabled: true,
            base_url: None,
        }
    }

    async fn bridge_with_models(ids_rates: &[(&str, f64)]) -> (OptimizerBridge, Arc<RecordingOptimizer>) {
        let registry = Arc::new(ModelRegistry::new());
        for (id, rate) in ids_rates {
            registry.add_model(model(id, *rate)).await.unwrap();
        }
        let selector = Arc::new(ModelSelector::new(
            registry,
            Arc::new(RateLimiter::new(Duration::from_secs(60), 0.90)),
            Arc::new(PerformanceMonitor::new(PerformanceSettings::default())),
            Arc::new(HealthChecker::new(HealthSettings::default())),
        ));
        let recorder = Arc::new(RecordingOptimizer::new());
        (OptimizerBridge::new(selector, recorder.clone()), recorder)
    }

    #[tokio::test]
    async fn assignment_has_primary_and_ranked_fallbacks() {
        let (bridge, _) = bridge_with_models(&[
            ("cheap", 0.001),
            ("mid", 0.005),
            ("dear", 0.02),
            ("dearest", 0.05),
        ])
        .await;

        let assignment = bridge
            .assignment_for("implementer", &["code".to_string()])
            .await
            .unwrap();
        assert_eq!(assignment.agent_type, "implementer");
        assert_eq!(assignment.primary_model, "cheap");
        // Two fallbacks, best-first, primary excluded.
        assert_eq!(assignment.fallback_models, vec!["mid", "dear"]);
    }

    #[tokio::test]
    async fn assignment_errors_when_nothing_qualifies() {
        let (bridge, _) = bridge_with_models(&[("cheap", 0.001)]).await;
        let err = bridge
            .assignment_for("analyst", &["vision".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "no_available_model");
    }

    #[tokio::test]
    async fn performance_and_failover_forwarded() {
        let (bridge, recorder) = bridge_with_models(&[("cheap", 0.001)]).await;

        let snapshot = PerformanceSnapshot {
            model_id: "cheap".into(),
            sample_count: 10,
            success_rate: 0.9,
            avg_latency_ms: 120.0,
            p95_latency_ms: 300,
            avg_quality: Some(0.8),
            degraded: false,
        };
        bridge.push_performance(&snapshot).await;

        let event = FailoverEvent {
            timestamp: Utc::now(),
            from_model: "cheap".into(),
            to_model: "mid".into(),
            reason: FailoverReason::Error,
            task_id: Uuid::new_v4(),
            attempt: 1,
        };
        bridge.notify_failover(&event).await;

        let pushed = recorder.pushed_snapshots().await;
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].model_id, "cheap");

        let notified = recorder.failover_notifications().await;
        assert_eq!(notified.len(), 1);
        assert_eq!(notified[0].to_model, "mid");
    }
}
