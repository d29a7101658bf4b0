//! Weighted model selection.
//!
//! Filters the catalog by required capability, drops models that are
//! unavailable or rate-limited, and ranks the survivors by a weighted
//! suitability score. Priority shifts the weights: urgent work pays for
//! performance, background work pays for thrift. Ties break toward the
//! cheaper model, then id order, so selection is reproducible.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use mm_core::{HealthState, ModelMetadata, ModelRequest, RateLimitStatus, TaskPriority};

use crate::error::RouterError;
use crate::health::HealthChecker;
use crate::perf::PerformanceMonitor;
use crate::rate_limiter::RateLimiter;
use crate::registry::ModelRegistry;

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

/// Suitability weights. Each set sums to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub capability: f64,
    pub cost: f64,
    pub performance: f64,
    pub availability: f64,
}

impl ScoringWeights {
    /// Normal and Low priority.
    pub const BALANCED: Self = Self {
        capability: 0.30,
        cost: 0.25,
        performance: 0.25,
        availability: 0.20,
    };

    /// Critical and High priority: performance over cost.
    pub const URGENT: Self = Self {
        capability: 0.30,
        cost: 0.10,
        performance: 0.40,
        availability: 0.20,
    };

    /// Background priority: cost over performance.
    pub const THRIFT: Self = Self {
        capability: 0.30,
        cost: 0.40,
        performance: 0.10,
        availability: 0.20,
    };

    pub fn for_priority(priority: TaskPriority) -> Self {
        match priority {
            TaskPriority::Critical | TaskPriority::High => Self::URGENT,
            TaskPriority::Normal | TaskPriority::Low => Self::BALANCED,
            TaskPriority::Background => Self::THRIFT,
        }
    }
}

/// Neutral performance prior for models with no recorded history.
const NEUTRAL_PERFORMANCE: f64 = 0.7;

// ---------------------------------------------------------------------------
// Ranked output
// ---------------------------------------------------------------------------

/// One scored candidate; the selector returns these best-first.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub model: Arc<ModelMetadata>,
    pub score: f64,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// ModelSelector
// ---------------------------------------------------------------------------

pub struct ModelSelector {
    registry: Arc<ModelRegistry>,
    rate_limiter: Arc<RateLimiter>,
    performance: Arc<PerformanceMonitor>,
    health: Arc<HealthChecker>,
}

impl ModelSelector {
    pub fn new(
        registry: Arc<ModelRegistry>,
        rate_limiter: Arc<RateLimiter>,
        performance: Arc<PerformanceMonitor>,
        health: Arc<HealthChecker>,
    ) -> Self {
        Self {
            registry,
            rate_limiter,
            performance,
            health,
        }
    }

    /// The best candidate for the request.
    pub async fn select_model(&self, request: &ModelRequest) -> Result<RankedCandidate, RouterError> {
        let ranked = self.rank_candidates(request).await?;
        ranked
            .into_iter()
            .next()
            .ok_or(RouterError::NoAvailableModel {
                request_id: request.task_id,
                required: request.required_capabilities.clone(),
            })
    }

    /// Every eligible candidate, best first. Models that are unavailable or
    /// at their rate limit never appear, so an empty survivor set is an
    /// explicit error rather than a silent bad pick.
    pub async fn rank_candidates(
        &self,
        request: &ModelRequest,
    ) -> Result<Vec<RankedCandidate>, RouterError> {
        let mut survivors = Vec::new();
        for model in self.registry.enabled_models().await {
            let has_all = request
                .required_capabilities
                .iter()
                .all(|cap| model.has_capability(cap));
            if !has_all {
                continue;
            }

            let health_state = self.health.model_state(&model.id);
            if health_state == HealthState::Unavailable {
                debug!(model = %model.id, "candidate excluded: unavailable");
                continue;
            }

            let rate_status = self.rate_limiter.check_rate_limit(&model).await;
            if rate_status == RateLimitStatus::Limited {
                debug!(model = %model.id, "candidate excluded: rate limited");
                continue;
            }

            survivors.push((model, health_state, rate_status));
        }

        if survivors.is_empty() {
            return Err(RouterError::NoAvailableModel {
                request_id: request.task_id,
                required: request.required_capabilities.clone(),
            });
        }

        let weights = ScoringWeights::for_priority(request.priority);
        let max_rate = survivors
            .iter()
            .map(|(m, _, _)| m.blended_rate())
            .fold(0.0_f64, f64::max);

        let mut ranked = Vec::with_capacity(survivors.len());
        for (model, health_state, rate_status) in survivors {
            let cost_score = if max_rate > 0.0 {
                1.0 - model.blended_rate() / max_rate
            } else {
                1.0
            };

            let performance_score = match self.performance.model_performance(&model.id).await {
                Some(snap) => {
                    let quality = snap.avg_quality.unwrap_or(snap.success_rate);
                    (snap.success_rate + quality) / 2.0
                }
                None => NEUTRAL_PERFORMANCE,
            };

            let availability_score = {
                let health_factor = match health_state {
                    HealthState::Healthy => 1.0,
                    HealthState::Degraded => 0.3,
                    HealthState::Unavailable => 0.0,
                };
                let rate_factor = match rate_status {
                    RateLimitStatus::Ok => 1.0,
                    RateLimitStatus::Approaching => 0.5,
                    RateLimitStatus::Limited => 0.0,
                };
                health_factor.min(rate_factor)
            };

            // Survivors carry every required capability, so the capability
            // component is saturated; it still contributes its weight.
            let capability_score = 1.0;

            let score = capability_score * weights.capability
                + cost_score * weights.cost
                + performance_score * weights.performance
                + availability_score * weights.availability;

            let reason = format!(
                "score {score:.3} (cost {cost_score:.2}, perf {performance_score:.2}, \
                 avail {availability_score:.2}, priority {})",
                request.priority
            );
            debug!(model = %model.id, %reason, "candidate scored");
            ranked.push(RankedCandidate {
                model,
                score,
                reason,
            });
        }

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.model
                        .blended_rate()
                        .partial_cmp(&b.model.blended_rate())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.model.id.cmp(&b.model.id))
        });
        Ok(ranked)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
