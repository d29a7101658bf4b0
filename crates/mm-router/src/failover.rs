//! Request orchestration: selection, cache, dispatch, recording, failover.
//!
//! One call drives a request end to end: rank candidates, short-circuit on a
//! cache hit, dispatch through the client (which owns same-model retries and
//! backoff), and on a retryable failure move to the next distinct candidate,
//! recording a failover event per hop. The request's deadline is checked
//! before every attempt. Selection re-runs per request, so a recovered model
//! wins its traffic back without any sticky pinning to the fallback.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use mm_core::config::FailoverSettings;
use mm_core::{FailoverEvent, FailoverReason, ModelRequest, ModelResponse, RouterStore};
use mm_providers::{AdapterError, ApiClientManager, ClientError, RetryPolicy};

use crate::cache::CacheManager;
use crate::cost::CostTracker;
use crate::error::{AttemptFailure, RouterError};
use crate::evaluator::ResponseEvaluator;
use crate::optimizer::ModelOptimizer;
use crate::perf::PerformanceMonitor;
use crate::rate_limiter::RateLimiter;
use crate::selector::ModelSelector;

/// Client retry policy matching the failover tunables: the same-model retry
/// bound plus the shared backoff schedule.
pub fn retry_policy(settings: &FailoverSettings) -> RetryPolicy {
    RetryPolicy {
        max_attempts: settings.max_same_model_retries + 1,
        base_backoff: std::time::Duration::from_millis(settings.base_backoff_ms),
        max_backoff: std::time::Duration::from_millis(settings.max_backoff_ms),
    }
}

// ---------------------------------------------------------------------------
// FailoverManager
// ---------------------------------------------------------------------------

pub struct FailoverManager {
    selector: Arc<ModelSelector>,
    client: Arc<ApiClientManager>,
    cache: Arc<CacheManager>,
    rate_limiter: Arc<RateLimiter>,
    performance: Arc<PerformanceMonitor>,
    cost: Arc<CostTracker>,
    settings: FailoverSettings,
    store: Option<Arc<RouterStore>>,
    optimizer: Option<Arc<dyn ModelOptimizer>>,
    evaluator: Option<Arc<ResponseEvaluator>>,
}

impl FailoverManager {
    pub fn new(
        selector: Arc<ModelSelector>,
        client: Arc<ApiClientManager>,
        cache: Arc<CacheManager>,
        rate_limiter: Arc<RateLimiter>,
        performance: Arc<PerformanceMonitor>,
        cost: Arc<CostTracker>,
        settings: FailoverSettings,
    ) -> Self {
        Self {
            selector,
            client,
            cache,
            rate_limiter,
            performance,
            cost,
            settings,
            store: None,
            optimizer: None,
            evaluator: None,
        }
    }

    /// Persist failover events and enable excessive-failover accounting.
    pub fn with_store(mut self, store: Arc<RouterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Notify the legacy optimizer on every failover and after each success.
    pub fn with_optimizer(mut self, optimizer: Arc<dyn ModelOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// Score responses and allow quality-triggered same-request switches.
    pub fn with_evaluator(mut self, evaluator: Arc<ResponseEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Execute a request across ranked candidates until one answers, the
    /// candidates exhaust, or the deadline passes.
    pub async fn execute_with_failover(
        &self,
        request: &ModelRequest,
    ) -> Result<ModelResponse, RouterError> {
        let ranked = self.selector.rank_candidates(request).await?;
        let candidates: Vec<_> = ranked
            .into_iter()
            .take(self.settings.max_models.max(1) as usize)
            .collect();
        let total = candidates.len();
        let mut attempts: Vec<AttemptFailure> = Vec::new();

        for (idx, candidate) in candidates.iter().enumerate() {
            if request.deadline_exceeded() {
                warn!(request_id = %request.task_id, "deadline passed before attempt");
                return Err(RouterError::DeadlineExceeded {
                    request_id: request.task_id,
                    attempts,
                });
            }

            let model = &candidate.model;
            let cache_key = CacheManager::generate_cache_key(&model.id, request);
            if let Some(hit) = self.cache.get(&cache_key).await {
                debug!(request_id = %request.task_id, model = %model.id, "cache hit");
                return Ok(hit);
            }

            debug!(
                request_id = %request.task_id,
                model = %model.id,
                attempt = idx + 1,
                score = candidate.score,
                "dispatching"
            );
            let started = Instant::now();
            match self.client.send_request_with_retry(model, request).await {
                Ok(response) => {
                    self.rate_limiter
                        .record_request(&model.id, response.usage.total())
                        .await;

                    let quality = match &self.evaluator {
                        Some(evaluator) => {
                            Some(evaluator.evaluate(request, &response).await.composite)
                        }
                        None => None,
                    };
                    self.performance
                        .record_performance(
                            &model.id,
                            &request.agent_type,
                            response.latency_ms,
                            true,
                            quality,
                        )
                        .await;
                    let (cost_usd, _alert) =
                        self.cost.record_cost(model, request, response.usage).await;
                    self.cache.set(&cache_key, &model.id, &response, None).await;

                    if let Some(optimizer) = &self.optimizer {
                        if let Some(snapshot) =
                            self.performance.model_performance(&model.id).await
                        {
                            optimizer.push_performance(&snapshot).await;
                        }
                    }

                    // A run of low-quality answers can bounce the request to
                    // the next candidate even though the call succeeded.
                    if let Some(evaluator) = &self.evaluator {
                        if evaluator.should_switch_model(&model.id).await
                            && idx + 1 < total
                            && !request.deadline_exceeded()
                        {
                            attempts.push(AttemptFailure {
                                model_id: model.id.clone(),
                                reason: "quality regression".into(),
                            });
                            self.record_failover(
                                &model.id,
                                &candidates[idx + 1].model.id,
                                FailoverReason::QualityRegression,
                                request,
                                attempts.len() as u32,
                            )
                            .await;
                            continue;
                        }
                    }

                    info!(
                        request_id = %request.task_id,
                        model = %model.id,
                        latency_ms = response.latency_ms,
                        cost_usd,
                        "request completed"
                    );
                    return Ok(response);
                }
                Err(error) => {
                    // The dispatch was attempted, so it counts toward the
                    // window even though it failed.
                    self.rate_limiter.record_request(&model.id, 0).await;
                    self.performance
                        .record_performance(
                            &model.id,
                            &request.agent_type,
                            started.elapsed().as_millis() as u64,
                            false,
                            None,
                        )
                        .await;

                    if error.is_rate_limit() {
                        self.rate_limiter.mark_provider_limited(&model.id).await;
                    }

                    if let Some(terminal) = self.terminal_error(request, &model.id, &error) {
                        return Err(terminal);
                    }

                    warn!(
                        request_id = %request.task_id,
                        model = %model.id,
                        error = %error,
                        "dispatch failed, trying next candidate"
                    );
                    attempts.push(AttemptFailure {
                        model_id: model.id.clone(),
                        reason: error.to_string(),
                    });
                    if let Some(next) = candidates.get(idx + 1) {
                        let reason = if error.is_rate_limit() {
                            FailoverReason::RateLimited
                        } else {
                            FailoverReason::Error
                        };
                        self.record_failover(
                            &model.id,
                            &next.model.id,
                            reason,
                            request,
                            attempts.len() as u32,
                        )
                        .await;
                    }
                }
            }
        }

        Err(RouterError::Exhausted {
            request_id: request.task_id,
            attempts,
        })
    }

    /// Map client failures that must not be failed over into terminal errors.
    fn terminal_error(
        &self,
        request: &ModelRequest,
        model_id: &str,
        error: &ClientError,
    ) -> Option<RouterError> {
        match error {
            ClientError::NoCredentials(e) => {
                let mm_providers::KeyError::NoCredentials { provider } = e;
                Some(RouterError::NoCredentials {
                    provider: provider.clone(),
                })
            }
            ClientError::Adapter(AdapterError::Api { status, message }) if error.is_permanent() => {
                Some(RouterError::Permanent {
                    request_id: request.task_id,
                    model_id: model_id.to_string(),
                    status: Some(*status),
                    message: message.clone(),
                })
            }
            _ if error.is_permanent() => Some(RouterError::Permanent {
                request_id: request.task_id,
                model_id: model_id.to_string(),
                status: None,
                message: error.to_string(),
            }),
            _ => None,
        }
    }

    /// Log, persist, and broadcast one failover hop, then check the rate of
    /// hops away from this model against the alert threshold.
    async fn record_failover(
        &self,
        from_model: &str,
        to_model: &str,
        reason: FailoverReason,
        request: &ModelRequest,
        attempt: u32,
    ) {
        let event = FailoverEvent {
            timestamp: Utc::now(),
            from_model: from_model.to_string(),
            to_model: to_model.to_string(),
            reason,
            task_id: request.task_id,
            attempt,
        };
        warn!(
            from = %event.from_model,
            to = %event.to_model,
            reason = %event.reason,
            attempt = event.attempt,
            "failing over"
        );

        if let Some(store) = &self.store {
            if let Err(e) = store.insert_failover_event(&event).await {
                debug!(error = %e, "failed to persist failover event");
            } else {
                let since = Utc::now()
                    - chrono::Duration::seconds(self.settings.alert_window_secs as i64);
                match store.failover_count_since(from_model, since).await {
                    Ok(count) if count as usize > self.settings.alert_threshold => {
                        warn!(
                            model = %from_model,
                            count,
                            window_secs = self.settings.alert_window_secs,
                            "excessive failover rate"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "failed to count failover events"),
                }
            }
        }

        if let Some(optimizer) = &self.optimizer {
            optimizer.notify_failover(&event).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthChecker;
    use crate::optimizer::RecordingOptimizer;
    use crate::registry::ModelRegistry;
    use mm_core::config::{
        BudgetSettings, EvaluatorSettings, HealthSettings, PerformanceSettings, RouterConfig,
    };
    use mm_core::{ModelMetadata, TaskPriority};
    use mm_providers::{ApiKeyManager, MockAdapter};
    use std::time::Duration;

    fn model(id: &str, provider: &str, rate: f64) -> ModelMetadata {
        ModelMetadata {
            id: id.into(),
            provider: provider.into(),
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

    struct Fixture {
        manager: FailoverManager,
        store: Arc<RouterStore>,
        rate_limiter: Arc<RateLimiter>,
        cache: Arc<CacheManager>,
        optimizer: Arc<RecordingOptimizer>,
    }

    /// Wire a full stack around scripted adapters. Each (provider, adapter)
    /// pair gets one model named `<provider>-model`, cheapest first so the
    /// selector ranks them in declaration order.
    async fn fixture(adapters: Vec<MockAdapter>) -> Fixture {
        let registry = Arc::new(ModelRegistry::new());
        let mut client = ApiClientManager::new(
            &RouterConfig::default(),
            Arc::new(ApiKeyManager::new()),
            RetryPolicy {
                max_attempts: 1,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
        );
        for (i, adapter) in adapters.into_iter().enumerate() {
            let provider = adapter.provider_id().to_string();
            registry
                .add_model(model(
                    &format!("{provider}-model"),
                    &provider,
                    0.001 * (i + 1) as f64,
                ))
                .await
                .unwrap();
            client.register(Arc::new(adapter), 4, 8);
        }

        let store = Arc::new(RouterStore::open_in_memory().await.unwrap());
        let rate_limiter = Arc::new(RateLimiter::new(Duration::from_secs(60), 0.90));
        let performance = Arc::new(PerformanceMonitor::new(PerformanceSettings::default()));
        let health = Arc::new(HealthChecker::new(HealthSettings::default()));
        let cache = Arc::new(CacheManager::new(100, Duration::from_secs(3600)));
        let cost = Arc::new(CostTracker::new(store.clone(), BudgetSettings::default()));
        let selector = Arc::new(ModelSelector::new(
            registry,
            rate_limiter.clone(),
            performance.clone(),
            health,
        ));
        let optimizer = Arc::new(RecordingOptimizer::new());

        let manager = FailoverManager::new(
            selector,
            Arc::new(client),
            cache.clone(),
            rate_limiter.clone(),
            performance,
            cost,
            FailoverSettings {
                max_same_model_retries: 0,
                max_models: 3,
                base_backoff_ms: 1,
                max_backoff_ms: 5,
                alert_threshold: 2,
                alert_window_secs: 3600,
            },
        )
        .with_store(store.clone())
        .with_optimizer(optimizer.clone());

        Fixture {
            manager,
            store,
            rate_limiter,
            cache,
            optimizer,
        }
    }

    fn request() -> ModelRequest {
        ModelRequest::new("write a parser in rust", "implementer").with_capability("code")
    }

    // -- Happy path --

    #[tokio::test]
    async fn first_candidate_answers() {
        let f = fixture(vec![MockAdapter::new("alpha").with_content("done")]).await;
        let resp = f.manager.execute_with_failover(&request()).await.unwrap();
        assert_eq!(resp.content, "done");
        assert_eq!(resp.model_id, "alpha-model");
        // The dispatch consumed quota.
        assert_eq!(f.rate_limiter.in_window_count("alpha-model").await, 1);
    }

    #[tokio::test]
    async fn repeat_request_served_from_cache() {
        let f = fixture(vec![MockAdapter::new("alpha").with_content("cached answer")]).await;
        let req = request();
        f.manager.execute_with_failover(&req).await.unwrap();
        // Same prompt again: the adapter queue is empty, so a network call
        // would produce the default mock body — a hit proves the short-circuit.
        let resp = f.manager.execute_with_failover(&req).await.unwrap();
        assert_eq!(resp.content, "cached answer");
        // No second dispatch: window count unchanged.
        assert_eq!(f.rate_limiter.in_window_count("alpha-model").await, 1);
        assert_eq!(f.cache.stats().await.hits, 1);
    }

    // -- Failover paths --

    #[tokio::test]
    async fn transient_failure_fails_over_to_next() {
        let f = fixture(vec![
            MockAdapter::new("alpha").with_error(AdapterError::Timeout),
            MockAdapter::new("beta").with_content("rescued"),
        ])
        .await;
        let resp = f.manager.execute_with_failover(&request()).await.unwrap();
        assert_eq!(resp.model_id, "beta-model");

        let events = f
            .store
            .failover_history(Some("alpha-model"), Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to_model, "beta-model");
        assert_eq!(events[0].reason, FailoverReason::Error);

        let notified = f.optimizer.failover_notifications().await;
        assert_eq!(notified.len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_never_retries_same_model() {
        let f = fixture(vec![
            MockAdapter::new("alpha").with_error(AdapterError::RateLimited {
                retry_after_secs: Some(30),
            }),
            MockAdapter::new("beta").with_content("rescued"),
        ])
        .await;
        let resp = f.manager.execute_with_failover(&request()).await.unwrap();
        assert_eq!(resp.model_id, "beta-model");

        // The 429 forced the model limited: the next identical request skips
        // it during selection entirely.
        let resp = f.manager.execute_with_failover(&request()).await.unwrap();
        assert_eq!(resp.model_id, "beta-model");

        let events = f
            .store
            .failover_history(Some("alpha-model"), Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(events[0].reason, FailoverReason::RateLimited);
    }

    #[tokio::test]
    async fn permanent_error_surfaces_without_failover() {
        let f = fixture(vec![
            MockAdapter::new("alpha").with_error(AdapterError::Api {
                status: 401,
                message: "invalid api key".into(),
            }),
            MockAdapter::new("beta").with_content("never used"),
        ])
        .await;
        let err = f.manager.execute_with_failover(&request()).await.unwrap_err();
        match err {
            RouterError::Permanent {
                model_id, status, ..
            } => {
                assert_eq!(model_id, "alpha-model");
                assert_eq!(status, Some(401));
            }
            other => panic!("expected Permanent, got {other}"),
        }
        // No failover was recorded for a client-side defect.
        let events = f
            .store
            .failover_history(None, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn exhaustion_lists_every_attempt() {
        let f = fixture(vec![
            MockAdapter::new("alpha").with_error(AdapterError::Timeout),
            MockAdapter::new("beta").with_error(AdapterError::Api {
                status: 503,
                message: "overloaded".into(),
            }),
        ])
        .await;
        let err = f.manager.execute_with_failover(&request()).await.unwrap_err();
        match err {
            RouterError::Exhausted {
                ref attempts,
                ..
            } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].model_id, "alpha-model");
                assert_eq!(attempts[1].model_id, "beta-model");
                assert!(attempts[0].reason.contains("timed out"));
            }
            ref other => panic!("expected Exhausted, got {other}"),
        }
        assert_eq!(err.kind(), "exhausted");
    }

    // -- Deadline --

    #[tokio::test]
    async fn expired_deadline_abandons_request() {
        let f = fixture(vec![MockAdapter::new("alpha").with_content("too late")]).await;
        let req = request().with_deadline(Instant::now() - Duration::from_secs(1));
        let err = f.manager.execute_with_failover(&req).await.unwrap_err();
        assert_eq!(err.kind(), "deadline_exceeded");
        // Nothing was dispatched.
        assert_eq!(f.rate_limiter.in_window_count("alpha-model").await, 0);
    }

    // -- Quality switch --

    #[tokio::test]
    async fn quality_regression_switches_models_same_request() {
        let gibberish = "no";
        let alpha = MockAdapter::new("alpha")
            .with_content(gibberish)
            .with_content(gibberish)
            .with_content(gibberish);
        let beta = MockAdapter::new("beta").with_content(
            "A recursive descent parser in Rust: tokenize the input, then parse \
             expressions by precedence climbing. Errors carry byte offsets.",
        );
        let f = fixture(vec![alpha, beta]).await;
        let manager = f.manager.with_evaluator(Arc::new(ResponseEvaluator::new(
            EvaluatorSettings {
                quality_floor: 0.9,
                min_consecutive: 3,
            },
        )));

        // Two low-quality answers build the streak without switching. Each
        // prompt is distinct so none of these are cache hits.
        for i in 0..2 {
            let req = ModelRequest::new(format!("write a tokenizer in rust, take {i}"), "implementer")
                .with_capability("code");
            let resp = manager.execute_with_failover(&req).await.unwrap();
            assert_eq!(resp.model_id, "alpha-model");
        }
        // Third low-quality answer trips the switch mid-request.
        let req = ModelRequest::new("write a full parser in rust", "implementer")
            .with_capability("code");
        let resp = manager.execute_with_failover(&req).await.unwrap();
        assert_eq!(resp.model_id, "beta-model");

        let events = f
            .store
            .failover_history(Some("alpha-model"), Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(events[0].reason, FailoverReason::QualityRegression);
    }

    // -- Priority flows through selection --

    #[tokio::test]
    async fn critical_request_still_completes() {
        let f = fixture(vec![MockAdapter::new("alpha").with_content("urgent answer")]).await;
        let req = request().with_priority(TaskPriority::Critical);
        let resp = f.manager.execute_with_failover(&req).await.unwrap();
        assert_eq!(resp.content, "urgent answer");
    }
}
