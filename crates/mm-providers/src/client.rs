//! Dispatch layer: resolves the adapter for a model's provider, attaches a
//! credential, bounds per-provider concurrency, and retries transient
//! failures with exponential backoff.
//!
//! Same-model retries live here; switching *models* is the failover manager's
//! job (`mm-router`). Rate-limit errors are surfaced immediately and never
//! retried against the same model. Per-call timeouts are enforced by each
//! adapter's HTTP client, built from the provider settings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use mm_core::{ModelMetadata, ModelRequest, ModelResponse, RouterConfig};

use crate::adapter::{AdapterError, ProviderAdapter};
use crate::anthropic::AnthropicAdapter;
use crate::google::GoogleAdapter;
use crate::keys::{ApiKeyManager, KeyError};
use crate::ollama::OllamaAdapter;
use crate::openai::OpenAiAdapter;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no adapter registered for provider `{provider}`")]
    UnknownProvider { provider: String },

    #[error(transparent)]
    NoCredentials(#[from] KeyError),

    /// The provider's concurrency gate and its waiting queue are both full.
    #[error("request queue full for provider `{provider}`")]
    QueueFull { provider: String },

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl ClientError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::Adapter(AdapterError::RateLimited { .. }))
    }

    /// Provider-side trouble that an *alternative model* might avoid.
    pub fn is_retryable_elsewhere(&self) -> bool {
        match self {
            Self::Adapter(e) => e.is_transient() || matches!(e, AdapterError::RateLimited { .. }),
            Self::QueueFull { .. } => true,
            Self::UnknownProvider { .. } | Self::NoCredentials(_) => false,
        }
    }

    /// Client-side defect; failing over cannot fix it.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Adapter(e) => e.is_permanent(),
            Self::UnknownProvider { .. } | Self::NoCredentials(_) => true,
            Self::QueueFull { .. } => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per model, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let ms = self
            .base_backoff
            .as_millis()
            .saturating_mul(1u128 << attempt.min(16)) as u64;
        Duration::from_millis(ms).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-provider concurrency gate
// ---------------------------------------------------------------------------

/// Bounds in-flight calls per provider. Excess callers queue up to
/// `queue_depth`; beyond that the call fails fast with `QueueFull`.
struct ProviderGate {
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    queue_depth: usize,
}

impl ProviderGate {
    fn new(concurrency_limit: usize, queue_depth: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
            waiting: AtomicUsize::new(0),
            queue_depth,
        }
    }

    async fn acquire(
        &self,
        provider: &str,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, ClientError> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(permit);
        }
        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        if queued >= self.queue_depth {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(ClientError::QueueFull {
                provider: provider.to_string(),
            });
        }
        let permit = self.semaphore.clone().acquire_owned().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        permit.map_err(|_| ClientError::QueueFull {
            provider: provider.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// ApiClientManager
// ---------------------------------------------------------------------------

/// Executes canonical requests through the adapter for each model's provider.
pub struct ApiClientManager {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    gates: HashMap<String, ProviderGate>,
    keys: Arc<ApiKeyManager>,
    retry: RetryPolicy,
}

impl ApiClientManager {
    /// Build the standard adapter set from configuration.
    pub fn new(config: &RouterConfig, keys: Arc<ApiKeyManager>, retry: RetryPolicy) -> Self {
        let mut manager = Self {
            adapters: HashMap::new(),
            gates: HashMap::new(),
            keys,
            retry,
        };
        let standard: [Arc<dyn ProviderAdapter>; 4] = [
            Arc::new(AnthropicAdapter::new(&config.provider_settings("anthropic"))),
            Arc::new(OpenAiAdapter::new(&config.provider_settings("openai"))),
            Arc::new(GoogleAdapter::new(&config.provider_settings("google"))),
            Arc::new(OllamaAdapter::new(&config.provider_settings("ollama"))),
        ];
        for adapter in standard {
            let settings = config.provider_settings(adapter.provider_id());
            manager.register(adapter, settings.concurrency_limit, settings.queue_depth);
        }
        manager
    }

    /// Register (or replace) an adapter, e.g. a mock in tests or a custom
    /// provider family.
    pub fn register(
        &mut self,
        adapter: Arc<dyn ProviderAdapter>,
        concurrency_limit: usize,
        queue_depth: usize,
    ) {
        let provider = adapter.provider_id().to_string();
        self.gates
            .insert(provider.clone(), ProviderGate::new(concurrency_limit, queue_depth));
        self.adapters.insert(provider, adapter);
    }

    fn adapter_for(&self, provider: &str) -> Result<&Arc<dyn ProviderAdapter>, ClientError> {
        self.adapters
            .get(provider)
            .ok_or_else(|| ClientError::UnknownProvider {
                provider: provider.to_string(),
            })
    }

    fn key_for(&self, adapter: &Arc<dyn ProviderAdapter>) -> Result<Option<String>, ClientError> {
        if adapter.requires_api_key() {
            Ok(Some(self.keys.get_key(adapter.provider_id())?))
        } else {
            // Optional auth: use a key when one happens to be configured.
            Ok(self.keys.get_key(adapter.provider_id()).ok())
        }
    }

    /// Dispatch a request, retrying transient failures against the same model
    /// with exponential backoff. Rate-limit and permanent errors surface
    /// immediately.
    pub async fn send_request_with_retry(
        &self,
        model: &ModelMetadata,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ClientError> {
        let adapter = self.adapter_for(&model.provider)?;
        let api_key = self.key_for(adapter)?;
        let gate = &self.gates[&model.provider];

        let mut attempt = 0u32;
        loop {
            let _permit = gate.acquire(&model.provider).await?;
            let start = Instant::now();
            let outcome = adapter
                .send_request(model, request, api_key.as_deref())
                .await;
            drop(_permit);

            match outcome {
                Ok(raw) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    let mut response = adapter.parse_response(request, &raw, latency_ms)?;
                    if response.model_id.is_empty() {
                        response.model_id = model.id.clone();
                    }
                    debug!(model = %model.id, latency_ms, "request completed");
                    return Ok(response);
                }
                Err(e) if adapter.is_rate_limit_error(&e) => {
                    warn!(model = %model.id, "provider reported rate limit");
                    return Err(e.into());
                }
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.backoff_for(attempt);
                    warn!(
                        model = %model.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Liveness probe for one model. Probes skip the concurrency gate: they
    /// are lightweight and run on their own timers.
    pub async fn probe(&self, model: &ModelMetadata) -> Result<u64, ClientError> {
        let adapter = self.adapter_for(&model.provider)?;
        let api_key = self.key_for(adapter)?;
        let latency = adapter.probe(model, api_key.as_deref()).await?;
        Ok(latency)
    }

    /// Providers with a registered adapter, for startup credential checks.
    pub fn registered_providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = self.adapters.keys().cloned().collect();
        providers.sort();
        providers
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdapter;
    use async_trait::async_trait;
    use mm_core::TokenUsage;
    use serde_json::Value;
    use std::collections::BTreeSet;

    fn model(provider: &str) -> ModelMetadata {
        ModelMetadata {
            id: format!("{provider}-model"),
            provider: provider.into(),
            capabilities: BTreeSet::new(),
            cost_per_1k_input: 0.001,
            cost_per_1k_output: 0.002,
            requests_per_window: 100,
            tokens_per_window: None,
            context_window: 8192,
            enabled: true,
            base_url: None,
        }
    }

    fn manager_with(adapter: MockAdapter) -> ApiClientManager {
        let mut manager = ApiClientManager::new(
            &RouterConfig::default(),
            Arc::new(ApiKeyManager::new()),
            RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(10),
            },
        );
        manager.register(Arc::new(adapter), 4, 8);
        manager
    }

    // -- Dispatch --

    #[tokio::test]
    async fn success_fills_model_id_and_latency() {
        let manager = manager_with(MockAdapter::new("mock").with_content("hello"));
        let request = ModelRequest::new("hi", "tester");
        let resp = manager
            .send_request_with_retry(&model("mock"), &request)
            .await
            .unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.model_id, "mock-model");
        assert_eq!(resp.usage, TokenUsage::new(10, 5));
    }

    #[tokio::test]
    async fn unknown_provider_fails_fast() {
        let manager = manager_with(MockAdapter::new("mock"));
        let request = ModelRequest::new("hi", "tester");
        let err = manager
            .send_request_with_retry(&model("nonexistent"), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownProvider { .. }));
        assert!(err.is_permanent());
    }

    // -- Retry behavior --

    #[tokio::test]
    async fn transient_errors_retried_until_success() {
        let adapter = MockAdapter::new("mock")
            .with_error(AdapterError::Timeout)
            .with_error(AdapterError::Http("reset".into()))
            .with_content("third time lucky");
        let manager = manager_with(adapter);
        let request = ModelRequest::new("hi", "tester");

        let resp = manager
            .send_request_with_retry(&model("mock"), &request)
            .await
            .unwrap();
        assert_eq!(resp.content, "third time lucky");
    }

    #[tokio::test]
    async fn transient_errors_exhaust_attempts() {
        let adapter = MockAdapter::new("mock")
            .with_error(AdapterError::Timeout)
            .with_error(AdapterError::Timeout)
            .with_error(AdapterError::Timeout);
        let manager = manager_with(adapter);
        let request = ModelRequest::new("hi", "tester");

        let err = manager
            .send_request_with_retry(&model("mock"), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Adapter(AdapterError::Timeout)));
        assert!(err.is_retryable_elsewhere());
    }

    #[tokio::test]
    async fn rate_limit_never_retried() {
        let adapter = MockAdapter::new("mock")
            .with_error(AdapterError::RateLimited {
                retry_after_secs: Some(30),
            })
            .with_content("should not be reached");
        let manager = manager_with(adapter);
        let request = ModelRequest::new("hi", "tester");

        let err = manager
            .send_request_with_retry(&model("mock"), &request)
            .await
            .unwrap_err();
        assert!(err.is_rate_limit());
        assert!(err.is_retryable_elsewhere());
    }

    #[tokio::test]
    async fn permanent_error_surfaces_immediately() {
        let adapter = MockAdapter::new("mock")
            .with_error(AdapterError::Api {
                status: 401,
                message: "invalid api key".into(),
            })
            .with_content("unreachable");
        let manager = manager_with(adapter);
        let request = ModelRequest::new("hi", "tester");

        let err = manager
            .send_request_with_retry(&model("mock"), &request)
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert!(!err.is_retryable_elsewhere());
    }

    // -- Concurrency gate --

    /// An adapter that holds its permit long enough for the test to observe
    /// gate pressure.
    struct SlowAdapter;

    #[async_trait]
    impl ProviderAdapter for SlowAdapter {
        fn provider_id(&self) -> &str {
            "slow"
        }
        fn requires_api_key(&self) -> bool {
            false
        }
        async fn send_request(
            &self,
            _model: &ModelMetadata,
            _request: &ModelRequest,
            _api_key: Option<&str>,
        ) -> Result<Value, AdapterError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(serde_json::json!({"content": "slow"}))
        }
        fn parse_response(
            &self,
            request: &ModelRequest,
            raw: &Value,
            latency_ms: u64,
        ) -> Result<ModelResponse, AdapterError> {
            Ok(ModelResponse {
                request_id: request.task_id,
                model_id: String::new(),
                content: raw["content"].as_str().unwrap_or_default().into(),
                usage: TokenUsage::default(),
                latency_ms,
                success: true,
                finish_reason: "stop".into(),
            })
        }
        fn extract_token_usage(&self, _raw: &Value) -> TokenUsage {
            TokenUsage::default()
        }
        async fn probe(
            &self,
            _model: &ModelMetadata,
            _api_key: Option<&str>,
        ) -> Result<u64, AdapterError> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn queue_full_when_gate_saturated() {
        let mut manager = ApiClientManager::new(
            &RouterConfig::default(),
            Arc::new(ApiKeyManager::new()),
            RetryPolicy::default(),
        );
        // One in-flight call, zero queue slots.
        manager.register(Arc::new(SlowAdapter), 1, 0);
        let manager = Arc::new(manager);

        let m = model("slow");
        let first = {
            let manager = manager.clone();
            let m = m.clone();
            tokio::spawn(async move {
                manager
                    .send_request_with_retry(&m, &ModelRequest::new("a", "t"))
                    .await
            })
        };
        // Let the first call take the only permit.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = manager
            .send_request_with_retry(&m, &ModelRequest::new("b", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::QueueFull { .. }));

        let resp = first.await.unwrap().unwrap();
        assert_eq!(resp.content, "slow");
    }

    // -- Credentials --

    /// Mock that insists on a key, to exercise the credential path.
    struct KeyedAdapter(MockAdapter);

    #[async_trait]
    impl ProviderAdapter for KeyedAdapter {
        fn provider_id(&self) -> &str {
            "keyed"
        }
        async fn send_request(
            &self,
            model: &ModelMetadata,
            request: &ModelRequest,
            api_key: Option<&str>,
        ) -> Result<Value, AdapterError> {
            assert!(api_key.is_some());
            self.0.send_request(model, request, api_key).await
        }
        fn parse_response(
            &self,
            request: &ModelRequest,
            raw: &Value,
            latency_ms: u64,
        ) -> Result<ModelResponse, AdapterError> {
            self.0.parse_response(request, raw, latency_ms)
        }
        fn extract_token_usage(&self, raw: &Value) -> TokenUsage {
            self.0.extract_token_usage(raw)
        }
        async fn probe(
            &self,
            model: &ModelMetadata,
            api_key: Option<&str>,
        ) -> Result<u64, AdapterError> {
            self.0.probe(model, api_key).await
        }
    }

    #[tokio::test]
    async fn missing_key_is_no_credentials() {
        let mut manager = ApiClientManager::new(
            &RouterConfig::default(),
            Arc::new(ApiKeyManager::new()),
            RetryPolicy::default(),
        );
        manager.register(Arc::new(KeyedAdapter(MockAdapter::new("keyed"))), 4, 8);

        let err = manager
            .send_request_with_retry(&model("keyed"), &ModelRequest::new("hi", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NoCredentials(_)));
    }

    #[tokio::test]
    async fn key_attached_when_configured() {
        let keys = Arc::new(ApiKeyManager::new());
        keys.add_key("keyed", "secret");
        let mut manager =
            ApiClientManager::new(&RouterConfig::default(), keys, RetryPolicy::default());
        manager.register(Arc::new(KeyedAdapter(MockAdapter::new("keyed"))), 4, 8);

        let resp = manager
            .send_request_with_retry(&model("keyed"), &ModelRequest::new("hi", "t"))
            .await
            .unwrap();
        assert_eq!(resp.content, "mock response");
    }

    // -- Backoff --

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(350));
        assert_eq!(policy.backoff_for(10), Duration::from_millis(350));
    }

    #[test]
    fn standard_adapters_registered() {
        let manager = ApiClientManager::new(
            &RouterConfig::default(),
            Arc::new(ApiKeyManager::new()),
            RetryPolicy::default(),
        );
        assert_eq!(
            manager.registered_providers(),
            ["anthropic", "google", "ollama", "openai"]
        );
    }
}
