//! Provider adapter contract.
//!
//! One adapter per provider family translates the canonical request into the
//! provider's wire format and back. Callers never see provider-specific types:
//! the raw JSON body stays inside this crate, and the split between
//! `send_request` and `parse_response` keeps the translation testable without
//! a network.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use mm_core::{ModelMetadata, ModelRequest, ModelResponse, TokenUsage};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while talking to a provider.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// An HTTP-level error (connection failure, DNS, TLS, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The API returned a non-success status with a message.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The API indicated rate limiting (HTTP 429).
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// Failed to interpret the response body.
    #[error("parse error: {0}")]
    Parse(String),
}

impl AdapterError {
    /// Retrying the same provider may help: network faults, timeouts, 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout => true,
            Self::Api { status, .. } => *status >= 500,
            Self::RateLimited { .. } | Self::Parse(_) => false,
        }
    }

    /// Client-side defect that no amount of retrying or failover fixes.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Api { status, .. } => (400..500).contains(status) && *status != 429,
            Self::Parse(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout
        } else {
            AdapterError::Http(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderAdapter trait
// ---------------------------------------------------------------------------

/// Async trait implemented once per provider family.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The provider id this adapter serves, as referenced by model metadata.
    fn provider_id(&self) -> &str;

    /// Whether requests require an API key. Local inference servers don't.
    fn requires_api_key(&self) -> bool {
        true
    }

    /// Issue the canonical request and return the provider's raw JSON body.
    async fn send_request(
        &self,
        model: &ModelMetadata,
        request: &ModelRequest,
        api_key: Option<&str>,
    ) -> Result<Value, AdapterError>;

    /// Translate a raw body into the canonical response. `latency_ms` is
    /// measured by the caller around `send_request`.
    fn parse_response(
        &self,
        request: &ModelRequest,
        raw: &Value,
        latency_ms: u64,
    ) -> Result<ModelResponse, AdapterError>;

    /// Pull token counts out of a raw body, zero when the provider omits them.
    fn extract_token_usage(&self, raw: &Value) -> TokenUsage;

    /// Whether an error represents provider-side rate limiting.
    fn is_rate_limit_error(&self, error: &AdapterError) -> bool {
        matches!(error, AdapterError::RateLimited { .. })
    }

    /// Lightweight liveness probe. Returns the round-trip time in ms.
    async fn probe(
        &self,
        model: &ModelMetadata,
        api_key: Option<&str>,
    ) -> Result<u64, AdapterError>;
}

// ---------------------------------------------------------------------------
// Shared HTTP helpers
// ---------------------------------------------------------------------------

/// Map a non-success HTTP response to the adapter error taxonomy, consuming
/// the body for the message.
pub(crate) async fn error_from_response(resp: reqwest::Response) -> AdapterError {
    let status = resp.status().as_u16();
    if status == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return AdapterError::RateLimited {
            retry_after_secs: retry_after,
        };
    }
    let message = resp.text().await.unwrap_or_default();
    AdapterError::Api { status, message }
}

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

/// A scriptable adapter for tests.
///
/// Each call to `send_request` pops the next queued outcome; an empty queue
/// yields a default body. Requests are captured for assertions.
pub struct MockAdapter {
    provider: String,
    outcomes: Mutex<VecDeque<Result<Value, AdapterError>>>,
    captured: Mutex<Vec<ModelRequest>>,
    probe_ok: Mutex<bool>,
}

impl MockAdapter {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            outcomes: Mutex::new(VecDeque::new()),
            captured: Mutex::new(Vec::new()),
            probe_ok: Mutex::new(true),
        }
    }

    /// Queue a successful completion with the given content.
    pub fn with_content(self, content: impl Into<String>) -> Self {
        let body = serde_json::json!({
            "content": content.into(),
            "input_tokens": 10,
            "output_tokens": 5,
            "finish_reason": "end_turn",
        });
        self.outcomes.lock().unwrap().push_back(Ok(body));
        self
    }

    /// Queue an error outcome.
    pub fn with_error(self, error: AdapterError) -> Self {
        self.outcomes.lock().unwrap().push_back(Err(error));
        self
    }

    /// Make subsequent probes fail.
    pub fn set_probe_healthy(&self, healthy: bool) {
        *self.probe_ok.lock().unwrap() = healthy;
    }

    pub fn captured_requests(&self) -> Vec<ModelRequest> {
        self.captured.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn provider_id(&self) -> &str {
        &self.provider
    }

    fn requires_api_key(&self) -> bool {
        false
    }

    async fn send_request(
        &self,
        _model: &ModelMetadata,
        request: &ModelRequest,
        _api_key: Option<&str>,
    ) -> Result<Value, AdapterError> {
        self.captured.lock().unwrap().push(request.clone());
        let mut queue = self.outcomes.lock().unwrap();
        match queue.pop_front() {
            Some(outcome) => outcome,
            None => Ok(serde_json::json!({
                "content": "mock response",
                "input_tokens": 10,
                "output_tokens": 5,
                "finish_reason": "end_turn",
            })),
        }
    }

    fn parse_response(
        &self,
        request: &ModelRequest,
        raw: &Value,
        latency_ms: u64,
    ) -> Result<ModelResponse, AdapterError> {
        let content = raw["content"]
            .as_str()
            .ok_or_else(|| AdapterError::Parse("missing content".into()))?;
        Ok(ModelResponse {
            request_id: request.task_id,
            model_id: String::new(),
            content: content.to_string(),
            usage: self.extract_token_usage(raw),
            latency_ms,
            success: true,
            finish_reason: raw["finish_reason"].as_str().unwrap_or("stop").to_string(),
        })
    }

    fn extract_token_usage(&self, raw: &Value) -> TokenUsage {
        TokenUsage::new(
            raw["input_tokens"].as_u64().unwrap_or(0),
            raw["output_tokens"].as_u64().unwrap_or(0),
        )
    }

    async fn probe(
        &self,
        _model: &ModelMetadata,
        _api_key: Option<&str>,
    ) -> Result<u64, AdapterError> {
        if *self.probe_ok.lock().unwrap() {
            Ok(1)
        } else {
            Err(AdapterError::Http("probe refused".into()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
