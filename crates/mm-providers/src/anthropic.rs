//! Adapter for the Anthropic Messages API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use mm_core::{ModelMetadata, ModelRequest, ModelResponse, ProviderSettings, TokenUsage};

use crate::adapter::{error_from_response, AdapterError, ProviderAdapter};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(settings: &ProviderSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    /// Override the base URL (useful for testing with a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the JSON request body for the Messages API.
    pub fn build_request_body(model: &ModelMetadata, request: &ModelRequest) -> Value {
        serde_json::json!({
            "model": model.id,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{
                "role": "user",
                "content": request.prompt,
            }],
        })
    }

    fn effective_url(&self, model: &ModelMetadata, path: &str) -> String {
        let base = model.base_url.as_deref().unwrap_or(&self.base_url);
        format!("{base}{path}")
    }
}

/// Deserialize helpers for the Messages API response.
#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    model: String,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    text: Option<String>,
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    async fn send_request(
        &self,
        model: &ModelMetadata,
        request: &ModelRequest,
        api_key: Option<&str>,
    ) -> Result<Value, AdapterError> {
        let body = Self::build_request_body(model, request);
        let url = self.effective_url(model, "/v1/messages");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", api_key.unwrap_or_default())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let raw: Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::Parse(e.to_string()))?;
        Ok(raw)
    }

    fn parse_response(
        &self,
        request: &ModelRequest,
        raw: &Value,
        latency_ms: u64,
    ) -> Result<ModelResponse, AdapterError> {
        let api_resp: AnthropicResponse = serde_json::from_value(raw.clone())
            .map_err(|e| AdapterError::Parse(e.to_string()))?;

        let content = api_resp
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(ModelResponse {
            request_id: request.task_id,
            model_id: api_resp.model,
            content,
            usage: self.extract_token_usage(raw),
            latency_ms,
            success: true,
            finish_reason: api_resp.stop_reason.unwrap_or_else(|| "unknown".into()),
        })
    }

    fn extract_token_usage(&self, raw: &Value) -> TokenUsage {
        TokenUsage::new(
            raw["usage"]["input_tokens"].as_u64().unwrap_or(0),
            raw["usage"]["output_tokens"].as_u64().unwrap_or(0),
        )
    }

    async fn probe(
        &self,
        model: &ModelMetadata,
        api_key: Option<&str>,
    ) -> Result<u64, AdapterError> {
        let url = self.effective_url(model, "/v1/models");
        let start = Instant::now();
        let resp = self
            .client
            .get(&url)
            .header("x-api-key", api_key.unwrap_or_default())
            .header("anthropic-version", API_VERSION)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(start.elapsed().as_millis() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
