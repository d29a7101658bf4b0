//! Adapter for local inference servers (Ollama, vllm, llama.cpp, TGI).
//!
//! Speaks the OpenAI-compatible `/v1/chat/completions` protocol, which all of
//! the supported servers implement. Authentication is optional — most local
//! servers run without API keys — and local generation can be slow, so the
//! default timeout is generous.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use mm_core::{ModelMetadata, ModelRequest, ModelResponse, ProviderSettings, TokenUsage};

use crate::adapter::{error_from_response, AdapterError, ProviderAdapter};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
const LOCAL_TIMEOUT_SECS: u64 = 120;

pub struct OllamaAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaAdapter {
    pub fn new(settings: &ProviderSettings) -> Self {
        // Local inference can be slow; stretch the configured timeout to a
        // floor suitable for CPU-bound generation.
        let timeout = settings.timeout_secs.max(LOCAL_TIMEOUT_SECS);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
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

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn base(&self, model: &ModelMetadata) -> String {
        model
            .base_url
            .clone()
            .unwrap_or_else(|| self.base_url.clone())
    }
}

/// Deserialize helpers — same JSON schema as OpenAI chat completions, with
/// the optional fields local servers tend to omit.
#[derive(Deserialize)]
struct LocalResponse {
    choices: Vec<LocalChoice>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct LocalChoice {
    message: LocalMessageResp,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct LocalMessageResp {
    content: Option<String>,
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn provider_id(&self) -> &str {
        "ollama"
    }

    fn requires_api_key(&self) -> bool {
        false
    }

    async fn send_request(
        &self,
        model: &ModelMetadata,
        request: &ModelRequest,
        api_key: Option<&str>,
    ) -> Result<Value, AdapterError> {
        let body = serde_json::json!({
            "model": model.id,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{
                "role": "user",
                "content": request.prompt,
            }],
        });
        let url = format!("{}/v1/chat/completions", self.base(model));

        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                AdapterError::Timeout
            } else if e.is_connect() {
                AdapterError::Http(format!(
                    "cannot connect to local inference server at {}: {e}",
                    self.base(model)
                ))
            } else {
                AdapterError::Http(e.to_string())
            }
        })?;

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
        let api_resp: LocalResponse = serde_json::from_value(raw.clone())
            .map_err(|e| AdapterError::Parse(e.to_string()))?;

        let choice = api_resp
            .choices
            .first()
            .ok_or_else(|| AdapterError::Parse("no choices in local response".into()))?;

        Ok(ModelResponse {
            request_id: request.task_id,
            model_id: api_resp.model.unwrap_or_default(),
            content: choice.message.content.clone().unwrap_or_default(),
            usage: self.extract_token_usage(raw),
            latency_ms,
            success: true,
            finish_reason: choice.finish_reason.clone().unwrap_or_else(|| "stop".into()),
        })
    }

    fn extract_token_usage(&self, raw: &Value) -> TokenUsage {
        TokenUsage::new(
            raw["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            raw["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        )
    }

    async fn probe(
        &self,
        model: &ModelMetadata,
        _api_key: Option<&str>,
    ) -> Result<u64, AdapterError> {
        let url = format!("{}/v1/models", self.base(model));
        let start = Instant::now();
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(start.elapsed().as_millis() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
