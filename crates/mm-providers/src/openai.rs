//! Adapter for the OpenAI Chat Completions API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use mm_core::{ModelMetadata, ModelRequest, ModelResponse, ProviderSettings, TokenUsage};

use crate::adapter::{error_from_response, AdapterError, ProviderAdapter};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiAdapter {
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

    /// Override the base URL (useful for testing or Azure-style gateways).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the JSON request body for the Chat Completions API.
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

/// Deserialize helpers for the Chat Completions response.
#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    model: String,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageResp,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessageResp {
    content: Option<String>,
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn send_request(
        &self,
        model: &ModelMetadata,
        request: &ModelRequest,
        api_key: Option<&str>,
    ) -> Result<Value, AdapterError> {
        let body = Self::build_request_body(model, request);
        let url = self.effective_url(model, "/v1/chat/completions");

        let resp = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", api_key.unwrap_or_default()),
            )
            .header("Content-Type", "application/json")
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
        let api_resp: OpenAiResponse = serde_json::from_value(raw.clone())
            .map_err(|e| AdapterError::Parse(e.to_string()))?;

        let choice = api_resp
            .choices
            .first()
            .ok_or_else(|| AdapterError::Parse("no choices in response".into()))?;

        Ok(ModelResponse {
            request_id: request.task_id,
            model_id: api_resp.model,
            content: choice.message.content.clone().unwrap_or_default(),
            usage: self.extract_token_usage(raw),
            latency_ms,
            success: true,
            finish_reason: choice
                .finish_reason
                .clone()
                .unwrap_or_else(|| "unknown".into()),
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
        api_key: Option<&str>,
    ) -> Result<u64, AdapterError> {
        let url = self.effective_url(model, "/v1/models");
        let start = Instant::now();
        let resp = self
            .client
            .get(&url)
            .header(
                "Authorization",
                format!("Bearer {}", api_key.unwrap_or_default()),
            )
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn model() -> ModelMetadata {
        ModelMetadata {
            id: "gpt-4o-mini".into(),
            provider: "openai".into(),
            capabilities: BTreeSet::new(),
            cost_per_1k_input: 0.00015,
            cost_per_1k_output: 0.0006,
            requests_per_window: 500,
            tokens_per_window: None,
            context_window: 128_000,
            enabled: true,
            base_url: None,
        }
    }

    fn adapter() -> OpenAiAdapter {
        OpenAiAdapter::new(&ProviderSettings::default())
    }

    #[test]
    fn request_body_shape() {
        let request = ModelRequest::new("hello", "tester");
        let body = OpenAiAdapter::build_request_body(&model(), &request);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hello");
    }

    #[test]
    fn parses_response_and_usage() {
        let raw = serde_json::json!({
            "choices": [{
                "message": {"content": "hi there"},
                "finish_reason": "stop",
            }],
            "model": "gpt-4o-mini",
            "usage": {"prompt_tokens": 9, "completion_tokens": 3},
        });
        let request = ModelRequest::new("hello", "tester");
        let resp = adapter().parse_response(&request, &raw, 180).unwrap();
        assert_eq!(resp.content, "hi there");
        assert_eq!(resp.finish_reason, "stop");
        assert_eq!(resp.usage, TokenUsage::new(9, 3));
    }

    #[test]
    fn empty_choices_is_parse_error() {
        let raw = serde_json::json!({"choices": [], "model": "gpt-4o-mini"});
        let request = ModelRequest::new("hello", "tester");
        let err = adapter().parse_response(&request, &raw, 0).unwrap_err();
        assert!(matches!(err, AdapterError::Parse(_)));
    }

    #[test]
    fn null_content_becomes_empty_string() {
        let raw = serde_json::json!({
            "choices": [{"message": {"content": null}, "finish_reason": "length"}],
            "model": "gpt-4o-mini",
        });
        let request = ModelRequest::new("hello", "tester");
        let resp = adapter().parse_response(&request, &raw, 0).unwrap();
        assert!(resp.content.is_empty());
        assert_eq!(resp.finish_reason, "length");
    }
}
