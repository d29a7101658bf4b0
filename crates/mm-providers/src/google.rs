//! Adapter for the Google Generative Language API (Gemini).
//!
//! Authentication rides in the `key` query parameter rather than a header,
//! and token usage arrives as `usageMetadata` counts.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use mm_core::{ModelMetadata, ModelRequest, ModelResponse, ProviderSettings, TokenUsage};

use crate::adapter::{error_from_response, AdapterError, ProviderAdapter};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GoogleAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl GoogleAdapter {
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

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the JSON request body for `generateContent`.
    pub fn build_request_body(request: &ModelRequest) -> Value {
        serde_json::json!({
            "contents": [{
                "parts": [{"text": request.prompt}],
            }],
            "generationConfig": {
                "maxOutputTokens": request.max_tokens,
                "temperature": request.temperature,
            },
        })
    }

    fn base(&self, model: &ModelMetadata) -> String {
        model
            .base_url
            .clone()
            .unwrap_or_else(|| self.base_url.clone())
    }
}

/// Deserialize helpers for the `generateContent` response.
#[derive(Deserialize)]
struct GoogleResponse {
    candidates: Vec<GoogleCandidate>,
}

#[derive(Deserialize)]
struct GoogleCandidate {
    content: GoogleContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GoogleContent {
    parts: Vec<GooglePart>,
}

#[derive(Deserialize)]
struct GooglePart {
    text: Option<String>,
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn provider_id(&self) -> &str {
        "google"
    }

    async fn send_request(
        &self,
        model: &ModelMetadata,
        request: &ModelRequest,
        api_key: Option<&str>,
    ) -> Result<Value, AdapterError> {
        let body = Self::build_request_body(request);
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base(model),
            model.id
        );

        let resp = self
            .client
            .post(&url)
            .query(&[("key", api_key.unwrap_or_default())])
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
        let api_resp: GoogleResponse = serde_json::from_value(raw.clone())
            .map_err(|e| AdapterError::Parse(e.to_string()))?;

        let candidate = api_resp
            .candidates
            .first()
            .ok_or_else(|| AdapterError::Parse("no candidates in response".into()))?;

        let content = candidate
            .content
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(ModelResponse {
            request_id: request.task_id,
            model_id: String::new(),
            content,
            usage: self.extract_token_usage(raw),
            latency_ms,
            success: true,
            finish_reason: candidate
                .finish_reason
                .clone()
                .unwrap_or_else(|| "unknown".into())
                .to_lowercase(),
        })
    }

    fn extract_token_usage(&self, raw: &Value) -> TokenUsage {
        TokenUsage::new(
            raw["usageMetadata"]["promptTokenCount"]
                .as_u64()
                .unwrap_or(0),
            raw["usageMetadata"]["candidatesTokenCount"]
                .as_u64()
                .unwrap_or(0),
        )
    }

    async fn probe(
        &self,
        model: &ModelMetadata,
        api_key: Option<&str>,
    ) -> Result<u64, AdapterError> {
        let url = format!("{}/v1beta/models", self.base(model));
        let start = Instant::now();
        let resp = self
            .client
            .get(&url)
            .query(&[("key", api_key.unwrap_or_default())])
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
