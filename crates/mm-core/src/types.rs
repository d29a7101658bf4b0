//! Canonical data model shared by every routing component.
//!
//! Requests and responses are provider-neutral: adapters translate them to and
//! from wire formats, so nothing outside `mm-providers` ever sees a
//! provider-specific type.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Scheduling priority of a generation request.
///
/// Priority shifts the selector's scoring weights: urgent work pays for
/// quality, background work pays for thrift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl TaskPriority {
    /// True for priorities that re-weight scoring toward performance.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Token usage
// ---------------------------------------------------------------------------

/// Token counts reported by a provider for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ---------------------------------------------------------------------------
// Model metadata
// ---------------------------------------------------------------------------

/// Catalog entry for one addressable model.
///
/// Loaded from the `[[models]]` tables of the config file and owned by the
/// registry; immutable afterwards except through an explicit update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub id: String,
    pub provider: String,
    /// Capability tags, e.g. "code-generation", "analysis". `BTreeSet` keeps
    /// serialized order stable.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// USD per 1k input tokens.
    pub cost_per_1k_input: f64,
    /// USD per 1k output tokens.
    pub cost_per_1k_output: f64,
    /// Requests allowed per rate-limit window.
    pub requests_per_window: u32,
    /// Tokens allowed per rate-limit window, when the provider meters tokens.
    #[serde(default)]
    pub tokens_per_window: Option<u64>,
    /// Declared context window in tokens.
    pub context_window: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-model base URL override (local inference, proxies).
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ModelMetadata {
    /// Cost in USD for the given token counts at this model's rates.
    pub fn calculate_cost(&self, usage: TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1000.0) * self.cost_per_1k_input
            + (usage.output_tokens as f64 / 1000.0) * self.cost_per_1k_output
    }

    /// Blended per-1k rate used for cost ranking and tie-breaks.
    pub fn blended_rate(&self) -> f64 {
        (self.cost_per_1k_input + self.cost_per_1k_output) / 2.0
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.contains(cap)
    }
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// A canonical generation request. Created once per call, read-only downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub task_id: Uuid,
    pub prompt: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Absolute deadline for the whole request including failover attempts.
    /// Monotonic, so it is never serialized.
    #[serde(skip)]
    pub deadline: Option<Instant>,
    /// Tag of the calling agent, used for cost and metrics grouping.
    pub agent_type: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ModelRequest {
    pub fn new(prompt: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            prompt: prompt.into(),
            required_capabilities: Vec::new(),
            priority: TaskPriority::Normal,
            deadline: None,
            agent_type: agent_type.into(),
            max_tokens: 1024,
            temperature: 0.7,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capability(mut self, cap: impl Into<String>) -> Self {
        self.required_capabilities.push(cap.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// True once the request's deadline has passed.
    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// A canonical generation response, produced by a provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub request_id: Uuid,
    pub model_id: String,
    pub content: String,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub success: bool,
    pub finish_reason: String,
}

// ---------------------------------------------------------------------------
// Persisted event records
// ---------------------------------------------------------------------------

/// One appended cost entry. Aggregated by day, model, and agent type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub timestamp: DateTime<Utc>,
    pub model_id: String,
    pub provider: String,
    pub agent_type: String,
    pub task_id: Uuid,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// One observation in a model's rolling performance window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub timestamp: DateTime<Utc>,
    pub model_id: String,
    pub agent_type: String,
    pub latency_ms: u64,
    pub success: bool,
    /// Optional evaluator score in `[0.0, 1.0]`.
    pub quality: Option<f64>,
}

/// Liveness state of a model as tracked by the health checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unavailable,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        };
        write!(f, "{s}")
    }
}

/// Result of one health probe, persisted for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub model_id: String,
    pub timestamp: DateTime<Utc>,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
    /// When the next probe is due (pushed out exponentially while failing).
    pub next_check_due: DateTime<Utc>,
}

/// Rate-limit pressure for one model's sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStatus {
    Ok,
    /// Utilization at or above 90% of the ceiling.
    Approaching,
    /// Window exhausted; dispatch must fail over.
    Limited,
}

impl fmt::Display for RateLimitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Approaching => "approaching",
            Self::Limited => "limited",
        };
        write!(f, "{s}")
    }
}

/// Recorded whenever a model's rate-limit status transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitEvent {
    pub timestamp: DateTime<Utc>,
    pub model_id: String,
    pub status: RateLimitStatus,
}

/// Why a request was moved off its selected model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    Unavailable,
    RateLimited,
    Error,
    QualityRegression,
}

impl fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unavailable => "unavailable",
            Self::RateLimited => "rate_limited",
            Self::Error => "error",
            Self::QualityRegression => "quality_regression",
        };
        write!(f, "{s}")
    }
}

/// One failover hop, appended for excessive-failover alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub timestamp: DateTime<Utc>,
    pub from_model: String,
    pub to_model: String,
    pub reason: FailoverReason,
    pub task_id: Uuid,
    pub attempt: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_model() -> ModelMetadata {
        ModelMetadata {
            id: "claude-sonnet-4".into(),
            provider: "anthropic".into(),
            capabilities: ["code-generation", "analysis"]
                .into_iter()
                .map(String::from)
                .collect(),
            cost_per_1k_input: 0.003,
            cost_per_1k_output: 0.015,
            requests_per_window: 100,
            tokens_per_window: Some(100_000),
            context_window: 200_000,
            enabled: true,
            base_url: None,
        }
    }

    // -- ModelMetadata --

    #[test]
    fn metadata_cost_calculation() {
        let model = sample_model();
        // 1000 in + 1000 out = $0.003 + $0.015
        let cost = model.calculate_cost(TokenUsage::new(1000, 1000));
        assert!((cost - 0.018).abs() < 1e-9);
        assert_eq!(model.calculate_cost(TokenUsage::default()), 0.0);
    }

    #[test]
    fn metadata_capability_lookup() {
        let model = sample_model();
        assert!(model.has_capability("code-generation"));
        assert!(!model.has_capability("vision"));
    }

    #[test]
    fn metadata_blended_rate() {
        let model = sample_model();
        assert!((model.blended_rate() - 0.009).abs() < 1e-9);
    }

    #[test]
    fn metadata_toml_roundtrip() {
        let model = sample_model();
        let text = toml::to_string(&model).unwrap();
        let deser: ModelMetadata = toml::from_str(&text).unwrap();
        assert_eq!(deser, model);
    }

    #[test]
    fn metadata_enabled_defaults_true() {
        let text = r#"
            id = "m1"
            provider = "openai"
            cost_per_1k_input = 0.001
            cost_per_1k_output = 0.002
            requests_per_window = 50
            context_window = 128000
        "#;
        let model: ModelMetadata = toml::from_str(text).unwrap();
        assert!(model.enabled);
        assert!(model.capabilities.is_empty());
        assert!(model.tokens_per_window.is_none());
    }

    // -- TaskPriority --

    #[test]
    fn priority_urgency() {
        assert!(TaskPriority::Critical.is_urgent());
        assert!(TaskPriority::High.is_urgent());
        assert!(!TaskPriority::Normal.is_urgent());
        assert!(!TaskPriority::Background.is_urgent());
    }

    #[test]
    fn priority_serialization() {
        let json = serde_json::to_string(&TaskPriority::Background).unwrap();
        assert_eq!(json, "\"background\"");
    }

    // -- ModelRequest --

    #[test]
    fn request_builder() {
        let req = ModelRequest::new("write a parser", "implementer")
            .with_priority(TaskPriority::High)
            .with_capability("code-generation")
            .with_max_tokens(2048);
        assert_eq!(req.priority, TaskPriority::High);
        assert_eq!(req.required_capabilities, vec!["code-generation"]);
        assert_eq!(req.max_tokens, 2048);
        assert!(req.deadline.is_none());
    }

    #[test]
    fn request_deadline_check() {
        let live = ModelRequest::new("hi", "tester")
            .with_deadline(Instant::now() + Duration::from_secs(60));
        assert!(!live.deadline_exceeded());

        let expired =
            ModelRequest::new("hi", "tester").with_deadline(Instant::now() - Duration::from_secs(1));
        assert!(expired.deadline_exceeded());
    }

    #[test]
    fn request_serialization_skips_deadline() {
        let req = ModelRequest::new("hi", "tester").with_deadline(Instant::now());
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("deadline"));
        let deser: ModelRequest = serde_json::from_str(&json).unwrap();
        assert!(deser.deadline.is_none());
        assert_eq!(deser.prompt, "hi");
    }

    // -- TokenUsage --

    #[test]
    fn usage_total() {
        assert_eq!(TokenUsage::new(100, 50).total(), 150);
    }

    // -- Event records --

    #[test]
    fn failover_event_serialization() {
        let event = FailoverEvent {
            timestamp: Utc::now(),
            from_model: "a".into(),
            to_model: "b".into(),
            reason: FailoverReason::RateLimited,
            task_id: Uuid::new_v4(),
            attempt: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"rate_limited\""));
        let deser: FailoverEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deser.reason, FailoverReason::RateLimited);
        assert_eq!(deser.attempt, 2);
    }

    #[test]
    fn health_state_display() {
        assert_eq!(HealthState::Unavailable.to_string(), "unavailable");
        assert_eq!(RateLimitStatus::Approaching.to_string(), "approaching");
        assert_eq!(FailoverReason::Error.to_string(), "error");
    }
}
