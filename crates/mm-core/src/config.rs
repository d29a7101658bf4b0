//! Declarative configuration for the routing core.
//!
//! A single TOML document carries the model catalog, per-provider settings,
//! and every tunable. Reloads are validate-then-swap: an invalid file leaves
//! the active configuration untouched, and in-flight requests keep the `Arc`
//! they started with.
//!
//! **Security**: this file NEVER stores API keys or secrets. Credentials are
//! read from environment variables at runtime (see `mm-providers`).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::ModelMetadata;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    /// A model entry failed schema validation. Field-level so the operator
    /// can fix the exact line instead of bisecting the catalog.
    #[error("invalid model `{id}`: field `{field}`: {reason}")]
    InvalidModel {
        id: String,
        field: String,
        reason: String,
    },

    #[error("invalid setting `{setting}`: {reason}")]
    InvalidSetting { setting: String, reason: String },
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Per-provider connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Simultaneous in-flight calls allowed against this provider.
    #[serde(default = "default_concurrency")]
    pub concurrency_limit: usize,
    /// Calls allowed to wait for a permit before `QueueFull`.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_timeout_secs() -> u64 {
    60
}
fn default_concurrency() -> usize {
    8
}
fn default_queue_depth() -> usize {
    32
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_timeout_secs(),
            concurrency_limit: default_concurrency(),
            queue_depth: default_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum number of cached responses before LRU eviction.
    pub capacity: usize,
    pub default_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Sliding window length in seconds.
    pub window_secs: u64,
    /// Utilization fraction at which a model is flagged `Approaching`.
    pub approaching_threshold: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            approaching_threshold: 0.90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    /// Rolling window length per model, in records.
    pub window_size: usize,
    /// Success-rate floor below which a model is considered degrading.
    pub success_rate_floor: f64,
    /// Latency ceiling in milliseconds above which a model is degrading.
    pub latency_ceiling_ms: u64,
    /// Consecutive breaching records required before degradation is flagged.
    pub min_consecutive: usize,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            window_size: 100,
            success_rate_floor: 0.80,
            latency_ceiling_ms: 10_000,
            min_consecutive: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Probe period while a model is healthy.
    pub check_interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// Consecutive failures before a model is marked unavailable.
    pub failure_threshold: u32,
    /// Cap on the exponential probe backoff.
    pub max_backoff_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            probe_timeout_secs: 10,
            failure_threshold: 3,
            max_backoff_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    pub daily_budget_usd: f64,
    /// Utilization fraction at which the `Near` alert fires.
    pub near_threshold: f64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            daily_budget_usd: 100.0,
            near_threshold: 0.90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverSettings {
    /// Same-model retries before moving to the next candidate.
    pub max_same_model_retries: u32,
    /// Distinct models tried before giving up.
    pub max_models: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Failovers per model per window that trigger the operator alert.
    pub alert_threshold: usize,
    pub alert_window_secs: u64,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            max_same_model_retries: 2,
            max_models: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            alert_threshold: 5,
            alert_window_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorSettings {
    /// Quality floor below which a same-request model switch is considered.
    pub quality_floor: f64,
    /// Consecutive low scores required before the switch signal fires.
    pub min_consecutive: usize,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            quality_floor: 0.5,
            min_consecutive: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// RouterConfig
// ---------------------------------------------------------------------------

/// The full configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default, rename = "models")]
    pub models: Vec<ModelMetadata>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub rate_limiter: RateLimitSettings,
    #[serde(default)]
    pub performance: PerformanceSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub budget: BudgetSettings,
    #[serde(default)]
    pub failover: FailoverSettings,
    #[serde(default)]
    pub evaluator: EvaluatorSettings,
}

impl RouterConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: RouterConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a file path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    /// Settings for a provider, falling back to defaults when unconfigured.
    pub fn provider_settings(&self, provider: &str) -> ProviderSettings {
        self.providers.get(provider).cloned().unwrap_or_default()
    }

    /// Validate every model entry and tunable. Invalid entries are rejected
    /// with a field-level error, never silently dropped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for model in &self.models {
            validate_model(model)?;
            if !seen.insert(model.id.as_str()) {
                return Err(ConfigError::InvalidModel {
                    id: model.id.clone(),
                    field: "id".into(),
                    reason: "duplicate model id".into(),
                });
            }
        }

        let fraction = |name: &str, v: f64| -> Result<(), ConfigError> {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::InvalidSetting {
                    setting: name.into(),
                    reason: format!("{v} is outside [0.0, 1.0]"),
                });
            }
            Ok(())
        };
        fraction(
            "rate_limiter.approaching_threshold",
            self.rate_limiter.approaching_threshold,
        )?;
        fraction(
            "performance.success_rate_floor",
            self.performance.success_rate_floor,
        )?;
        fraction("budget.near_threshold", self.budget.near_threshold)?;
        fraction("evaluator.quality_floor", self.evaluator.quality_floor)?;

        if self.rate_limiter.window_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "rate_limiter.window_secs".into(),
                reason: "window must be non-zero".into(),
            });
        }
        if self.budget.daily_budget_usd < 0.0 {
            return Err(ConfigError::InvalidSetting {
                setting: "budget.daily_budget_usd".into(),
                reason: "budget cannot be negative".into(),
            });
        }
        for (name, settings) in &self.providers {
            if settings.concurrency_limit == 0 {
                return Err(ConfigError::InvalidSetting {
                    setting: format!("providers.{name}.concurrency_limit"),
                    reason: "must allow at least one in-flight call".into(),
                });
            }
        }
        Ok(())
    }
}

/// Schema check for a single catalog entry.
pub fn validate_model(model: &ModelMetadata) -> Result<(), ConfigError> {
    let invalid = |field: &str, reason: &str| ConfigError::InvalidModel {
        id: model.id.clone(),
        field: field.into(),
        reason: reason.into(),
    };

    if model.id.is_empty() {
        return Err(invalid("id", "must be non-empty"));
    }
    if model.provider.is_empty() {
        return Err(invalid("provider", "must be non-empty"));
    }
    if model.cost_per_1k_input < 0.0 {
        return Err(invalid("cost_per_1k_input", "cost cannot be negative"));
    }
    if model.cost_per_1k_output < 0.0 {
        return Err(invalid("cost_per_1k_output", "cost cannot be negative"));
    }
    if model.requests_per_window == 0 {
        return Err(invalid("requests_per_window", "ceiling must be non-zero"));
    }
    if model.context_window == 0 {
        return Err(invalid("context_window", "must be non-zero"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ConfigManager — hot reload
// ---------------------------------------------------------------------------

/// Holds the active configuration and swaps it atomically on reload.
///
/// Readers clone an `Arc` and keep it for the duration of a request, so a
/// reload never changes settings mid-flight.
pub struct ConfigManager {
    path: PathBuf,
    current: RwLock<Arc<RouterConfig>>,
}

impl ConfigManager {
    /// Load the initial configuration from `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let cfg = RouterConfig::load(&path)?;
        info!(path = %path.display(), models = cfg.models.len(), "configuration loaded");
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(cfg)),
        })
    }

    /// Wrap an already-built configuration (tests, embedded callers).
    pub fn from_config(cfg: RouterConfig) -> Self {
        Self {
            path: PathBuf::new(),
            current: RwLock::new(Arc::new(cfg)),
        }
    }

    /// The active configuration.
    pub fn get(&self) -> Arc<RouterConfig> {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// Re-read the file. On any parse or validation error the previous
    /// configuration stays active and the error is returned.
    pub fn reload(&self) -> Result<(), ConfigError> {
        match RouterConfig::load(&self.path) {
            Ok(cfg) => {
                let mut guard = self.current.write().expect("config lock poisoned");
                *guard = Arc::new(cfg);
                info!(path = %self.path.display(), "configuration reloaded");
                Ok(())
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "reload rejected, keeping previous configuration");
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [[models]]
        id = "claude-sonnet-4"
        provider = "anthropic"
        capabilities = ["code-generation", "analysis"]
        cost_per_1k_input = 0.003
        cost_per_1k_output = 0.015
        requests_per_window = 100
        context_window = 200000

        [[models]]
        id = "gpt-4o-mini"
        provider = "openai"
        capabilities = ["text-generation"]
        cost_per_1k_input = 0.00015
        cost_per_1k_output = 0.0006
        requests_per_window = 500
        context_window = 128000

        [providers.anthropic]
        timeout_secs = 45
        concurrency_limit = 4

        [budget]
        daily_budget_usd = 50.0
    "#;

    // -- Parsing --

    #[test]
    fn parses_full_document() {
        let cfg = RouterConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(cfg.models.len(), 2);
        assert_eq!(cfg.models[0].id, "claude-sonnet-4");
        assert_eq!(cfg.provider_settings("anthropic").timeout_secs, 45);
        assert!((cfg.budget.daily_budget_usd - 50.0).abs() < 1e-9);
        // Unconfigured sections fall back to defaults.
        assert_eq!(cfg.cache.capacity, 1000);
        assert_eq!(cfg.rate_limiter.window_secs, 60);
    }

    #[test]
    fn unknown_provider_gets_default_settings() {
        let cfg = RouterConfig::from_toml(SAMPLE).unwrap();
        let settings = cfg.provider_settings("google");
        assert_eq!(settings.timeout_secs, 60);
        assert_eq!(settings.concurrency_limit, 8);
    }

    #[test]
    fn empty_document_is_valid() {
        let cfg = RouterConfig::from_toml("").unwrap();
        assert!(cfg.models.is_empty());
    }

    // -- Validation --

    #[test]
    fn rejects_duplicate_model_ids() {
        let text = r#"
            [[models]]
            id = "m1"
            provider = "openai"
            cost_per_1k_input = 0.001
            cost_per_1k_output = 0.002
            requests_per_window = 10
            context_window = 1000

            [[models]]
            id = "m1"
            provider = "openai"
            cost_per_1k_input = 0.001
            cost_per_1k_output = 0.002
            requests_per_window = 10
            context_window = 1000
        "#;
        let err = RouterConfig::from_toml(text).unwrap_err();
        match err {
            ConfigError::InvalidModel { id, field, .. } => {
                assert_eq!(id, "m1");
                assert_eq!(field, "id");
            }
            other => panic!("expected InvalidModel, got {other}"),
        }
    }

    #[test]
    fn rejects_negative_cost_with_field_error() {
        let text = r#"
            [[models]]
            id = "m1"
            provider = "openai"
            cost_per_1k_input = -0.001
            cost_per_1k_output = 0.002
            requests_per_window = 10
            context_window = 1000
        "#;
        let err = RouterConfig::from_toml(text).unwrap_err();
        assert!(err.to_string().contains("cost_per_1k_input"));
    }

    #[test]
    fn rejects_zero_rate_ceiling() {
        let text = r#"
            [[models]]
            id = "m1"
            provider = "openai"
            cost_per_1k_input = 0.001
            cost_per_1k_output = 0.002
            requests_per_window = 0
            context_window = 1000
        "#;
        assert!(RouterConfig::from_toml(text).is_err());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let text = r#"
            [rate_limiter]
            approaching_threshold = 1.5
        "#;
        let err = RouterConfig::from_toml(text).unwrap_err();
        assert!(err.to_string().contains("approaching_threshold"));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let text = r#"
            [providers.openai]
            concurrency_limit = 0
        "#;
        assert!(RouterConfig::from_toml(text).is_err());
    }

    // -- Hot reload --

    #[test]
    fn reload_swaps_on_valid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let manager = ConfigManager::load(file.path()).unwrap();
        assert_eq!(manager.get().models.len(), 2);

        std::fs::write(file.path(), "[budget]\ndaily_budget_usd = 10.0\n").unwrap();
        manager.reload().unwrap();
        assert!(manager.get().models.is_empty());
        assert!((manager.get().budget.daily_budget_usd - 10.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_reload_keeps_previous_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let manager = ConfigManager::load(file.path()).unwrap();

        std::fs::write(file.path(), "this is not toml [[[").unwrap();
        assert!(manager.reload().is_err());
        // Previous configuration still active.
        assert_eq!(manager.get().models.len(), 2);
    }

    #[test]
    fn in_flight_arc_survives_reload() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let manager = ConfigManager::load(file.path()).unwrap();

        let held = manager.get();
        std::fs::write(file.path(), "").unwrap();
        manager.reload().unwrap();
        // The held Arc still sees the original catalog.
        assert_eq!(held.models.len(), 2);
        assert_eq!(manager.get().models.len(), 0);
    }
}
