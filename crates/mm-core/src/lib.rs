//! Core data model, configuration, and persistence for the modelmux routing
//! core.
//!
//! Everything here is provider-agnostic: the canonical request/response types,
//! the TOML configuration with validate-then-swap hot reload, and the SQLite
//! store that lets cost, performance, health, and failover history survive a
//! process restart.

pub mod config;
pub mod store;
pub mod types;

// Re-export the types that every other crate touches.
pub use config::{ConfigError, ConfigManager, ProviderSettings, RouterConfig};
pub use store::{RecordFilter, RouterStore, StoreError, StoredCacheEntry};
pub use types::{
    CostRecord, FailoverEvent, FailoverReason, HealthCheckResult, HealthState, ModelMetadata,
    ModelRequest, ModelResponse, PerformanceRecord, RateLimitEvent, RateLimitStatus, TaskPriority,
    TokenUsage,
};
