//! Model catalog.
//!
//! Entries are validated on the way in and shared out as `Arc`s, so an
//! `update_model` swaps one entry without blocking readers holding the old
//! one. Query methods return stable id-sorted order to keep selection
//! reproducible.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::AHashMap;
use tokio::sync::RwLock;
use tracing::info;

use mm_core::config::validate_model;
use mm_core::{ConfigError, ModelMetadata, RouterConfig};

pub struct ModelRegistry {
    models: RwLock<AHashMap<String, Arc<ModelMetadata>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(AHashMap::new()),
        }
    }

    /// Build a registry from a validated configuration's catalog.
    pub fn from_config(config: &RouterConfig) -> Result<Self, ConfigError> {
        let mut map = AHashMap::new();
        for model in &config.models {
            validate_model(model)?;
            map.insert(model.id.clone(), Arc::new(model.clone()));
        }
        info!(models = map.len(), "model registry loaded");
        Ok(Self {
            models: RwLock::new(map),
        })
    }

    pub async fn get_model(&self, id: &str) -> Option<Arc<ModelMetadata>> {
        self.models.read().await.get(id).cloned()
    }

    /// Every model, sorted by id.
    pub async fn all_models(&self) -> Vec<Arc<ModelMetadata>> {
        let map = self.models.read().await;
        let mut models: Vec<_> = map.values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Enabled models, sorted by id.
    pub async fn enabled_models(&self) -> Vec<Arc<ModelMetadata>> {
        let mut models = self.all_models().await;
        models.retain(|m| m.enabled);
        models
    }

    /// Enabled models carrying the capability, sorted by id.
    pub async fn models_by_capability(&self, capability: &str) -> Vec<Arc<ModelMetadata>> {
        let mut models = self.enabled_models().await;
        models.retain(|m| m.has_capability(capability));
        models
    }

    /// Enabled models whose blended per-1k rate falls in `[min, max]`,
    /// sorted by id.
    pub async fn models_by_cost_range(&self, min: f64, max: f64) -> Vec<Arc<ModelMetadata>> {
        let mut models = self.enabled_models().await;
        models.retain(|m| {
            let rate = m.blended_rate();
            rate >= min && rate <= max
        });
        models
    }

    /// Distinct provider ids across the catalog, sorted.
    pub async fn providers(&self) -> Vec<String> {
        let map = self.models.read().await;
        let set: BTreeSet<String> = map.values().map(|m| m.provider.clone()).collect();
        set.into_iter().collect()
    }

    /// Add a new model. Rejects invalid entries and duplicate ids.
    pub async fn add_model(&self, model: ModelMetadata) -> Result<(), ConfigError> {
        validate_model(&model)?;
        let mut map = self.models.write().await;
        if map.contains_key(&model.id) {
            return Err(ConfigError::InvalidModel {
                id: model.id,
                field: "id".into(),
                reason: "model already registered".into(),
            });
        }
        info!(model = %model.id, provider = %model.provider, "model added to registry");
        map.insert(model.id.clone(), Arc::new(model));
        Ok(())
    }

    /// Replace an existing model's metadata. The entry's `Arc` is swapped, so
    /// in-flight readers keep the version they resolved.
    pub async fn update_model(&self, id: &str, model: ModelMetadata) -> Result<(), ConfigError> {
        validate_model(&model)?;
        let mut map = self.models.write().await;
        if !map.contains_key(id) {
            return Err(ConfigError::InvalidModel {
                id: id.to_string(),
                field: "id".into(),
                reason: "model not registered".into(),
            });
        }
        map.insert(id.to_string(), Arc::new(model));
        info!(model = %id, "model metadata updated");
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.models.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.models.read().await.is_empty()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
