//! API key management.
//!
//! Credentials are never stored in configuration files: they come from
//! environment variables named after the provider (`ANTHROPIC_API_KEY`,
//! `ANTHROPIC_API_KEY_2`, …). Providers with several keys are rotated
//! round-robin on each `get_key` call to spread load.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("no credentials configured for provider `{provider}`")]
    NoCredentials { provider: String },
}

// ---------------------------------------------------------------------------
// ApiKeyManager
// ---------------------------------------------------------------------------

struct KeyRing {
    keys: Vec<String>,
    cursor: usize,
}

/// Holds one or more API keys per provider and rotates through them.
pub struct ApiKeyManager {
    rings: Mutex<HashMap<String, KeyRing>>,
}

/// Environment variable name for a provider's nth key (1-based; the first
/// key has no suffix).
fn env_var_name(provider: &str, index: usize) -> String {
    let prefix = provider.to_uppercase().replace('-', "_");
    if index == 1 {
        format!("{prefix}_API_KEY")
    } else {
        format!("{prefix}_API_KEY_{index}")
    }
}

impl ApiKeyManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
        }
    }

    /// Load keys for the given providers from the environment. Numbered
    /// variants are read until the first gap.
    pub fn from_env<'a>(providers: impl IntoIterator<Item = &'a str>) -> Self {
        let manager = Self::new();
        for provider in providers {
            let mut keys = Vec::new();
            for index in 1.. {
                match std::env::var(env_var_name(provider, index)) {
                    Ok(key) if !key.is_empty() => keys.push(key),
                    _ => break,
                }
            }
            if keys.is_empty() {
                debug!(provider, "no API keys found in environment");
            } else {
                debug!(provider, count = keys.len(), "loaded API keys");
                manager.set_keys(provider, keys);
            }
        }
        manager
    }

    /// Replace the key ring for a provider.
    pub fn set_keys(&self, provider: &str, keys: Vec<String>) {
        let mut rings = self.rings.lock().expect("key lock poisoned");
        rings.insert(provider.to_string(), KeyRing { keys, cursor: 0 });
    }

    /// Append a single key to a provider's ring.
    pub fn add_key(&self, provider: &str, key: impl Into<String>) {
        let mut rings = self.rings.lock().expect("key lock poisoned");
        rings
            .entry(provider.to_string())
            .or_insert_with(|| KeyRing {
                keys: Vec::new(),
                cursor: 0,
            })
            .keys
            .push(key.into());
    }

    /// The next key for a provider, rotating round-robin across its ring.
    pub fn get_key(&self, provider: &str) -> Result<String, KeyError> {
        let mut rings = self.rings.lock().expect("key lock poisoned");
        let ring = rings
            .get_mut(provider)
            .filter(|ring| !ring.keys.is_empty())
            .ok_or_else(|| KeyError::NoCredentials {
                provider: provider.to_string(),
            })?;
        let key = ring.keys[ring.cursor % ring.keys.len()].clone();
        ring.cursor = ring.cursor.wrapping_add(1);
        Ok(key)
    }

    pub fn key_count(&self, provider: &str) -> usize {
        let rings = self.rings.lock().expect("key lock poisoned");
        rings.get(provider).map_or(0, |ring| ring.keys.len())
    }

    pub fn has_keys(&self, provider: &str) -> bool {
        self.key_count(provider) > 0
    }

    /// Providers with at least one key, sorted for stable output.
    pub fn available_providers(&self) -> Vec<String> {
        let rings = self.rings.lock().expect("key lock poisoned");
        let mut providers: Vec<String> = rings
            .iter()
            .filter(|(_, ring)| !ring.keys.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        providers.sort();
        providers
    }

    /// Check that each required provider has credentials, logging a warning
    /// per missing one. Returns provider → present.
    pub fn validate_keys(&self, required: &[&str]) -> HashMap<String, bool> {
        let mut result = HashMap::new();
        for provider in required {
            let present = self.has_keys(provider);
            if !present {
                warn!(provider, "provider has no API keys configured");
            }
            result.insert(provider.to_string(), present);
        }
        result
    }
}

impl Default for ApiKeyManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
