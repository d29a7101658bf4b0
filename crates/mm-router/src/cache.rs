//! Content-addressed response cache with TTL and LRU eviction.
//!
//! Keys are **model-scoped**: the hash covers model id, prompt, and sampling
//! parameters, because responses are not interchangeable across models. The
//! in-memory map is the hot path; writes go through to the store so entries
//! survive restart, and `warm_from_store` reloads them on open. If the store
//! fails, the cache keeps serving from memory and stops touching the store —
//! persistence trouble must never block the request path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use mm_core::{ModelRequest, ModelResponse, RouterStore, StoredCacheEntry};

// ---------------------------------------------------------------------------
// Entry & stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
    model_id: String,
    response: ModelResponse,
    cached_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
}

/// Cache performance counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / self.lookups as f64
    }
}

// ---------------------------------------------------------------------------
// CacheManager
// ---------------------------------------------------------------------------

pub struct CacheManager {
    capacity: usize,
    default_ttl: Duration,
    entries: RwLock<AHashMap<String, CacheEntry>>,
    stats: RwLock<CacheStats>,
    store: Option<Arc<RouterStore>>,
    store_healthy: AtomicBool,
}

impl CacheManager {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            capacity,
            default_ttl,
            entries: RwLock::new(AHashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            store: None,
            store_healthy: AtomicBool::new(true),
        }
    }

    /// Write entries through to the given store.
    pub fn with_store(mut self, store: Arc<RouterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Deterministic cache key: SHA-256 over the model id, prompt, and
    /// sampling parameters. Agent tags and priorities don't affect the
    /// response, so they are excluded.
    pub fn generate_cache_key(model_id: &str, request: &ModelRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model_id.as_bytes());
        hasher.update([0]);
        hasher.update(request.prompt.as_bytes());
        hasher.update([0]);
        hasher.update(request.max_tokens.to_le_bytes());
        hasher.update(request.temperature.to_bits().to_le_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Look up a response. Expired entries are evicted lazily here.
    pub async fn get(&self, key: &str) -> Option<ModelResponse> {
        let now = Utc::now();
        let (result, evicted) = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(key) {
                Some(entry) if now < entry.expires_at => {
                    entry.last_access = now;
                    (Some(entry.response.clone()), false)
                }
                Some(_) => {
                    entries.remove(key);
                    (None, true)
                }
                None => (None, false),
            }
        };

        {
            let mut stats = self.stats.write().await;
            stats.lookups += 1;
            if result.is_some() {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
            if evicted {
                stats.evictions += 1;
            }
        }

        if evicted {
            self.store_delete(key).await;
        }
        result
    }

    /// Insert or overwrite a response. The last successful write for a key
    /// stands, so concurrent identical fills are harmless. Exceeding capacity
    /// evicts least-recently-used entries, ties broken by oldest insertion.
    pub async fn set(
        &self,
        key: &str,
        model_id: &str,
        response: &ModelResponse,
        ttl: Option<Duration>,
    ) {
        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let entry = CacheEntry {
            model_id: model_id.to_string(),
            response: response.clone(),
            cached_at: now,
            expires_at,
            last_access: now,
        };

        let evicted_keys = {
            let mut entries = self.entries.write().await;
            entries.insert(key.to_string(), entry.clone());

            let mut evicted = Vec::new();
            while entries.len() > self.capacity {
                if let Some(victim) = entries
                    .iter()
                    .min_by_key(|(_, e)| (e.last_access, e.cached_at))
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&victim);
                    evicted.push(victim);
                } else {
                    break;
                }
            }
            evicted
        };

        {
            let mut stats = self.stats.write().await;
            stats.evictions += evicted_keys.len() as u64;
        }

        self.store_upsert(key, &entry).await;
        for victim in &evicted_keys {
            debug!(key = %victim, "evicted least-recently-used cache entry");
            self.store_delete(victim).await;
        }
    }

    /// Purge every expired entry from memory and store. Returns the number
    /// removed from memory.
    pub async fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let removed = {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|_, e| now < e.expires_at);
            before - entries.len()
        };
        if removed > 0 {
            let mut stats = self.stats.write().await;
            stats.evictions += removed as u64;
        }
        if let Some(store) = self.healthy_store() {
            if let Err(e) = store.delete_expired_cache().await {
                self.note_store_failure(&e);
            }
        }
        removed
    }

    /// Load surviving entries from the store after a restart.
    pub async fn warm_from_store(&self) {
        let Some(store) = self.healthy_store() else {
            return;
        };
        match store.load_cache_entries().await {
            Ok(rows) => {
                let count = rows.len();
                let mut entries = self.entries.write().await;
                for row in rows {
                    entries.insert(
                        row.cache_key.clone(),
                        CacheEntry {
                            model_id: row.model_id,
                            response: row.response,
                            cached_at: row.cached_at,
                            expires_at: row.expires_at,
                            last_access: row.last_access,
                        },
                    );
                }
                debug!(entries = count, "cache warmed from store");
            }
            Err(e) => self.note_store_failure(&e),
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().await.clone();
        stats.entries = self.entries.read().await.len();
        stats
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Whether the backing store is still being written to.
    pub fn store_available(&self) -> bool {
        self.store.is_some() && self.store_healthy.load(Ordering::Relaxed)
    }

    /// Resume store writes after the operator restores the backing store.
    pub fn retry_store(&self) {
        self.store_healthy.store(true, Ordering::Relaxed);
    }

    // -- store plumbing ------------------------------------------------------

    fn healthy_store(&self) -> Option<&Arc<RouterStore>> {
        if self.store_healthy.load(Ordering::Relaxed) {
            self.store.as_ref()
        } else {
            None
        }
    }

    fn note_store_failure(&self, error: &mm_core::StoreError) {
        if self.store_healthy.swap(false, Ordering::Relaxed) {
            warn!(error = %error, "cache store unavailable, continuing memory-only");
        }
    }

    async fn store_upsert(&self, key: &str, entry: &CacheEntry) {
        if let Some(store) = self.healthy_store() {
            let stored = StoredCacheEntry {
                cache_key: key.to_string(),
                model_id: entry.model_id.clone(),
                response: entry.response.clone(),
                cached_at: entry.cached_at,
                expires_at: entry.expires_at,
                last_access: entry.last_access,
            };
            if let Err(e) = store.upsert_cached_response(&stored).await {
                self.note_store_failure(&e);
            }
        }
    }

    async fn store_delete(&self, key: &str) {
        if let Some(store) = self.healthy_store() {
            if let Err(e) = store.delete_cached_response(key).await {
                self.note_store_failure(&e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
