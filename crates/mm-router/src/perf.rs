//! Rolling performance metrics per model.
//!
//! Every completed dispatch appends a record to a bounded per-model window
//! (FIFO, oldest drops first) and to the store. Degradation is flagged only
//! after a configurable number of consecutive breaching records, so a single
//! slow response never flips a model's standing. Store outages buffer records
//! in memory and replay on recovery.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use mm_core::config::PerformanceSettings;
use mm_core::{PerformanceRecord, RouterStore};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Rolling aggregates over one model's window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub model_id: String,
    pub sample_count: usize,
    /// Fraction of windowed requests that succeeded.
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
    /// Mean evaluator score over records that carry one.
    pub avg_quality: Option<f64>,
    pub degraded: bool,
}

// ---------------------------------------------------------------------------
// PerformanceMonitor
// ---------------------------------------------------------------------------

pub struct PerformanceMonitor {
    settings: PerformanceSettings,
    windows: RwLock<AHashMap<String, VecDeque<PerformanceRecord>>>,
    store: Option<Arc<RouterStore>>,
    /// Records waiting for the store to come back.
    buffer: Mutex<Vec<PerformanceRecord>>,
    store_healthy: AtomicBool,
}

impl PerformanceMonitor {
    pub fn new(settings: PerformanceSettings) -> Self {
        Self {
            settings,
            windows: RwLock::new(AHashMap::new()),
            store: None,
            buffer: Mutex::new(Vec::new()),
            store_healthy: AtomicBool::new(true),
        }
    }

    /// Persist records through the given store.
    pub fn with_store(mut self, store: Arc<RouterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Append one observation to the model's rolling window.
    pub async fn record_performance(
        &self,
        model_id: &str,
        agent_type: &str,
        latency_ms: u64,
        success: bool,
        quality: Option<f64>,
    ) {
        let record = PerformanceRecord {
            timestamp: Utc::now(),
            model_id: model_id.to_string(),
            agent_type: agent_type.to_string(),
            latency_ms,
            success,
            quality,
        };

        {
            let mut windows = self.windows.write().await;
            let window = windows.entry(model_id.to_string()).or_default();
            window.push_back(record.clone());
            while window.len() > self.settings.window_size {
                window.pop_front();
            }
        }

        self.persist(record).await;
    }

    async fn persist(&self, record: PerformanceRecord) {
        let Some(store) = &self.store else {
            return;
        };

        if self.store_healthy.load(Ordering::Relaxed) {
            let pending: Vec<PerformanceRecord> = {
                let mut buffer = self.buffer.lock().await;
                buffer.drain(..).collect()
            };
            for pending_record in pending {
                if let Err(e) = store.insert_performance_record(&pending_record).await {
                    self.note_failure(&e);
                    self.buffer.lock().await.push(pending_record);
                    break;
                }
            }
        }

        if self.store_healthy.load(Ordering::Relaxed) {
            if let Err(e) = store.insert_performance_record(&record).await {
                self.note_failure(&e);
                self.buffer.lock().await.push(record);
            }
        } else {
            self.buffer.lock().await.push(record);
        }
    }

    fn note_failure(&self, error: &mm_core::StoreError) {
        if self.store_healthy.swap(false, Ordering::Relaxed) {
            warn!(error = %error, "performance store unavailable, buffering records in memory");
        }
    }

    /// Resume store writes after the backing store recovers.
    pub fn retry_store(&self) {
        self.store_healthy.store(true, Ordering::Relaxed);
    }

    /// Rolling aggregates for one model. `None` until at least one record.
    pub async fn model_performance(&self, model_id: &str) -> Option<PerformanceSnapshot> {
        let windows = self.windows.read().await;
        let window = windows.get(model_id)?;
        if window.is_empty() {
            return None;
        }

        let sample_count = window.len();
        let successes = window.iter().filter(|r| r.success).count();
        let mut latencies: Vec<u64> = window.iter().map(|r| r.latency_ms).collect();
        latencies.sort_unstable();
        let p95_index = ((sample_count as f64 * 0.95).ceil() as usize).saturating_sub(1);
        let avg_latency_ms =
            latencies.iter().sum::<u64>() as f64 / sample_count as f64;

        let qualities: Vec<f64> = window.iter().filter_map(|r| r.quality).collect();
        let avg_quality = if qualities.is_empty() {
            None
        } else {
            Some(qualities.iter().sum::<f64>() / qualities.len() as f64)
        };

        Some(PerformanceSnapshot {
            model_id: model_id.to_string(),
            sample_count,
            success_rate: successes as f64 / sample_count as f64,
            avg_latency_ms,
            p95_latency_ms: latencies[p95_index],
            avg_quality,
            degraded: self.is_degraded(window),
        })
    }

    /// Whether the model's recent records show sustained degradation: the last
    /// `min_consecutive` observations each either failed or breached the
    /// latency ceiling, and the window holds enough samples to judge.
    pub async fn detect_degradation(&self, model_id: &str) -> bool {
        let windows = self.windows.read().await;
        match windows.get(model_id) {
            Some(window) => self.is_degraded(window),
            None => false,
        }
    }

    fn is_degraded(&self, window: &VecDeque<PerformanceRecord>) -> bool {
        let n = self.settings.min_consecutive;
        if n == 0 || window.len() < n {
            return false;
        }
        let recent = window.iter().rev().take(n);
        let all_breaching = recent
            .clone()
            .all(|r| !r.success || r.latency_ms > self.settings.latency_ceiling_ms);
        if !all_breaching {
            return false;
        }
        // Sustained breaches only count once the rolling rates confirm them.
        let successes = window.iter().filter(|r| r.success).count();
        let success_rate = successes as f64 / window.len() as f64;
        let recent_all_failures = recent.clone().all(|r| !r.success);
        let degraded = if recent_all_failures {
            success_rate < self.settings.success_rate_floor || window.len() == n
        } else {
            true
        };
        if degraded {
            debug!(breaches = n, "model performance degradation detected");
        }
        degraded
    }

    /// Snapshots for every model with at least one record, sorted by id.
    pub async fn all_performance(&self) -> Vec<PerformanceSnapshot> {
        let ids: Vec<String> = {
            let windows = self.windows.read().await;
            let mut ids: Vec<String> = windows.keys().cloned().collect();
            ids.sort();
            ids
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(snapshot) = self.model_performance(&id).await {
                out.push(snapshot);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
