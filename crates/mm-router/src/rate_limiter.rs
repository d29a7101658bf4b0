//! Sliding-window rate limiting per model.
//!
//! Each model keeps the timestamps (and token counts) of requests inside the
//! trailing window. `check_rate_limit` prunes lazily and classifies pressure
//! as `Ok` / `Approaching` (≥90% by default) / `Limited` (ceiling reached).
//! `record_request` is only called once a dispatch is actually attempted, so
//! speculative ranking never consumes quota. A provider-reported 429 forces
//! `Limited` until the window drains.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use chrono::Utc;
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use mm_core::{ModelMetadata, RateLimitEvent, RateLimitStatus, RouterStore};

// ---------------------------------------------------------------------------
// Per-model window
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ModelWindow {
    /// (committed-at, tokens) pairs inside the trailing window.
    entries: VecDeque<(Instant, u64)>,
    /// Set when the provider itself reported a rate limit.
    forced_until: Option<Instant>,
    last_status: Option<RateLimitStatus>,
}

impl ModelWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((ts, _)) = self.entries.front() {
            if now.duration_since(*ts) >= window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        if let Some(until) = self.forced_until {
            if now >= until {
                self.forced_until = None;
            }
        }
    }

    fn tokens_in_window(&self) -> u64 {
        self.entries.iter().map(|(_, tokens)| tokens).sum()
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

pub struct RateLimiter {
    window: Duration,
    approaching_threshold: f64,
    states: RwLock<AHashMap<String, ModelWindow>>,
    store: Option<Arc<RouterStore>>,
}

impl RateLimiter {
    pub fn new(window: Duration, approaching_threshold: f64) -> Self {
        Self {
            window,
            approaching_threshold,
            states: RwLock::new(AHashMap::new()),
            store: None,
        }
    }

    /// Persist status-transition events through the given store.
    pub fn with_store(mut self, store: Arc<RouterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Classify the model's current window pressure. Transitions into
    /// `Approaching` or `Limited` are recorded exactly once as rate-limit
    /// events.
    pub async fn check_rate_limit(&self, model: &ModelMetadata) -> RateLimitStatus {
        let now = Instant::now();
        let (status, event) = {
            let mut states = self.states.write().await;
            let state = states.entry(model.id.clone()).or_default();
            state.prune(now, self.window);

            let status = if state.forced_until.is_some() {
                RateLimitStatus::Limited
            } else {
                let request_util =
                    state.entries.len() as f64 / model.requests_per_window as f64;
                let token_util = model
                    .tokens_per_window
                    .map(|ceiling| state.tokens_in_window() as f64 / ceiling as f64)
                    .unwrap_or(0.0);
                let util = request_util.max(token_util);

                if util >= 1.0 {
                    RateLimitStatus::Limited
                } else if util >= self.approaching_threshold {
                    RateLimitStatus::Approaching
                } else {
                    RateLimitStatus::Ok
                }
            };

            let transitioned = state.last_status != Some(status);
            state.last_status = Some(status);

            let event = if transitioned && status != RateLimitStatus::Ok {
                warn!(model = %model.id, status = %status, "rate limit status transition");
                Some(RateLimitEvent {
                    timestamp: Utc::now(),
                    model_id: model.id.clone(),
                    status,
                })
            } else {
                None
            };
            (status, event)
        };

        if let (Some(event), Some(store)) = (&event, &self.store) {
            if let Err(e) = store.insert_rate_limit_event(event).await {
                debug!(error = %e, "failed to persist rate-limit event");
            }
        }

        status
    }

    /// Commit one dispatched request into the model's window.
    pub async fn record_request(&self, model_id: &str, tokens: u64) {
        let mut states = self.states.write().await;
        let state = states.entry(model_id.to_string()).or_default();
        state.entries.push_back((Instant::now(), tokens));
    }

    /// The provider itself said 429: hold the model at `Limited` until the
    /// window would have drained anyway.
    pub async fn mark_provider_limited(&self, model_id: &str) {
        let mut states = self.states.write().await;
        let state = states.entry(model_id.to_string()).or_default();
        state.forced_until = Some(Instant::now() + self.window);
        warn!(model = %model_id, "provider reported rate limit, holding model limited");
    }

    /// Time until the oldest in-window entry (or a forced hold) expires.
    /// `None` when the window is empty and unforced.
    pub async fn time_until_reset(&self, model_id: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut states = self.states.write().await;
        let state = states.get_mut(model_id)?;
        state.prune(now, self.window);

        let from_forced = state
            .forced_until
            .map(|until| until.saturating_duration_since(now));
        let from_oldest = state.entries.front().map(|(ts, _)| {
            self.window
                .saturating_sub(now.saturating_duration_since(*ts))
        });
        match (from_forced, from_oldest) {
            (Some(f), Some(o)) => Some(f.max(o)),
            (Some(f), None) => Some(f),
            (None, other) => other,
        }
    }

    /// Requests currently counted in the model's window.
    pub async fn in_window_count(&self, model_id: &str) -> usize {
        let now = Instant::now();
        let mut states = self.states.write().await;
        match states.get_mut(model_id) {
            Some(state) => {
                state.prune(now, self.window);
                state.entries.len()
            }
            None => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
