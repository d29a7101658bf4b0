//! Cost tracking, aggregation, and budget alerting.
//!
//! Every completed request appends a cost record computed from the model's
//! per-1k rates. Aggregation is answered from the store; when the store is
//! down, records buffer in memory and replay once it recovers, so the request
//! path never blocks on persistence. Budget alerts are edge-triggered: one
//! alert per threshold crossing, not one per request while over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use mm_core::config::BudgetSettings;
use mm_core::{
    CostRecord, ModelMetadata, ModelRequest, RecordFilter, RouterStore, TokenUsage,
};

use crate::error::RouterError;

// ---------------------------------------------------------------------------
// Budget status
// ---------------------------------------------------------------------------

/// Where today's spend sits relative to the configured ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Under,
    /// Utilization at or above the near threshold (default 90%).
    Near,
    /// Ceiling exceeded.
    Over,
}

/// Emitted once per upward threshold crossing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub status: BudgetStatus,
    pub spent_usd: f64,
    pub budget_usd: f64,
    pub utilization: f64,
}

/// Aggregate totals over a filtered set of cost records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub avg_cost_per_request: f64,
}

// ---------------------------------------------------------------------------
// CostTracker
// ---------------------------------------------------------------------------

pub struct CostTracker {
    store: Arc<RouterStore>,
    settings: BudgetSettings,
    last_budget_status: Mutex<BudgetStatus>,
    /// Records waiting for the store to come back.
    buffer: Mutex<Vec<CostRecord>>,
    store_healthy: AtomicBool,
}

impl CostTracker {
    pub fn new(store: Arc<RouterStore>, settings: BudgetSettings) -> Self {
        Self {
            store,
            settings,
            last_budget_status: Mutex::new(BudgetStatus::Under),
            buffer: Mutex::new(Vec::new()),
            store_healthy: AtomicBool::new(true),
        }
    }

    /// Record the cost of a completed request. Returns the computed cost and
    /// a budget alert when this record crosses a threshold.
    pub async fn record_cost(
        &self,
        model: &ModelMetadata,
        request: &ModelRequest,
        usage: TokenUsage,
    ) -> (f64, Option<BudgetAlert>) {
        let cost = model.calculate_cost(usage);
        let record = CostRecord {
            timestamp: Utc::now(),
            model_id: model.id.clone(),
            provider: model.provider.clone(),
            agent_type: request.agent_type.clone(),
            task_id: request.task_id,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd: cost,
        };
        self.persist(record).await;

        let alert = self.check_crossing().await;
        (cost, alert)
    }

    async fn persist(&self, record: CostRecord) {
        if self.store_healthy.load(Ordering::Relaxed) {
            // Replay anything buffered during an outage first.
            let pending: Vec<CostRecord> = {
                let mut buffer = self.buffer.lock().await;
                buffer.drain(..).collect()
            };
            for pending_record in pending {
                if let Err(e) = self.store.insert_cost_record(&pending_record).await {
                    self.note_failure(&e);
                    self.buffer.lock().await.push(pending_record);
                    break;
                }
            }
        }

        if self.store_healthy.load(Ordering::Relaxed) {
            if let Err(e) = self.store.insert_cost_record(&record).await {
                self.note_failure(&e);
                self.buffer.lock().await.push(record);
            }
        } else {
            self.buffer.lock().await.push(record);
        }
    }

    fn note_failure(&self, error: &mm_core::StoreError) {
        if self.store_healthy.swap(false, Ordering::Relaxed) {
            warn!(error = %error, "cost store unavailable, buffering records in memory");
        }
    }

    /// Resume store writes after the backing store recovers.
    pub fn retry_store(&self) {
        self.store_healthy.store(true, Ordering::Relaxed);
    }

    /// Total spend for one UTC day, including any buffered records.
    pub async fn daily_cost(&self, date: NaiveDate) -> Result<f64, RouterError> {
        let stored = if self.store_healthy.load(Ordering::Relaxed) {
            self.store.daily_cost(date).await.unwrap_or_else(|e| {
                self.note_failure(&e);
                0.0
            })
        } else {
            0.0
        };
        let buffered: f64 = self
            .buffer
            .lock()
            .await
            .iter()
            .filter(|r| r.timestamp.date_naive() == date)
            .map(|r| r.cost_usd)
            .sum();
        Ok(stored + buffered)
    }

    /// Cost aggregated per model over the filtered range.
    pub async fn cost_by_model(
        &self,
        filter: RecordFilter,
    ) -> Result<HashMap<String, f64>, RouterError> {
        let records = self.store.query_cost_records(filter).await?;
        let mut by_model: HashMap<String, f64> = HashMap::new();
        for record in records {
            *by_model.entry(record.model_id).or_default() += record.cost_usd;
        }
        Ok(by_model)
    }

    /// Cost aggregated per agent type over the filtered range.
    pub async fn cost_by_agent_type(
        &self,
        filter: RecordFilter,
    ) -> Result<HashMap<String, f64>, RouterError> {
        let records = self.store.query_cost_records(filter).await?;
        let mut by_agent: HashMap<String, f64> = HashMap::new();
        for record in records {
            *by_agent.entry(record.agent_type).or_default() += record.cost_usd;
        }
        Ok(by_agent)
    }

    /// Totals over the filtered range.
    pub async fn cost_summary(&self, filter: RecordFilter) -> Result<CostSummary, RouterError> {
        let records = self.store.query_cost_records(filter).await?;
        let total_requests = records.len() as u64;
        let total_cost_usd: f64 = records.iter().map(|r| r.cost_usd).sum();
        let total_input_tokens: u64 = records.iter().map(|r| r.input_tokens).sum();
        let total_output_tokens: u64 = records.iter().map(|r| r.output_tokens).sum();
        Ok(CostSummary {
            total_cost_usd,
            total_requests,
            total_input_tokens,
            total_output_tokens,
            avg_cost_per_request: if total_requests > 0 {
                total_cost_usd / total_requests as f64
            } else {
                0.0
            },
        })
    }

    /// Current budget position for today (UTC).
    pub async fn check_budget(&self) -> BudgetStatus {
        let spent = self
            .daily_cost(Utc::now().date_naive())
            .await
            .unwrap_or(0.0);
        self.classify(spent)
    }

    fn classify(&self, spent: f64) -> BudgetStatus {
        if self.settings.daily_budget_usd <= 0.0 {
            return BudgetStatus::Under;
        }
        let utilization = spent / self.settings.daily_budget_usd;
        if utilization > 1.0 {
            BudgetStatus::Over
        } else if utilization >= self.settings.near_threshold {
            BudgetStatus::Near
        } else {
            BudgetStatus::Under
        }
    }

    /// Compare the current status with the previous one; an upward move
    /// produces exactly one alert.
    async fn check_crossing(&self) -> Option<BudgetAlert> {
        let spent = self
            .daily_cost(Utc::now().date_naive())
            .await
            .unwrap_or(0.0);
        let status = self.classify(spent);

        let mut last = self.last_budget_status.lock().await;
        let crossed_up = status > *last;
        *last = status;
        drop(last);

        if crossed_up {
            let alert = BudgetAlert {
                status,
                spent_usd: spent,
                budget_usd: self.settings.daily_budget_usd,
                utilization: if self.settings.daily_budget_usd > 0.0 {
                    spent / self.settings.daily_budget_usd
                } else {
                    0.0
                },
            };
            warn!(
                status = ?alert.status,
                spent = alert.spent_usd,
                budget = alert.budget_usd,
                "budget threshold crossed"
            );
            Some(alert)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn model(id: &str, rate: f64) -> ModelMetadata {
        ModelMetadata {
            id: id.into(),
            provider: "anthropic".into(),
            capabilities: BTreeSet::new(),
            cost_per_1k_input: rate,
            cost_per_1k_output: rate,
            requests_per_window: 100,
            tokens_per_window: None,
            context_window: 100_000,
            enabled: true,
            base_url: None,
        }
    }

    async fn tracker(budget: f64) -> CostTracker {
        let store = Arc::new(RouterStore::open_in_memory().await.unwrap());
        CostTracker::new(
            store,
            BudgetSettings {
                daily_budget_usd: budget,
                near_threshold: 0.90,
            },
        )
    }

    // -- Recording & aggregation --

    #[tokio::test]
    async fn record_computes_cost_from_rates() {
        let tracker = tracker(100.0).await;
        let request = ModelRequest::new("hi", "implementer");
        // 1000 tokens each way at $0.01/1k both directions = $0.02.
        let (cost, _) = tracker
            .record_cost(&model("m1", 0.01), &request, TokenUsage::new(1000, 1000))
            .await;
        assert!((cost - 0.02).abs() < 1e-9);

        let today = tracker.daily_cost(Utc::now().date_naive()).await.unwrap();
        assert!((today - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn aggregates_by_model_and_agent() {
        let tracker = tracker(100.0).await;
        let req_a = ModelRequest::new("a", "implementer");
        let req_b = ModelRequest::new("b", "reviewer");
        tracker
            .record_cost(&model("m1", 0.01), &req_a, TokenUsage::new(1000, 0))
            .await;
        tracker
            .record_cost(&model("m1", 0.01), &req_b, TokenUsage::new(1000, 0))
            .await;
        tracker
            .record_cost(&model("m2", 0.02), &req_a, TokenUsage::new(1000, 0))
            .await;

        let by_model = tracker.cost_by_model(RecordFilter::default()).await.unwrap();
        assert!((by_model["m1"] - 0.02).abs() < 1e-9);
        assert!((by_model["m2"] - 0.02).abs() < 1e-9);

        let by_agent = tracker
            .cost_by_agent_type(RecordFilter::default())
            .await
            .unwrap();
        assert!((by_agent["implementer"] - 0.03).abs() < 1e-9);
        assert!((by_agent["reviewer"] - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn summary_totals() {
        let tracker = tracker(100.0).await;
        let request = ModelRequest::new("a", "implementer");
        for _ in 0..4 {
            tracker
                .record_cost(&model("m1", 0.01), &request, TokenUsage::new(500, 250))
                .await;
        }
        let summary = tracker.cost_summary(RecordFilter::default()).await.unwrap();
        assert_eq!(summary.total_requests, 4);
        assert_eq!(summary.total_input_tokens, 2000);
        assert_eq!(summary.total_output_tokens, 1000);
        assert!((summary.avg_cost_per_request - 0.0075).abs() < 1e-9);
    }

    // -- Budget thresholds --

    #[tokio::test]
    async fn budget_statuses() {
        // $1 budget; $0.50 spend is Under, $0.95 Near, $1.50 Over.
        let tracker = tracker(1.0).await;
        let request = ModelRequest::new("a", "t");

        tracker
            .record_cost(&model("m1", 0.25), &request, TokenUsage::new(1000, 1000))
            .await; // $0.50
        assert_eq!(tracker.check_budget().await, BudgetStatus::Under);

        tracker
            .record_cost(&model("m1", 0.225), &request, TokenUsage::new(1000, 1000))
            .await; // +$0.45 = $0.95
        assert_eq!(tracker.check_budget().await, BudgetStatus::Near);

        tracker
            .record_cost(&model("m1", 0.30), &request, TokenUsage::new(1000, 1000))
            .await; // +$0.60 = $1.55
        assert_eq!(tracker.check_budget().await, BudgetStatus::Over);
    }

    #[tokio::test]
    async fn alert_fires_once_per_crossing() {
        let tracker = tracker(1.0).await;
        let request = ModelRequest::new("a", "t");

        // Cross into Near: one alert.
        let (_, alert) = tracker
            .record_cost(&model("m1", 0.475), &request, TokenUsage::new(1000, 1000))
            .await; // $0.95
        let alert = alert.unwrap();
        assert_eq!(alert.status, BudgetStatus::Near);
        assert!((alert.utilization - 0.95).abs() < 1e-6);

        // Still Near: silent.
        let (_, alert) = tracker
            .record_cost(&model("m1", 0.005), &request, TokenUsage::new(1000, 1000))
            .await; // $0.96
        assert!(alert.is_none());

        // Cross into Over: one alert.
        let (_, alert) = tracker
            .record_cost(&model("m1", 0.05), &request, TokenUsage::new(1000, 1000))
            .await; // $1.06
        assert_eq!(alert.unwrap().status, BudgetStatus::Over);

        // Still Over: silent, even across many requests.
        for _ in 0..5 {
            let (_, alert) = tracker
                .record_cost(&model("m1", 0.01), &request, TokenUsage::new(1000, 1000))
                .await;
            assert!(alert.is_none());
        }
    }

    #[tokio::test]
    async fn zero_budget_never_alerts() {
        let tracker = tracker(0.0).await;
        let request = ModelRequest::new("a", "t");
        let (_, alert) = tracker
            .record_cost(&model("m1", 1.0), &request, TokenUsage::new(1000, 1000))
            .await;
        assert!(alert.is_none());
        assert_eq!(tracker.check_budget().await, BudgetStatus::Under);
    }

    // -- Store outage buffering --

    #[tokio::test]
    async fn buffered_records_count_toward_daily_cost() {
        let tracker = tracker(100.0).await;
        let request = ModelRequest::new("a", "t");

        // Simulate an outage: every record lands in the buffer.
        tracker.store_healthy.store(false, Ordering::Relaxed);
        tracker
            .record_cost(&model("m1", 0.01), &request, TokenUsage::new(1000, 1000))
            .await;
        let today = tracker.daily_cost(Utc::now().date_naive()).await.unwrap();
        assert!((today - 0.02).abs() < 1e-9);

        // Recovery replays the buffer into the store.
        tracker.retry_store();
        tracker
            .record_cost(&model("m1", 0.01), &request, TokenUsage::new(1000, 1000))
            .await;
        assert!(tracker.buffer.lock().await.is_empty());
        let by_model = tracker.cost_by_model(RecordFilter::default()).await.unwrap();
        assert!((by_model["m1"] - 0.04).abs() < 1e-9);
    }
}
