//! Async SQLite-backed store for everything that must survive restart:
//! cost records, performance records, cached responses, health-check history,
//! rate-limit events, and failover events.
//!
//! The store is an observability and durability sink, never a hot-path
//! dependency: callers buffer or bypass it when it fails (see `mm-router`).

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::{
    CostRecord, FailoverEvent, HealthCheckResult, ModelResponse, PerformanceRecord, RateLimitEvent,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// helpers — enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

// ---------------------------------------------------------------------------
// Query filter
// ---------------------------------------------------------------------------

/// Time-range and dimension filter shared by the record queries.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub model_id: Option<String>,
    pub provider: Option<String>,
    pub agent_type: Option<String>,
}

impl RecordFilter {
    pub fn since(mut self, ts: DateTime<Utc>) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: DateTime<Utc>) -> Self {
        self.until = Some(ts);
        self
    }

    pub fn model(mut self, id: impl Into<String>) -> Self {
        self.model_id = Some(id.into());
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }
}

/// A cached response row as persisted, used to warm the in-memory cache on
/// startup.
#[derive(Debug, Clone)]
pub struct StoredCacheEntry {
    pub cache_key: String,
    pub model_id: String,
    pub response: ModelResponse,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// RouterStore
// ---------------------------------------------------------------------------

/// Async SQLite store, one connection, WAL mode.
pub struct RouterStore {
    conn: Connection,
}

impl RouterStore {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS cost_records (
                        id            INTEGER PRIMARY KEY AUTOINCREMENT,
                        timestamp     TEXT NOT NULL,
                        model_id      TEXT NOT NULL,
                        provider      TEXT NOT NULL,
                        agent_type    TEXT NOT NULL,
                        task_id       TEXT NOT NULL,
                        input_tokens  INTEGER NOT NULL,
                        output_tokens INTEGER NOT NULL,
                        cost_usd      REAL NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_cost_ts    ON cost_records(timestamp);
                    CREATE INDEX IF NOT EXISTS idx_cost_model ON cost_records(model_id);

                    CREATE TABLE IF NOT EXISTS performance_records (
                        id         INTEGER PRIMARY KEY AUTOINCREMENT,
                        timestamp  TEXT NOT NULL,
                        model_id   TEXT NOT NULL,
                        agent_type TEXT NOT NULL,
                        latency_ms INTEGER NOT NULL,
                        success    INTEGER NOT NULL,
                        quality    REAL
                    );
                    CREATE INDEX IF NOT EXISTS idx_perf_model ON performance_records(model_id, timestamp);

                    CREATE TABLE IF NOT EXISTS cached_responses (
                        cache_key   TEXT PRIMARY KEY,
                        model_id    TEXT NOT NULL,
                        response    TEXT NOT NULL,
                        cached_at   TEXT NOT NULL,
                        expires_at  TEXT NOT NULL,
                        last_access TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_cache_expiry ON cached_responses(expires_at);

                    CREATE TABLE IF NOT EXISTS health_checks (
                        id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                        timestamp            TEXT NOT NULL,
                        model_id             TEXT NOT NULL,
                        state                TEXT NOT NULL,
                        consecutive_failures INTEGER NOT NULL,
                        response_time_ms     INTEGER,
                        error                TEXT,
                        next_check_due       TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_health_model ON health_checks(model_id, timestamp);

                    CREATE TABLE IF NOT EXISTS rate_limit_events (
                        id        INTEGER PRIMARY KEY AUTOINCREMENT,
                        timestamp TEXT NOT NULL,
                        model_id  TEXT NOT NULL,
                        status    TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_rate_model ON rate_limit_events(model_id, timestamp);

                    CREATE TABLE IF NOT EXISTS failover_events (
                        id         INTEGER PRIMARY KEY AUTOINCREMENT,
                        timestamp  TEXT NOT NULL,
                        from_model TEXT NOT NULL,
                        to_model   TEXT NOT NULL,
                        reason     TEXT NOT NULL,
                        task_id    TEXT NOT NULL,
                        attempt    INTEGER NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_failover_model ON failover_events(from_model, timestamp);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cost records
    // -----------------------------------------------------------------------

    pub async fn insert_cost_record(&self, record: &CostRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cost_records
                        (timestamp, model_id, provider, agent_type, task_id,
                         input_tokens, output_tokens, cost_usd)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    rusqlite::params![
                        record.timestamp.to_rfc3339(),
                        record.model_id,
                        record.provider,
                        record.agent_type,
                        record.task_id.to_string(),
                        record.input_tokens as i64,
                        record.output_tokens as i64,
                        record.cost_usd,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Total spend for one UTC day.
    pub async fn daily_cost(&self, date: NaiveDate) -> Result<f64, StoreError> {
        let start = date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc()
            .to_rfc3339();
        let end = (date + chrono::Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc()
            .to_rfc3339();
        let total = self
            .conn
            .call(move |conn| {
                let total: f64 = conn.query_row(
                    "SELECT COALESCE(SUM(cost_usd), 0.0) FROM cost_records
                     WHERE timestamp >= ?1 AND timestamp < ?2",
                    rusqlite::params![start, end],
                    |r| r.get(0),
                )?;
                Ok(total)
            })
            .await?;
        Ok(total)
    }

    /// Cost records matching the filter, oldest first.
    pub async fn query_cost_records(
        &self,
        filter: RecordFilter,
    ) -> Result<Vec<CostRecord>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut sql = String::from(
                    "SELECT timestamp, model_id, provider, agent_type, task_id,
                            input_tokens, output_tokens, cost_usd
                     FROM cost_records WHERE 1=1",
                );
                let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
                if let Some(since) = &filter.since {
                    sql.push_str(" AND timestamp >= ?");
                    params.push(Box::new(since.to_rfc3339()));
                }
                if let Some(until) = &filter.until {
                    sql.push_str(" AND timestamp < ?");
                    params.push(Box::new(until.to_rfc3339()));
                }
                if let Some(model) = &filter.model_id {
                    sql.push_str(" AND model_id = ?");
                    params.push(Box::new(model.clone()));
                }
                if let Some(provider) = &filter.provider {
                    sql.push_str(" AND provider = ?");
                    params.push(Box::new(provider.clone()));
                }
                if let Some(agent) = &filter.agent_type {
                    sql.push_str(" AND agent_type = ?");
                    params.push(Box::new(agent.clone()));
                }
                sql.push_str(" ORDER BY timestamp ASC");

                let mut stmt = conn.prepare(&sql)?;
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                let mut rows = stmt.query(param_refs.as_slice())?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_cost_record(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Performance records
    // -----------------------------------------------------------------------

    pub async fn insert_performance_record(
        &self,
        record: &PerformanceRecord,
    ) -> Result<(), StoreError> {
        let record = record.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO performance_records
                        (timestamp, model_id, agent_type, latency_ms, success, quality)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![
                        record.timestamp.to_rfc3339(),
                        record.model_id,
                        record.agent_type,
                        record.latency_ms as i64,
                        record.success as i64,
                        record.quality,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn query_performance_records(
        &self,
        filter: RecordFilter,
    ) -> Result<Vec<PerformanceRecord>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut sql = String::from(
                    "SELECT timestamp, model_id, agent_type, latency_ms, success, quality
                     FROM performance_records WHERE 1=1",
                );
                let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
                if let Some(since) = &filter.since {
                    sql.push_str(" AND timestamp >= ?");
                    params.push(Box::new(since.to_rfc3339()));
                }
                if let Some(until) = &filter.until {
                    sql.push_str(" AND timestamp < ?");
                    params.push(Box::new(until.to_rfc3339()));
                }
                if let Some(model) = &filter.model_id {
                    sql.push_str(" AND model_id = ?");
                    params.push(Box::new(model.clone()));
                }
                if let Some(agent) = &filter.agent_type {
                    sql.push_str(" AND agent_type = ?");
                    params.push(Box::new(agent.clone()));
                }
                sql.push_str(" ORDER BY timestamp ASC");

                let mut stmt = conn.prepare(&sql)?;
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                let mut rows = stmt.query(param_refs.as_slice())?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_performance_record(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Cached responses
    // -----------------------------------------------------------------------

    pub async fn upsert_cached_response(&self, entry: &StoredCacheEntry) -> Result<(), StoreError> {
        let response_json = serde_json::to_string(&entry.response)?;
        let entry = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cached_responses
                        (cache_key, model_id, response, cached_at, expires_at, last_access)
                     VALUES (?1,?2,?3,?4,?5,?6)
                     ON CONFLICT(cache_key) DO UPDATE SET
                        model_id=excluded.model_id, response=excluded.response,
                        cached_at=excluded.cached_at, expires_at=excluded.expires_at,
                        last_access=excluded.last_access",
                    rusqlite::params![
                        entry.cache_key,
                        entry.model_id,
                        response_json,
                        entry.cached_at.to_rfc3339(),
                        entry.expires_at.to_rfc3339(),
                        entry.last_access.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn delete_cached_response(&self, cache_key: &str) -> Result<(), StoreError> {
        let key = cache_key.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM cached_responses WHERE cache_key = ?1",
                    rusqlite::params![key],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// All non-expired entries, for warming the in-memory cache at startup.
    pub async fn load_cache_entries(&self) -> Result<Vec<StoredCacheEntry>, StoreError> {
        let now = Utc::now().to_rfc3339();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT cache_key, model_id, response, cached_at, expires_at, last_access
                     FROM cached_responses WHERE expires_at > ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![now])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let response_json: String = row.get(2)?;
                    let cached_at: String = row.get(3)?;
                    let expires_at: String = row.get(4)?;
                    let last_access: String = row.get(5)?;
                    out.push(StoredCacheEntry {
                        cache_key: row.get(0)?,
                        model_id: row.get(1)?,
                        response: serde_json::from_str(&response_json).expect("valid json"),
                        cached_at: parse_ts(&cached_at),
                        expires_at: parse_ts(&expires_at),
                        last_access: parse_ts(&last_access),
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    /// Drop expired rows. Returns the number deleted.
    pub async fn delete_expired_cache(&self) -> Result<usize, StoreError> {
        let now = Utc::now().to_rfc3339();
        let deleted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM cached_responses WHERE expires_at <= ?1",
                    rusqlite::params![now],
                )?;
                Ok(n)
            })
            .await?;
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Health / rate-limit / failover events
    // -----------------------------------------------------------------------

    pub async fn insert_health_check(&self, result: &HealthCheckResult) -> Result<(), StoreError> {
        let result = result.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO health_checks
                        (timestamp, model_id, state, consecutive_failures,
                         response_time_ms, error, next_check_due)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![
                        result.timestamp.to_rfc3339(),
                        result.model_id,
                        enum_to_sql(&result.state),
                        result.consecutive_failures,
                        result.response_time_ms.map(|v| v as i64),
                        result.error,
                        result.next_check_due.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn insert_rate_limit_event(&self, event: &RateLimitEvent) -> Result<(), StoreError> {
        let event = event.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO rate_limit_events (timestamp, model_id, status)
                     VALUES (?1,?2,?3)",
                    rusqlite::params![
                        event.timestamp.to_rfc3339(),
                        event.model_id,
                        enum_to_sql(&event.status),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Rate-limit events for one model since the given time, newest first.
    pub async fn rate_limit_events(
        &self,
        model_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RateLimitEvent>, StoreError> {
        let model = model_id.to_string();
        let since = since.to_rfc3339();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT timestamp, model_id, status FROM rate_limit_events
                     WHERE model_id = ?1 AND timestamp >= ?2
                     ORDER BY timestamp DESC",
                )?;
                let mut rows = stmt.query(rusqlite::params![model, since])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let ts: String = row.get(0)?;
                    let status: String = row.get(2)?;
                    out.push(RateLimitEvent {
                        timestamp: parse_ts(&ts),
                        model_id: row.get(1)?,
                        status: enum_from_sql(&status),
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    pub async fn insert_failover_event(&self, event: &FailoverEvent) -> Result<(), StoreError> {
        let event = event.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO failover_events
                        (timestamp, from_model, to_model, reason, task_id, attempt)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![
                        event.timestamp.to_rfc3339(),
                        event.from_model,
                        event.to_model,
                        enum_to_sql(&event.reason),
                        event.task_id.to_string(),
                        event.attempt,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Failover events originating from `model_id` since the given time.
    pub async fn failover_count_since(
        &self,
        model_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let model = model_id.to_string();
        let since = since.to_rfc3339();
        let count = self
            .conn
            .call(move |conn| {
                let n: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM failover_events
                     WHERE from_model = ?1 AND timestamp >= ?2",
                    rusqlite::params![model, since],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await?;
        Ok(count)
    }

    /// Most recent failover events, optionally for one originating model.
    pub async fn failover_history(
        &self,
        model_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<FailoverEvent>, StoreError> {
        let model = model_id.map(str::to_string);
        let since = since.to_rfc3339();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = match &model {
                    Some(_) => conn.prepare(
                        "SELECT timestamp, from_model, to_model, reason, task_id, attempt
                         FROM failover_events
                         WHERE from_model = ?1 AND timestamp >= ?2
                         ORDER BY timestamp DESC",
                    )?,
                    None => conn.prepare(
                        "SELECT timestamp, from_model, to_model, reason, task_id, attempt
                         FROM failover_events
                         WHERE timestamp >= ?1
                         ORDER BY timestamp DESC",
                    )?,
                };
                let mut rows = match &model {
                    Some(m) => stmt.query(rusqlite::params![m, since])?,
                    None => stmt.query(rusqlite::params![since])?,
                };
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let ts: String = row.get(0)?;
                    let reason: String = row.get(3)?;
                    let task_id: String = row.get(4)?;
                    out.push(FailoverEvent {
                        timestamp: parse_ts(&ts),
                        from_model: row.get(1)?,
                        to_model: row.get(2)?,
                        reason: enum_from_sql(&reason),
                        task_id: Uuid::parse_str(&task_id).expect("valid uuid"),
                        attempt: row.get(5)?,
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Delete event rows older than the cutoff across every append-only table.
    /// Returns the total rows removed.
    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = cutoff.to_rfc3339();
        let removed = self
            .conn
            .call(move |conn| {
                let mut total = 0usize;
                for table in [
                    "cost_records",
                    "performance_records",
                    "health_checks",
                    "rate_limit_events",
                    "failover_events",
                ] {
                    total += conn.execute(
                        &format!("DELETE FROM {table} WHERE timestamp < ?1"),
                        rusqlite::params![cutoff],
                    )?;
                }
                Ok(total)
            })
            .await?;
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_cost_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CostRecord> {
    let ts: String = row.get(0)?;
    let task_id: String = row.get(4)?;
    let input_tokens: i64 = row.get(5)?;
    let output_tokens: i64 = row.get(6)?;
    Ok(CostRecord {
        timestamp: parse_ts(&ts),
        model_id: row.get(1)?,
        provider: row.get(2)?,
        agent_type: row.get(3)?,
        task_id: Uuid::parse_str(&task_id).expect("valid uuid"),
        input_tokens: input_tokens as u64,
        output_tokens: output_tokens as u64,
        cost_usd: row.get(7)?,
    })
}

fn row_to_performance_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PerformanceRecord> {
    let ts: String = row.get(0)?;
    let latency: i64 = row.get(3)?;
    let success: i64 = row.get(4)?;
    Ok(PerformanceRecord {
        timestamp: parse_ts(&ts),
        model_id: row.get(1)?,
        agent_type: row.get(2)?,
        latency_ms: latency as u64,
        success: success != 0,
        quality: row.get(5)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
