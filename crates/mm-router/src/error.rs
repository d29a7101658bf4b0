//! Crate-level error taxonomy.
//!
//! Terminal errors carry the originating request id and the list of models
//! attempted, so a caller can log one line and know the whole story.
//! Intermediate retries and failovers are recorded as events, never surfaced.

use uuid::Uuid;

// ---------------------------------------------------------------------------
// Attempt bookkeeping
// ---------------------------------------------------------------------------

/// One failed dispatch attempt, kept for the aggregate error report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttemptFailure {
    pub model_id: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// RouterError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Provider-side rate limiting surfaced mid-request.
    #[error("model `{model_id}` is rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited {
        model_id: String,
        retry_after_secs: Option<u64>,
    },

    /// Client-side defect: auth failure, malformed request, unsupported
    /// capability. Never retried or failed over.
    #[error("permanent error for request {request_id} on `{model_id}`: {message}")]
    Permanent {
        request_id: Uuid,
        model_id: String,
        status: Option<u16>,
        message: String,
    },

    /// Every candidate model was tried and failed.
    #[error("all {count} candidate models failed for request {request_id}", count = attempts.len())]
    Exhausted {
        request_id: Uuid,
        attempts: Vec<AttemptFailure>,
    },

    /// The request's deadline passed before an attempt could begin.
    #[error("deadline exceeded for request {request_id} after {count} attempts", count = attempts.len())]
    DeadlineExceeded {
        request_id: Uuid,
        attempts: Vec<AttemptFailure>,
    },

    /// Filtering left no candidate satisfying the required capabilities.
    #[error("no available model for request {request_id} (required: {required:?})")]
    NoAvailableModel {
        request_id: Uuid,
        required: Vec<String>,
    },

    #[error("no credentials configured for provider `{provider}`")]
    NoCredentials { provider: String },

    #[error("unknown model `{model_id}`")]
    UnknownModel { model_id: String },

    #[error(transparent)]
    Config(#[from] mm_core::ConfigError),

    /// Store trouble. Never returned on the request path — components degrade
    /// to memory-only operation instead — but query interfaces surface it.
    #[error(transparent)]
    Store(#[from] mm_core::StoreError),
}

impl RouterError {
    /// Machine-readable error kind for logs and callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Permanent { .. } => "permanent",
            Self::Exhausted { .. } => "exhausted",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::NoAvailableModel { .. } => "no_available_model",
            Self::NoCredentials { .. } => "no_credentials",
            Self::UnknownModel { .. } => "unknown_model",
            Self::Config(_) => "config",
            Self::Store(_) => "store",
        }
    }

    /// Models attempted before this error, when the variant tracks them.
    pub fn attempts(&self) -> &[AttemptFailure] {
        match self {
            Self::Exhausted { attempts, .. } | Self::DeadlineExceeded { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
