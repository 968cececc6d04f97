//! Error taxonomy for marketplace operations.
//!
//! Distinguishes between errors the caller can act on (validation, funds,
//! quota, state) and internal failures (storage, invariant violations).

use chrono::{DateTime, Utc};

use crate::reward::RewardError;

/// Error from a marketplace operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarketError {
    /// Out-of-bounds or malformed input.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient funds on {account}: needs {needed}, has {available}")]
    InsufficientFunds {
        account: String,
        needed: i64,
        available: i64,
    },

    /// Daily task-creation limit for the creator's level.
    #[error("daily task limit of {limit} reached; resets at {resets_at}")]
    QuotaExceeded { limit: u32, resets_at: DateTime<Utc> },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Status mismatch, including lost races against cancellation.
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Terminal action retried on an already terminal record.
    #[error("already processed: {0}")]
    AlreadyProcessed(String),

    /// Verifier did not answer in time. Never surfaced by `submit`, which
    /// falls back to manual moderation.
    #[error("verifier timed out after {0} ms")]
    ExternalVerifierTimeout(u64),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Busy store or lost compare-and-swap. Retried once by the service.
    #[error("conflicting concurrent update: {0}")]
    Conflict(String),

    /// A sanity check inside a transaction failed; the transaction is rolled back.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl MarketError {
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidStateTransition(message.into())
    }

    /// Stable machine-readable code, used by the HTTP adapter.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::NotFound { .. } => "not_found",
            Self::InvalidStateTransition(_) => "invalid_state_transition",
            Self::AlreadyProcessed(_) => "already_processed",
            Self::ExternalVerifierTimeout(_) => "external_verifier_timeout",
            Self::Unauthorized(_) => "unauthorized",
            Self::Conflict(_) => "conflict",
            Self::Invariant(_) => "invariant_violation",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Whether retrying with fresh state may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<RewardError> for MarketError {
    fn from(err: RewardError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<rusqlite::Error> for MarketError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                Self::Conflict(err.to_string())
            }
            _ => Self::Storage(err.to_string()),
        }
    }
}
