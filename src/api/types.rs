//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::ledger::Transaction;
use crate::reward::Level;
use crate::store::UserProfile;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether the store survives a restart.
    pub persistent: bool,
}

/// Error body for every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable code, e.g. `insufficient_funds`.
    pub error: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterUserRequest {
    pub level: Level,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepositRequest {
    /// Minor units.
    pub amount: i64,
    /// Payment reference; replays are no-ops.
    pub reference: String,
}

/// Account overview.
#[derive(Debug, Clone, Serialize)]
pub struct AccountResponse {
    pub user: UserProfile,
    pub balance: i64,
    pub transactions: Vec<Transaction>,
}

/// Query for `GET /api/tasks/eligible`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EligibleQuery {
    pub task_type: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    pub proof_ref: Option<String>,
}

/// Body of reject and cancel.
#[derive(Debug, Clone, Deserialize)]
pub struct ReasonRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppealRequest {
    pub note: Option<String>,
}
