//! Execution records: one executor's claimed completion of a task.
//!
//! # State Machine
//! ```text
//! Pending -> Approved
//!        \-> Rejected
//! ```
//! Both outcomes are terminal. An appeal never reopens a rejected record; it
//! creates a new Pending execution with `appeal_of` pointing at it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::TaskId;
use crate::ledger::UserId;
use crate::reward::Level;

/// Unique identifier for an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Approved,
    Rejected,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Approved => "approved",
            ExecutionStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "approved" => Some(ExecutionStatus::Approved),
            "rejected" => Some(ExecutionStatus::Rejected),
            _ => None,
        }
    }
}

/// Who acts on an execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// A regular user; may only moderate tasks they created.
    User(UserId),
    /// Platform moderator; may moderate any task.
    Moderator(UserId),
    /// Verifier or timeout sweep.
    System,
}

impl Actor {
    /// Stored in `verifier_id`.
    pub fn label(&self) -> String {
        match self {
            Actor::User(id) => format!("user:{}", id),
            Actor::Moderator(id) => format!("moderator:{}", id),
            Actor::System => "system".to_string(),
        }
    }

    pub fn may_moderate(&self, creator: &UserId) -> bool {
        match self {
            Actor::User(id) => id == creator,
            Actor::Moderator(_) | Actor::System => true,
        }
    }
}

/// Sweep lease on a pending execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub owner: String,
    pub until: DateTime<Utc>,
}

impl Claim {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.until > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub task_id: TaskId,
    pub executor_id: UserId,
    pub status: ExecutionStatus,
    /// Base task reward at submission.
    pub reward_snapshot: i64,
    /// Executor level at submission.
    pub level_snapshot: Level,
    /// Amount credited on approval.
    pub credited_amount: Option<i64>,
    pub submitted_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    /// Label of the approving or rejecting actor.
    pub verifier_id: Option<String>,
    pub proof_ref: Option<String>,
    pub rejection_reason: Option<String>,
    /// Set when a rejection can still be appealed.
    pub appeal_deadline: Option<DateTime<Utc>>,
    /// Due time for auto-approval; `None` means moderation only.
    pub auto_approve_at: Option<DateTime<Utc>>,
    /// The rejected execution this one appeals.
    pub appeal_of: Option<ExecutionId>,
    /// The single appeal has been used.
    pub appealed: bool,
    pub claim: Option<Claim>,
}

impl Execution {
    pub fn is_appeal(&self) -> bool {
        self.appeal_of.is_some()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ExecutionStatus::Pending
            && self.auto_approve_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Whether a live lease held by someone other than `worker` exists.
    pub fn claimed_by_other(&self, worker: &str, now: DateTime<Utc>) -> bool {
        self.claim
            .as_ref()
            .map(|claim| claim.is_live(now) && claim.owner != worker)
            .unwrap_or(false)
    }

    /// Terminal rejection. `appeal_deadline` of `None` forecloses appeal.
    pub fn mark_rejected(
        &mut self,
        actor: &Actor,
        reason: &str,
        now: DateTime<Utc>,
        appeal_deadline: Option<DateTime<Utc>>,
    ) {
        self.status = ExecutionStatus::Rejected;
        self.verified_at = Some(now);
        self.verifier_id = Some(actor.label());
        self.rejection_reason = Some(reason.to_string());
        self.appeal_deadline = appeal_deadline;
        self.claim = None;
    }

    pub fn mark_approved(&mut self, actor: &Actor, credited: i64, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Approved;
        self.verified_at = Some(now);
        self.verifier_id = Some(actor.label());
        self.credited_amount = Some(credited);
        self.claim = None;
    }
}
