//! Core Task type with escrow accounting.
//!
//! # Invariants
//! - `0 <= completed_count <= target_count`
//! - while ACTIVE or PAUSED, `escrowed_amount == reward * (target_count - completed_count)`
//! - COMPLETED, CANCELLED and EXPIRED are terminal

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::verification::VerificationMode;
use crate::ledger::UserId;
use crate::reward::{remaining_escrow, Level};

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
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

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What the executor is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Subscribe,
    Join,
    View,
    React,
    Visit,
    Custom,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Subscribe => "subscribe",
            TaskType::Join => "join",
            TaskType::View => "view",
            TaskType::React => "react",
            TaskType::Visit => "visit",
            TaskType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscribe" => Some(TaskType::Subscribe),
            "join" => Some(TaskType::Join),
            "view" => Some(TaskType::View),
            "react" => Some(TaskType::React),
            "visit" => Some(TaskType::Visit),
            "custom" => Some(TaskType::Custom),
            _ => None,
        }
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Active <-> Paused
///   |  \        |
///   |   \-> Cancelled
///   |-> Completed
///   \-> Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
    Expired,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Expired
        )
    }

    /// Whether pending executions of the task may still be approved.
    pub fn accepts_approvals(self) -> bool {
        matches!(self, TaskStatus::Active | TaskStatus::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TaskStatus::Active),
            "paused" => Some(TaskStatus::Paused),
            "completed" => Some(TaskStatus::Completed),
            "cancelled" => Some(TaskStatus::Cancelled),
            "expired" => Some(TaskStatus::Expired),
            _ => None,
        }
    }
}

/// Why and how a task was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationRecord {
    pub reason: String,
    /// Amount credited back to the creator.
    pub refund_amount: i64,
    /// Amount kept by the platform.
    pub forfeited_amount: i64,
    pub cancelled_at: DateTime<Utc>,
}

/// Creator input for a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_type: TaskType,
    pub title: String,
    /// Link or handle the executor acts on.
    #[serde(default)]
    pub target_ref: String,
    /// Per-completion reward, minor units.
    pub reward: i64,
    pub target_count: u32,
    #[serde(default)]
    pub min_executor_level: Level,
    pub verification_mode: VerificationMode,
    /// Seconds before an unmoderated submission is approved; config default if unset.
    #[serde(default)]
    pub auto_approve_secs: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub boosted: bool,
    #[serde(default)]
    pub priority: i32,
}

/// A funded, repeatable task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub creator_id: UserId,
    pub task_type: TaskType,
    pub title: String,
    pub target_ref: String,
    pub reward: i64,
    pub target_count: u32,
    pub completed_count: u32,
    pub status: TaskStatus,
    pub min_executor_level: Level,
    pub verification_mode: VerificationMode,
    pub auto_approve_secs: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub escrowed_amount: i64,
    /// Commission charged at creation.
    pub commission: i64,
    pub boosted: bool,
    pub priority: i32,
    /// Incremented on every write; writes compare-and-swap on it.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancellation: Option<CancellationRecord>,
}

impl Task {
    pub fn auto_approve_window(&self) -> Duration {
        Duration::seconds(self.auto_approve_secs)
    }

    pub fn is_full(&self) -> bool {
        self.completed_count >= self.target_count
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Escrow the task should hold given its counters.
    pub fn expected_escrow(&self) -> i64 {
        remaining_escrow(self.reward, self.target_count, self.completed_count)
    }

    /// Check the counter and escrow invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.completed_count > self.target_count {
            return Err(format!(
                "task {} completed {} of {}",
                self.id, self.completed_count, self.target_count
            ));
        }
        let expected = if self.status.accepts_approvals() {
            self.expected_escrow()
        } else {
            0
        };
        if self.escrowed_amount != expected {
            return Err(format!(
                "task {} escrow {} != expected {} in status {}",
                self.id,
                self.escrowed_amount,
                expected,
                self.status.as_str()
            ));
        }
        Ok(())
    }

    /// Stamp a write: bump the version and `updated_at`.
    ///
    /// Returns the version the stored row must still have.
    pub fn touch(&mut self, now: DateTime<Utc>) -> u64 {
        let expected = self.version;
        self.version += 1;
        self.updated_at = now;
        expected
    }
}
