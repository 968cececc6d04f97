//! Reward and commission calculation from user levels.
//!
//! This module is the single source of truth for every amount the ledger
//! moves. It is pure: no IO, no clocks, no shared state.
//!
//! # Units
//! - Amounts are integer minor currency units (cents).
//! - Rates and multipliers are basis points (1 bp = 0.01%), so `10_000` is 1.0.
//! - Intermediate products are computed in `i128` so that no product of two
//!   valid amounts can overflow before the final range check.

use serde::{Deserialize, Serialize};

/// Basis points in 1.0.
pub const BPS_SCALE: i64 = 10_000;

/// User tier. Determines the creator's commission and the executor's multiplier.
///
/// Ordering follows rank: `Bronze < Silver < Gold < Premium`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    #[default]
    Bronze,
    Silver,
    Gold,
    Premium,
}

impl Level {
    pub const ALL: [Level; 4] = [Level::Bronze, Level::Silver, Level::Gold, Level::Premium];

    /// Numeric rank, used for `min_executor_level <= level` comparisons in storage.
    pub fn rank(self) -> i64 {
        match self {
            Level::Bronze => 0,
            Level::Silver => 1,
            Level::Gold => 2,
            Level::Premium => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Level::Bronze),
            1 => Some(Level::Silver),
            2 => Some(Level::Gold),
            3 => Some(Level::Premium),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Bronze => "bronze",
            Level::Silver => "silver",
            Level::Gold => "gold",
            Level::Premium => "premium",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "bronze" => Some(Level::Bronze),
            "silver" => Some(Level::Silver),
            "gold" => Some(Level::Gold),
            "premium" => Some(Level::Premium),
            _ => None,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reward multiplier applied to an executor's base reward.
pub fn level_multiplier_bps(level: Level) -> i64 {
    match level {
        Level::Bronze => 10_000,
        Level::Silver => 12_000,
        Level::Gold => 13_500,
        Level::Premium => 15_000,
    }
}

/// Platform commission charged to a creator on top of the task budget.
pub fn commission_rate_bps(level: Level) -> i64 {
    match level {
        Level::Bronze => 700,
        Level::Silver => 600,
        Level::Gold => 500,
        Level::Premium => 300,
    }
}

/// Errors from amount arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RewardError {
    #[error("amount must be positive, got {0}")]
    NonPositive(i64),

    #[error("amount overflow computing {0}")]
    Overflow(&'static str),
}

/// Breakdown of what a creator pays for a task.
///
/// # Invariants
/// - `budget == reward * target_count`
/// - `total == budget + commission`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCost {
    /// Escrowed amount, paid out to executors.
    pub budget: i64,
    /// Platform fee, rounded up to the next minor unit.
    pub commission: i64,
    /// Amount reserved from the creator's balance.
    pub total: i64,
}

/// Result of a cancellation refund split.
///
/// # Invariants
/// - `refund + forfeited == remaining`
/// - `refund <= remaining`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundSplit {
    pub refund: i64,
    pub forfeited: i64,
}

fn narrow(value: i128, what: &'static str) -> Result<i64, RewardError> {
    i64::try_from(value).map_err(|_| RewardError::Overflow(what))
}

/// Final executor reward: `floor(base * multiplier(level))`.
pub fn apply_multiplier(base: i64, level: Level) -> Result<i64, RewardError> {
    if base <= 0 {
        return Err(RewardError::NonPositive(base));
    }
    let product = base as i128 * level_multiplier_bps(level) as i128;
    narrow(product / BPS_SCALE as i128, "level multiplier")
}

/// Cost of a task for a creator at `creator_level`.
///
/// `total = reward * target_count * (1 + commission_rate)`, with the
/// commission rounded up.
pub fn task_cost(reward: i64, target_count: u32, creator_level: Level) -> Result<TaskCost, RewardError> {
    if reward <= 0 {
        return Err(RewardError::NonPositive(reward));
    }
    if target_count == 0 {
        return Err(RewardError::NonPositive(0));
    }
    let budget = reward as i128 * target_count as i128;
    let scale = BPS_SCALE as i128;
    let commission = (budget * commission_rate_bps(creator_level) as i128 + scale - 1) / scale;

    Ok(TaskCost {
        budget: narrow(budget, "task budget")?,
        commission: narrow(commission, "task commission")?,
        total: narrow(budget + commission, "task cost")?,
    })
}

/// Escrow still held for a task: `reward * (target_count - completed_count)`.
pub fn remaining_escrow(reward: i64, target_count: u32, completed_count: u32) -> i64 {
    let left = target_count.saturating_sub(completed_count) as i64;
    reward.saturating_mul(left)
}

/// Split remaining escrow into the creator refund and the forfeited penalty.
///
/// `refund = floor(remaining * (1 - penalty))`.
pub fn cancellation_refund(remaining: i64, penalty_bps: i64) -> Result<RefundSplit, RewardError> {
    if remaining < 0 {
        return Err(RewardError::NonPositive(remaining));
    }
    let penalty_bps = penalty_bps.clamp(0, BPS_SCALE);
    let refund = remaining as i128 * (BPS_SCALE - penalty_bps) as i128 / BPS_SCALE as i128;
    let refund = narrow(refund, "cancellation refund")?;
    Ok(RefundSplit {
        refund,
        forfeited: remaining - refund,
    })
}
