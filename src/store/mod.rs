//! Market storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database shared by every service instance
//!
//! All invariant-bearing work runs through [`MarketStore::run_tx`]: a
//! synchronous closure over a [`UnitOfWork`] executed inside one store
//! transaction, committed on `Ok` and rolled back on `Err`.

mod memory;
mod sqlite;

pub use memory::InMemoryMarketStore;
pub use sqlite::SqliteMarketStore;

use std::any::Any;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::{Ledger, UserId};
use crate::market::MarketError;
use crate::reward::Level;
use crate::task::{Execution, ExecutionId, ExecutionStatus, Task, TaskId, TaskType};
use crate::util::to_millis;

/// Registered user. The ledger account doubles as the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub level: Level,
    pub created_at: DateTime<Utc>,
}

/// Position in the eligible-task listing.
///
/// Rows are ordered by `(boosted, priority, created_at, id)` descending; a
/// page continues strictly after the cursor's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub boosted: bool,
    pub priority: i32,
    /// Epoch milliseconds, the precision the durable store keeps.
    pub created_at: i64,
    pub id: Uuid,
}

impl PageCursor {
    pub fn after(task: &Task) -> Self {
        Self {
            boosted: task.boosted,
            priority: task.priority,
            created_at: to_millis(task.created_at),
            id: task.id.as_uuid(),
        }
    }

    /// Opaque URL-safe token.
    pub fn encode(&self) -> Result<String, MarketError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| MarketError::Invariant(format!("page cursor not serializable: {}", e)))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str) -> Result<Self, MarketError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| MarketError::validation("malformed page cursor"))?;
        serde_json::from_slice(&bytes).map_err(|_| MarketError::validation("malformed page cursor"))
    }

    /// Sort key of a task, compared descending.
    pub fn key_of(task: &Task) -> (bool, i32, i64, Uuid) {
        (
            task.boosted,
            task.priority,
            to_millis(task.created_at),
            task.id.as_uuid(),
        )
    }

    fn key(&self) -> (bool, i32, i64, Uuid) {
        (self.boosted, self.priority, self.created_at, self.id)
    }

    /// Whether `task` sorts strictly after this cursor.
    pub fn precedes(&self, task: &Task) -> bool {
        Self::key_of(task) < self.key()
    }
}

/// Filter for tasks an executor may take.
#[derive(Debug, Clone)]
pub struct EligibilityQuery {
    pub executor_id: UserId,
    pub level: Level,
    pub task_type: Option<TaskType>,
    pub now: DateTime<Utc>,
    pub after: Option<PageCursor>,
    pub limit: usize,
}

impl EligibilityQuery {
    /// Store-independent eligibility predicate, minus the open-execution check.
    pub fn admits(&self, task: &Task) -> bool {
        task.status == crate::task::TaskStatus::Active
            && task.min_executor_level <= self.level
            && task.creator_id != self.executor_id
            && !task.is_full()
            && !task.is_expired_at(self.now)
            && self.task_type.map(|t| t == task.task_type).unwrap_or(true)
            && self.after.map(|cursor| cursor.precedes(task)).unwrap_or(true)
    }
}

/// Aggregates for the money-conservation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub deposits: i64,
    /// Sum of all account balances, platform included.
    pub balances: i64,
    /// Sum of escrow held by tasks.
    pub escrow: i64,
}

impl LedgerTotals {
    pub fn is_conserved(&self) -> bool {
        self.deposits == self.balances + self.escrow
    }
}

/// Repository operations inside one store transaction.
///
/// Updates are compare-and-swap: `update_task` on the task version and
/// `update_execution` on the execution status. A lost swap fails with
/// `MarketError::Conflict`.
pub trait UnitOfWork: Ledger {
    fn user(&self, id: &UserId) -> Result<Option<UserProfile>, MarketError>;

    /// Insert or update a profile; opens a zero-balance account on insert.
    fn put_user(&mut self, user: &UserProfile) -> Result<(), MarketError>;

    fn task(&self, id: TaskId) -> Result<Option<Task>, MarketError>;

    fn insert_task(&mut self, task: &Task) -> Result<(), MarketError>;

    fn update_task(&mut self, task: &Task, expected_version: u64) -> Result<(), MarketError>;

    /// Tasks created by `creator` at or after `since`.
    fn count_tasks_created_since(
        &self,
        creator: &UserId,
        since: DateTime<Utc>,
    ) -> Result<u32, MarketError>;

    /// Page of eligible tasks in listing order, at most `query.limit` rows.
    fn eligible_tasks(&self, query: &EligibilityQuery) -> Result<Vec<Task>, MarketError>;

    /// Non-terminal tasks past `expires_at` with no pending executions.
    fn expirable_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>, MarketError>;

    fn execution(&self, id: ExecutionId) -> Result<Option<Execution>, MarketError>;

    fn insert_execution(&mut self, execution: &Execution) -> Result<(), MarketError>;

    fn update_execution(
        &mut self,
        execution: &Execution,
        expected_status: ExecutionStatus,
    ) -> Result<(), MarketError>;

    /// Executions of a task, oldest submission first.
    fn executions_for_task(
        &self,
        task_id: TaskId,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<Execution>, MarketError>;

    /// The executor's non-rejected execution of the task, if any.
    fn open_execution(
        &self,
        task_id: TaskId,
        executor: &UserId,
    ) -> Result<Option<Execution>, MarketError>;

    /// Lease overdue pending executions to `worker` until `until`.
    ///
    /// Only executions without a live lease held by another worker are taken.
    fn claim_overdue(
        &mut self,
        worker: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, MarketError>;

    /// Drop `worker`'s lease on an execution. No-op if someone else holds it.
    fn release_claim(&mut self, id: ExecutionId, worker: &str) -> Result<(), MarketError>;

    fn ledger_totals(&self) -> Result<LedgerTotals, MarketError>;
}

pub type TxOutput = Box<dyn Any + Send>;

pub type TxFn = Box<dyn FnOnce(&mut dyn UnitOfWork) -> Result<TxOutput, MarketError> + Send>;

/// Storage backend.
#[async_trait]
pub trait MarketStore: Send + Sync {
    fn is_persistent(&self) -> bool;

    /// Run `f` in one atomic transaction.
    async fn run_tx(&self, f: TxFn) -> Result<TxOutput, MarketError>;
}

/// Typed wrapper over [`MarketStore::run_tx`].
pub async fn transact<R, F>(store: &dyn MarketStore, f: F) -> Result<R, MarketError>
where
    R: Send + 'static,
    F: FnOnce(&mut dyn UnitOfWork) -> Result<R, MarketError> + Send + 'static,
{
    let output = store
        .run_tx(Box::new(move |uow: &mut dyn UnitOfWork| {
            f(uow).map(|value| Box::new(value) as TxOutput)
        }))
        .await?;
    output
        .downcast::<R>()
        .map(|value| *value)
        .map_err(|_| MarketError::Invariant("transaction result type mismatch".to_string()))
}

/// Store backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    Memory,
    #[default]
    Sqlite,
}

impl StoreType {
    /// Parse from environment variable value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "sqlite" | "db" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

/// Create a market store based on type and configuration.
pub async fn create_market_store(
    store_type: StoreType,
    data_dir: PathBuf,
) -> Result<Box<dyn MarketStore>, String> {
    match store_type {
        StoreType::Memory => Ok(Box::new(InMemoryMarketStore::new())),
        StoreType::Sqlite => {
            let store = SqliteMarketStore::new(data_dir).await?;
            Ok(Box::new(store))
        }
    }
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend must share, run against each one.

    use chrono::Duration;

    use super::*;
    use crate::ledger::PLATFORM_ACCOUNT;
    use crate::task::fixtures::sample_task;
    use crate::task::{Claim, ExecutionStatus};

    pub(crate) fn pending_execution(task: &Task, executor: &str, due: DateTime<Utc>) -> Execution {
        Execution {
            id: ExecutionId::new(),
            task_id: task.id,
            executor_id: UserId::new(executor),
            status: ExecutionStatus::Pending,
            reward_snapshot: task.reward,
            level_snapshot: Level::Bronze,
            credited_amount: None,
            submitted_at: Utc::now(),
            verified_at: None,
            verifier_id: None,
            proof_ref: None,
            rejection_reason: None,
            appeal_deadline: None,
            auto_approve_at: Some(due),
            appeal_of: None,
            appealed: false,
            claim: None,
        }
    }

    fn user(id: &str, level: Level) -> UserProfile {
        UserProfile {
            id: UserId::new(id),
            level,
            created_at: Utc::now(),
        }
    }

    pub(crate) async fn platform_account_exists(store: &dyn MarketStore) {
        let balance = transact(store, |uow| uow.account_balance(&UserId::platform()))
            .await
            .unwrap();
        assert_eq!(balance, Some(0), "{} account must be opened", PLATFORM_ACCOUNT);
    }

    pub(crate) async fn rollback_on_error(store: &dyn MarketStore) {
        transact(store, |uow| uow.put_user(&user("alice", Level::Silver)))
            .await
            .unwrap();

        let result: Result<(), MarketError> = transact(store, |uow| {
            uow.deposit(&UserId::new("alice"), 1000, "wire-1")?;
            Err(MarketError::Invariant("boom".to_string()))
        })
        .await;
        assert!(result.is_err());

        let audit = transact(store, |uow| uow.audit(&UserId::new("alice")))
            .await
            .unwrap();
        assert_eq!(audit.balance, 0);
        assert!(audit.is_consistent());
    }

    pub(crate) async fn ledger_replay_is_noop(store: &dyn MarketStore) {
        transact(store, |uow| uow.put_user(&user("bob", Level::Bronze)))
            .await
            .unwrap();
        let (first, second) = transact(store, |uow| {
            let bob = UserId::new("bob");
            let first = uow.deposit(&bob, 700, "wire-7")?;
            let second = uow.deposit(&bob, 700, "wire-7")?;
            Ok((first, second))
        })
        .await
        .unwrap();
        assert!(!first.is_replay());
        assert!(second.is_replay());
        assert_eq!(first.transaction().id, second.transaction().id);

        let (balance, history) = transact(store, |uow| {
            let bob = UserId::new("bob");
            Ok((uow.account_balance(&bob)?, uow.account_transactions(&bob)?))
        })
        .await
        .unwrap();
        assert_eq!(balance, Some(700));
        assert_eq!(history.len(), 1);
    }

    pub(crate) async fn task_version_is_compare_and_swap(store: &dyn MarketStore) {
        let mut task = sample_task();
        let id = task.id;
        let inserted = task.clone();
        transact(store, move |uow| uow.insert_task(&inserted))
            .await
            .unwrap();

        let expected = task.touch(Utc::now());
        let first = task.clone();
        transact(store, move |uow| uow.update_task(&first, expected))
            .await
            .unwrap();

        // Same expected version again: the row has moved on.
        let stale = task.clone();
        let err = transact(store, move |uow| uow.update_task(&stale, expected))
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Conflict(_)));

        let stored = transact(store, move |uow| uow.task(id)).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    pub(crate) async fn execution_status_is_compare_and_swap(store: &dyn MarketStore) {
        let task = sample_task();
        let mut execution = pending_execution(&task, "exec", Utc::now());
        let (t, e) = (task.clone(), execution.clone());
        transact(store, move |uow| {
            uow.insert_task(&t)?;
            uow.insert_execution(&e)
        })
        .await
        .unwrap();

        execution.mark_approved(&crate::task::Actor::System, 50, Utc::now());
        let approved = execution.clone();
        transact(store, move |uow| {
            uow.update_execution(&approved, ExecutionStatus::Pending)
        })
        .await
        .unwrap();

        let again = execution.clone();
        let err = transact(store, move |uow| {
            uow.update_execution(&again, ExecutionStatus::Pending)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, MarketError::Conflict(_)));
    }

    pub(crate) async fn one_open_execution_per_executor(store: &dyn MarketStore) {
        let task = sample_task();
        let first = pending_execution(&task, "exec", Utc::now());
        let second = pending_execution(&task, "exec", Utc::now());
        let (t, f) = (task.clone(), first.clone());
        transact(store, move |uow| {
            uow.insert_task(&t)?;
            uow.insert_execution(&f)
        })
        .await
        .unwrap();

        let err = transact(store, move |uow| uow.insert_execution(&second))
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::InvalidStateTransition(_)));

        let task_id = task.id;
        let open = transact(store, move |uow| {
            uow.open_execution(task_id, &UserId::new("exec"))
        })
        .await
        .unwrap();
        assert_eq!(open.map(|e| e.id), Some(first.id));
    }

    pub(crate) async fn claims_are_exclusive(store: &dyn MarketStore) {
        let task = sample_task();
        let now = Utc::now();
        let overdue = pending_execution(&task, "exec-a", now - Duration::seconds(5));
        let not_due = pending_execution(&task, "exec-b", now + Duration::hours(1));
        let (t, o, n) = (task.clone(), overdue.clone(), not_due.clone());
        transact(store, move |uow| {
            uow.insert_task(&t)?;
            uow.insert_execution(&o)?;
            uow.insert_execution(&n)
        })
        .await
        .unwrap();

        let until = now + Duration::seconds(60);
        let claimed = transact(store, move |uow| uow.claim_overdue("w1", now, until, 10))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, overdue.id);
        assert_eq!(
            claimed[0].claim.as_ref().map(|c| c.owner.as_str()),
            Some("w1")
        );

        let rival = transact(store, move |uow| uow.claim_overdue("w2", now, until, 10))
            .await
            .unwrap();
        assert!(rival.is_empty());

        // After the lease lapses another worker may take it.
        let later = until + Duration::seconds(1);
        let taken = transact(store, move |uow| {
            uow.claim_overdue("w2", later, later + Duration::seconds(60), 10)
        })
        .await
        .unwrap();
        assert_eq!(taken.len(), 1);

        let id = overdue.id;
        transact(store, move |uow| uow.release_claim(id, "w2"))
            .await
            .unwrap();
        let released = transact(store, move |uow| uow.execution(id)).await.unwrap().unwrap();
        assert_eq!(released.claim, None::<Claim>);
    }

    pub(crate) async fn eligible_listing_order_and_filters(store: &dyn MarketStore) {
        let base = Utc::now() - Duration::minutes(10);
        let mut tasks = Vec::new();
        for i in 0..5 {
            let mut task = sample_task();
            task.created_at = base + Duration::seconds(i);
            tasks.push(task);
        }
        tasks[1].boosted = true;
        tasks[3].priority = 5;
        tasks[4].min_executor_level = Level::Gold;
        tasks[0].creator_id = UserId::new("exec");

        let rows = tasks.clone();
        transact(store, move |uow| {
            for task in &rows {
                uow.insert_task(task)?;
            }
            Ok(())
        })
        .await
        .unwrap();

        let query = EligibilityQuery {
            executor_id: UserId::new("exec"),
            level: Level::Silver,
            task_type: None,
            now: Utc::now(),
            after: None,
            limit: 10,
        };
        let listed = transact(store, move |uow| uow.eligible_tasks(&query))
            .await
            .unwrap();
        let ids: Vec<TaskId> = listed.iter().map(|t| t.id).collect();
        // Boosted first, then priority, then newest; own and over-level tasks hidden.
        assert_eq!(ids, vec![tasks[1].id, tasks[3].id, tasks[2].id]);
    }

    pub(crate) async fn conservation_totals(store: &dyn MarketStore) {
        transact(store, |uow| uow.put_user(&user("carol", Level::Gold)))
            .await
            .unwrap();
        let totals = transact(store, |uow| {
            uow.deposit(&UserId::new("carol"), 2500, "card-1")?;
            uow.ledger_totals()
        })
        .await
        .unwrap();
        assert_eq!(totals.deposits, 2500);
        assert_eq!(totals.balances, 2500);
        assert!(totals.is_conserved());
    }
}
