//! In-memory market store (non-persistent).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    EligibilityQuery, LedgerTotals, MarketStore, PageCursor, TxFn, TxOutput, UnitOfWork,
    UserProfile,
};
use crate::ledger::{Ledger, LedgerBook, LedgerEntry, Posting, Transaction, TransactionKind, UserId};
use crate::market::MarketError;
use crate::task::{Claim, Execution, ExecutionId, ExecutionStatus, Task, TaskId, TaskStatus};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    book: LedgerBook,
    users: HashMap<UserId, UserProfile>,
    tasks: HashMap<TaskId, Task>,
    executions: HashMap<ExecutionId, Execution>,
}

/// Whole-state snapshot store: a transaction runs against a clone that
/// replaces the live state only when the closure succeeds.
pub struct InMemoryMarketStore {
    state: Mutex<MemoryState>,
}

impl InMemoryMarketStore {
    pub fn new() -> Self {
        let mut state = MemoryState::default();
        state.book.open_account(&UserId::platform());
        Self {
            state: Mutex::new(state),
        }
    }
}

impl Default for InMemoryMarketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketStore for InMemoryMarketStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn run_tx(&self, f: TxFn) -> Result<TxOutput, MarketError> {
        let mut state = self.state.lock().await;
        let mut draft = state.clone();
        let output = f(&mut draft)?;
        *state = draft;
        Ok(output)
    }
}

impl Ledger for MemoryState {
    fn account_balance(&self, account: &UserId) -> Result<Option<i64>, MarketError> {
        self.book.account_balance(account)
    }

    fn ledger_sum(&self, account: &UserId) -> Result<i64, MarketError> {
        self.book.ledger_sum(account)
    }

    fn post(&mut self, entry: LedgerEntry) -> Result<Posting, MarketError> {
        self.book.post(entry)
    }

    fn account_transactions(&self, account: &UserId) -> Result<Vec<Transaction>, MarketError> {
        self.book.account_transactions(account)
    }
}

impl MemoryState {
    fn has_pending(&self, task_id: TaskId) -> bool {
        self.executions
            .values()
            .any(|e| e.task_id == task_id && e.status == ExecutionStatus::Pending)
    }

    fn claimable(execution: &Execution, worker: &str, now: DateTime<Utc>) -> bool {
        execution.is_overdue(now) && !execution.claimed_by_other(worker, now)
    }
}

impl UnitOfWork for MemoryState {
    fn user(&self, id: &UserId) -> Result<Option<UserProfile>, MarketError> {
        Ok(self.users.get(id).cloned())
    }

    fn put_user(&mut self, user: &UserProfile) -> Result<(), MarketError> {
        self.book.open_account(&user.id);
        self.users
            .entry(user.id.clone())
            .and_modify(|existing| existing.level = user.level)
            .or_insert_with(|| user.clone());
        Ok(())
    }

    fn task(&self, id: TaskId) -> Result<Option<Task>, MarketError> {
        Ok(self.tasks.get(&id).cloned())
    }

    fn insert_task(&mut self, task: &Task) -> Result<(), MarketError> {
        if self.tasks.contains_key(&task.id) {
            return Err(MarketError::Storage(format!("task {} already exists", task.id)));
        }
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn update_task(&mut self, task: &Task, expected_version: u64) -> Result<(), MarketError> {
        let stored = self
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| MarketError::not_found("task", task.id))?;
        if stored.version != expected_version {
            return Err(MarketError::Conflict(format!(
                "task {} is at version {}, expected {}",
                task.id, stored.version, expected_version
            )));
        }
        *stored = task.clone();
        Ok(())
    }

    fn count_tasks_created_since(
        &self,
        creator: &UserId,
        since: DateTime<Utc>,
    ) -> Result<u32, MarketError> {
        Ok(self
            .tasks
            .values()
            .filter(|t| &t.creator_id == creator && t.created_at >= since)
            .count() as u32)
    }

    fn eligible_tasks(&self, query: &EligibilityQuery) -> Result<Vec<Task>, MarketError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|task| query.admits(task))
            .filter(|task| {
                !self.executions.values().any(|e| {
                    e.task_id == task.id
                        && e.executor_id == query.executor_id
                        && e.status != ExecutionStatus::Rejected
                })
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|task| std::cmp::Reverse(PageCursor::key_of(task)));
        tasks.truncate(query.limit);
        Ok(tasks)
    }

    fn expirable_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>, MarketError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Active | TaskStatus::Paused))
            .filter(|t| t.is_expired_at(now) && !self.has_pending(t.id))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.expires_at);
        tasks.truncate(limit);
        Ok(tasks)
    }

    fn execution(&self, id: ExecutionId) -> Result<Option<Execution>, MarketError> {
        Ok(self.executions.get(&id).cloned())
    }

    fn insert_execution(&mut self, execution: &Execution) -> Result<(), MarketError> {
        if execution.status != ExecutionStatus::Rejected
            && self.open_execution(execution.task_id, &execution.executor_id)?.is_some()
        {
            return Err(MarketError::invalid_state(format!(
                "{} already has an open execution of task {}",
                execution.executor_id, execution.task_id
            )));
        }
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    fn update_execution(
        &mut self,
        execution: &Execution,
        expected_status: ExecutionStatus,
    ) -> Result<(), MarketError> {
        let stored = self
            .executions
            .get_mut(&execution.id)
            .ok_or_else(|| MarketError::not_found("execution", execution.id))?;
        if stored.status != expected_status {
            return Err(MarketError::Conflict(format!(
                "execution {} is {}, expected {}",
                execution.id,
                stored.status.as_str(),
                expected_status.as_str()
            )));
        }
        *stored = execution.clone();
        Ok(())
    }

    fn executions_for_task(
        &self,
        task_id: TaskId,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<Execution>, MarketError> {
        let mut executions: Vec<Execution> = self
            .executions
            .values()
            .filter(|e| e.task_id == task_id && status.map(|s| s == e.status).unwrap_or(true))
            .cloned()
            .collect();
        executions.sort_by_key(|e| (e.submitted_at, e.id));
        Ok(executions)
    }

    fn open_execution(
        &self,
        task_id: TaskId,
        executor: &UserId,
    ) -> Result<Option<Execution>, MarketError> {
        Ok(self
            .executions
            .values()
            .find(|e| {
                e.task_id == task_id
                    && &e.executor_id == executor
                    && e.status != ExecutionStatus::Rejected
            })
            .cloned())
    }

    fn claim_overdue(
        &mut self,
        worker: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, MarketError> {
        let mut due: Vec<ExecutionId> = self
            .executions
            .values()
            .filter(|e| Self::claimable(e, worker, now))
            .map(|e| e.id)
            .collect();
        due.sort_by_key(|id| self.executions.get(id).and_then(|e| e.auto_approve_at));
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(execution) = self.executions.get_mut(&id) {
                execution.claim = Some(Claim {
                    owner: worker.to_string(),
                    until,
                });
                claimed.push(execution.clone());
            }
        }
        Ok(claimed)
    }

    fn release_claim(&mut self, id: ExecutionId, worker: &str) -> Result<(), MarketError> {
        if let Some(execution) = self.executions.get_mut(&id) {
            if execution.claim.as_ref().map(|c| c.owner == worker).unwrap_or(false) {
                execution.claim = None;
            }
        }
        Ok(())
    }

    fn ledger_totals(&self) -> Result<LedgerTotals, MarketError> {
        Ok(LedgerTotals {
            deposits: self
                .book
                .transactions()
                .iter()
                .filter(|tx| tx.kind == TransactionKind::Deposit)
                .map(|tx| tx.amount)
                .sum(),
            balances: self.book.balances().map(|(_, balance)| balance).sum(),
            escrow: self.tasks.values().map(|t| t.escrowed_amount).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;

    #[tokio::test]
    async fn test_platform_account_exists() {
        contract::platform_account_exists(&InMemoryMarketStore::new()).await;
    }

    #[tokio::test]
    async fn test_rollback_on_error() {
        contract::rollback_on_error(&InMemoryMarketStore::new()).await;
    }

    #[tokio::test]
    async fn test_ledger_replay_is_noop() {
        contract::ledger_replay_is_noop(&InMemoryMarketStore::new()).await;
    }

    #[tokio::test]
    async fn test_task_version_cas() {
        contract::task_version_is_compare_and_swap(&InMemoryMarketStore::new()).await;
    }

    #[tokio::test]
    async fn test_execution_status_cas() {
        contract::execution_status_is_compare_and_swap(&InMemoryMarketStore::new()).await;
    }

    #[tokio::test]
    async fn test_one_open_execution() {
        contract::one_open_execution_per_executor(&InMemoryMarketStore::new()).await;
    }

    #[tokio::test]
    async fn test_claims_are_exclusive() {
        contract::claims_are_exclusive(&InMemoryMarketStore::new()).await;
    }

    #[tokio::test]
    async fn test_eligible_listing() {
        contract::eligible_listing_order_and_filters(&InMemoryMarketStore::new()).await;
    }

    #[tokio::test]
    async fn test_conservation_totals() {
        contract::conservation_totals(&InMemoryMarketStore::new()).await;
    }

    #[test]
    fn test_not_persistent() {
        assert!(!InMemoryMarketStore::new().is_persistent());
    }
}
