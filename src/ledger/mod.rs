//! Escrow ledger - account balances with an append-only transaction log.
//!
//! # Invariants
//! - `balance(account) == sum(transactions(account))` after every posting
//! - a posting mutates the balance and appends its transaction as one unit
//! - at most one transaction exists per idempotency key; replaying a posting
//!   returns the existing transaction and moves no money
//!
//! Backends implement the two primitives (`account_balance`, `post`); the
//! named operations (`reserve`, `credit`, `refund`, ...) are provided once on
//! top of them so every backend enforces the same rules.

mod book;

pub use book::LedgerBook;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::market::MarketError;
use crate::task::{ExecutionId, TaskId};

/// Reserved account that collects commission and forfeitures and funds
/// level bonuses. Exempt from the insufficient-funds check.
pub const PLATFORM_ACCOUNT: &str = "platform";

/// User / account identifier. Assigned by the external platform.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn platform() -> Self {
        Self(PLATFORM_ACCOUNT.to_string())
    }

    pub fn is_platform(&self) -> bool {
        self.0 == PLATFORM_ACCOUNT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Kind of ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    /// Top-up from outside the system.
    Deposit,
    /// Creator funds locked into a task (negative).
    Reserve,
    /// Platform fee on task creation (positive, platform account).
    Commission,
    /// Executor reward for an approved execution (positive).
    Credit,
    /// Level-multiplier surplus paid by the platform (negative, platform account).
    Bonus,
    /// Escrow returned to a creator (positive).
    Refund,
    /// Escrow forfeited on cancellation (positive, platform account).
    Penalty,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "DEPOSIT",
            Self::Reserve => "RESERVE",
            Self::Commission => "COMMISSION",
            Self::Credit => "CREDIT",
            Self::Bonus => "BONUS",
            Self::Refund => "REFUND",
            Self::Penalty => "PENALTY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEPOSIT" => Some(Self::Deposit),
            "RESERVE" => Some(Self::Reserve),
            "COMMISSION" => Some(Self::Commission),
            "CREDIT" => Some(Self::Credit),
            "BONUS" => Some(Self::Bonus),
            "REFUND" => Some(Self::Refund),
            "PENALTY" => Some(Self::Penalty),
            _ => None,
        }
    }

    /// Whether postings of this kind reduce the account balance.
    pub fn is_debit(self) -> bool {
        matches!(self, Self::Reserve | Self::Bonus)
    }
}

/// An immutable ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: UserId,
    pub kind: TransactionKind,
    /// Signed amount applied to the balance.
    pub amount: i64,
    pub task_id: Option<TaskId>,
    pub execution_id: Option<ExecutionId>,
    pub memo: String,
    /// Uniqueness key; see [`LedgerEntry::idempotency_key`].
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

/// A posting request, before it becomes a [`Transaction`].
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub account_id: UserId,
    pub kind: TransactionKind,
    /// Unsigned magnitude; the sign follows from `kind`.
    pub amount: i64,
    pub task_id: Option<TaskId>,
    pub execution_id: Option<ExecutionId>,
    pub memo: String,
    /// Caller-supplied reference, used for deposits.
    pub reference: Option<String>,
}

impl LedgerEntry {
    pub fn signed_amount(&self) -> i64 {
        if self.kind.is_debit() {
            -self.amount
        } else {
            self.amount
        }
    }

    /// Key enforcing exactly-once postings.
    ///
    /// Execution-scoped postings are unique per `(kind, execution)`, task-scoped
    /// ones per `(kind, task)`, deposits per caller reference.
    pub fn idempotency_key(&self) -> String {
        let kind = self.kind.as_str();
        if let Some(execution_id) = self.execution_id {
            format!("{}:execution:{}", kind, execution_id)
        } else if let Some(task_id) = self.task_id {
            format!("{}:task:{}", kind, task_id)
        } else if let Some(reference) = &self.reference {
            format!("{}:ref:{}:{}", kind, self.account_id, reference)
        } else {
            format!("{}:{}", kind, Uuid::new_v4())
        }
    }

    pub fn into_transaction(self, idempotency_key: String, created_at: DateTime<Utc>) -> Transaction {
        let amount = self.signed_amount();
        Transaction {
            id: Uuid::new_v4(),
            account_id: self.account_id,
            kind: self.kind,
            amount,
            task_id: self.task_id,
            execution_id: self.execution_id,
            memo: self.memo,
            idempotency_key,
            created_at,
        }
    }
}

/// Outcome of [`Ledger::post`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Posting {
    /// The balance was mutated and the transaction appended.
    Applied(Transaction),
    /// A transaction with the same idempotency key already exists; nothing moved.
    Replayed(Transaction),
}

impl Posting {
    pub fn transaction(&self) -> &Transaction {
        match self {
            Posting::Applied(tx) | Posting::Replayed(tx) => tx,
        }
    }

    pub fn into_transaction(self) -> Transaction {
        match self {
            Posting::Applied(tx) | Posting::Replayed(tx) => tx,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Posting::Replayed(_))
    }
}

/// Balance versus transaction-log comparison for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAudit {
    pub balance: i64,
    pub ledger_sum: i64,
}

impl AccountAudit {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.ledger_sum
    }
}

/// Ledger operations inside one store transaction.
pub trait Ledger {
    /// Cached balance, or `None` if the account does not exist.
    fn account_balance(&self, account: &UserId) -> Result<Option<i64>, MarketError>;

    /// Sum of all transactions on the account.
    fn ledger_sum(&self, account: &UserId) -> Result<i64, MarketError>;

    /// Apply the balance change and append the transaction as one unit.
    ///
    /// Must return `Posting::Replayed` without mutating anything when a
    /// transaction with the entry's idempotency key already exists.
    fn post(&mut self, entry: LedgerEntry) -> Result<Posting, MarketError>;

    /// Transactions of one account, oldest first.
    fn account_transactions(&self, account: &UserId) -> Result<Vec<Transaction>, MarketError>;

    /// Validate and post an entry. Debits from user accounts must be covered.
    fn post_checked(&mut self, entry: LedgerEntry) -> Result<Posting, MarketError> {
        if entry.amount <= 0 {
            return Err(MarketError::validation(format!(
                "{} amount must be positive, got {}",
                entry.kind.as_str(),
                entry.amount
            )));
        }
        let balance = self
            .account_balance(&entry.account_id)?
            .ok_or_else(|| MarketError::not_found("account", &entry.account_id))?;
        if entry.kind.is_debit() && !entry.account_id.is_platform() && balance < entry.amount {
            return Err(MarketError::InsufficientFunds {
                account: entry.account_id.to_string(),
                needed: entry.amount,
                available: balance,
            });
        }
        let posting = self.post(entry)?;
        if let Posting::Applied(tx) = &posting {
            tracing::debug!(
                account = %tx.account_id,
                kind = tx.kind.as_str(),
                amount = tx.amount,
                "Ledger posting applied"
            );
        }
        Ok(posting)
    }

    /// Lock `amount` of the creator's funds into a task.
    fn reserve(&mut self, account: &UserId, amount: i64, task_id: TaskId) -> Result<Transaction, MarketError> {
        self.post_checked(LedgerEntry {
            account_id: account.clone(),
            kind: TransactionKind::Reserve,
            amount,
            task_id: Some(task_id),
            execution_id: None,
            memo: format!("escrow reserved for task {}", task_id),
            reference: None,
        })
        .map(Posting::into_transaction)
    }

    /// Pay an executor for an approved execution.
    fn credit(
        &mut self,
        account: &UserId,
        amount: i64,
        task_id: TaskId,
        execution_id: ExecutionId,
        reason: &str,
    ) -> Result<Posting, MarketError> {
        self.post_checked(LedgerEntry {
            account_id: account.clone(),
            kind: TransactionKind::Credit,
            amount,
            task_id: Some(task_id),
            execution_id: Some(execution_id),
            memo: reason.to_string(),
            reference: None,
        })
    }

    /// Return escrow to a creator.
    fn refund(&mut self, account: &UserId, amount: i64, task_id: TaskId, reason: &str) -> Result<Posting, MarketError> {
        self.post_checked(LedgerEntry {
            account_id: account.clone(),
            kind: TransactionKind::Refund,
            amount,
            task_id: Some(task_id),
            execution_id: None,
            memo: reason.to_string(),
            reference: None,
        })
    }

    /// Move forfeited escrow to the platform account.
    fn penalty(&mut self, amount: i64, task_id: TaskId, reason: &str) -> Result<Posting, MarketError> {
        self.post_checked(LedgerEntry {
            account_id: UserId::platform(),
            kind: TransactionKind::Penalty,
            amount,
            task_id: Some(task_id),
            execution_id: None,
            memo: reason.to_string(),
            reference: None,
        })
    }

    /// Book the creation commission on the platform account.
    fn commission(&mut self, amount: i64, task_id: TaskId) -> Result<Posting, MarketError> {
        self.post_checked(LedgerEntry {
            account_id: UserId::platform(),
            kind: TransactionKind::Commission,
            amount,
            task_id: Some(task_id),
            execution_id: None,
            memo: format!("commission for task {}", task_id),
            reference: None,
        })
    }

    /// Charge the platform for the level-multiplier surplus of a reward.
    fn bonus(&mut self, amount: i64, task_id: TaskId, execution_id: ExecutionId) -> Result<Posting, MarketError> {
        self.post_checked(LedgerEntry {
            account_id: UserId::platform(),
            kind: TransactionKind::Bonus,
            amount,
            task_id: Some(task_id),
            execution_id: Some(execution_id),
            memo: format!("level bonus for execution {}", execution_id),
            reference: None,
        })
    }

    /// Top up an account. Replaying the same reference is a no-op.
    fn deposit(&mut self, account: &UserId, amount: i64, reference: &str) -> Result<Posting, MarketError> {
        if reference.trim().is_empty() {
            return Err(MarketError::validation("deposit reference must not be empty"));
        }
        self.post_checked(LedgerEntry {
            account_id: account.clone(),
            kind: TransactionKind::Deposit,
            amount,
            task_id: None,
            execution_id: None,
            memo: format!("deposit {}", reference),
            reference: Some(reference.to_string()),
        })
    }

    /// Compare the cached balance with the transaction log.
    fn audit(&self, account: &UserId) -> Result<AccountAudit, MarketError> {
        let balance = self
            .account_balance(account)?
            .ok_or_else(|| MarketError::not_found("account", account))?;
        Ok(AccountAudit {
            balance,
            ledger_sum: self.ledger_sum(account)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book_with(account: &str, deposit: i64) -> LedgerBook {
        let mut book = LedgerBook::default();
        book.open_account(&UserId::platform());
        book.open_account(&UserId::new(account));
        if deposit > 0 {
            book.deposit(&UserId::new(account), deposit, "seed").unwrap();
        }
        book
    }

    #[test]
    fn test_reserve_requires_funds() {
        let mut book = book_with("alice", 500);
        let alice = UserId::new("alice");

        let err = book.reserve(&alice, 1070, TaskId::new()).unwrap_err();
        assert_eq!(
            err,
            MarketError::InsufficientFunds {
                account: "alice".to_string(),
                needed: 1070,
                available: 500
            }
        );
        // nothing moved
        assert_eq!(book.account_balance(&alice).unwrap(), Some(500));
        assert_eq!(book.account_transactions(&alice).unwrap().len(), 1);

        let tx = book.reserve(&alice, 400, TaskId::new()).unwrap();
        assert_eq!(tx.amount, -400);
        assert_eq!(book.account_balance(&alice).unwrap(), Some(100));
    }

    #[test]
    fn test_credit_replay_is_noop() {
        let mut book = book_with("bob", 0);
        let bob = UserId::new("bob");
        let task_id = TaskId::new();
        let execution_id = ExecutionId::new();

        let first = book.credit(&bob, 135, task_id, execution_id, "approved").unwrap();
        assert!(!first.is_replay());
        let second = book.credit(&bob, 135, task_id, execution_id, "approved").unwrap();
        assert!(second.is_replay());
        assert_eq!(first.transaction().id, second.transaction().id);

        assert_eq!(book.account_balance(&bob).unwrap(), Some(135));
        assert!(book.audit(&bob).unwrap().is_consistent());
    }

    #[test]
    fn test_platform_may_go_negative() {
        let mut book = book_with("carol", 0);
        book.bonus(35, TaskId::new(), ExecutionId::new()).unwrap();
        assert_eq!(book.account_balance(&UserId::platform()).unwrap(), Some(-35));
        assert!(book.audit(&UserId::platform()).unwrap().is_consistent());
    }

    #[test]
    fn test_rejects_non_positive_and_unknown_accounts() {
        let mut book = book_with("dave", 100);
        let dave = UserId::new("dave");
        assert!(matches!(
            book.refund(&dave, 0, TaskId::new(), "zero"),
            Err(MarketError::Validation(_))
        ));
        assert!(matches!(
            book.deposit(&UserId::new("nobody"), 10, "ref-1"),
            Err(MarketError::NotFound { .. })
        ));
        assert!(matches!(
            book.deposit(&dave, 10, "  "),
            Err(MarketError::Validation(_))
        ));
    }

    #[test]
    fn test_deposit_reference_is_idempotent() {
        let mut book = book_with("erin", 0);
        let erin = UserId::new("erin");
        book.deposit(&erin, 250, "invoice-7").unwrap();
        let replay = book.deposit(&erin, 250, "invoice-7").unwrap();
        assert!(replay.is_replay());
        book.deposit(&erin, 250, "invoice-8").unwrap();
        assert_eq!(book.account_balance(&erin).unwrap(), Some(500));
    }

    #[test]
    fn test_idempotency_keys() {
        let task_id = TaskId::new();
        let execution_id = ExecutionId::new();
        let mut entry = LedgerEntry {
            account_id: UserId::new("x"),
            kind: TransactionKind::Credit,
            amount: 1,
            task_id: Some(task_id),
            execution_id: Some(execution_id),
            memo: String::new(),
            reference: None,
        };
        assert_eq!(
            entry.idempotency_key(),
            format!("CREDIT:execution:{}", execution_id)
        );
        entry.execution_id = None;
        entry.kind = TransactionKind::Refund;
        assert_eq!(entry.idempotency_key(), format!("REFUND:task:{}", task_id));
    }
}
