//! SQLite-based market store.
//!
//! Every transaction is `BEGIN IMMEDIATE`, so writers from several processes
//! sharing the database file are serialized by SQLite itself.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tokio::sync::Mutex;

use super::{
    EligibilityQuery, LedgerTotals, MarketStore, TxFn, TxOutput, UnitOfWork, UserProfile,
};
use crate::ledger::{Ledger, LedgerEntry, Posting, Transaction, TransactionKind, UserId};
use crate::market::MarketError;
use crate::reward::Level;
use crate::task::{
    CancellationRecord, Claim, Execution, ExecutionId, ExecutionStatus, Task, TaskId, TaskStatus,
    TaskType, VerificationMode,
};
use crate::util::{from_millis, to_millis};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS accounts (
    account_id TEXT PRIMARY KEY NOT NULL,
    level TEXT NOT NULL DEFAULT 'bronze',
    balance INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    account_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    amount INTEGER NOT NULL,
    task_id TEXT,
    execution_id TEXT,
    memo TEXT NOT NULL,
    idempotency_key TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (account_id) REFERENCES accounts(account_id)
);

CREATE INDEX IF NOT EXISTS idx_ledger_account ON ledger_entries(account_id, seq);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    creator_id TEXT NOT NULL,
    task_type TEXT NOT NULL,
    title TEXT NOT NULL,
    target_ref TEXT NOT NULL,
    reward INTEGER NOT NULL CHECK (reward > 0),
    target_count INTEGER NOT NULL CHECK (target_count > 0),
    completed_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    min_level_rank INTEGER NOT NULL,
    verification_mode TEXT NOT NULL,
    auto_approve_secs INTEGER NOT NULL,
    expires_at INTEGER,
    escrowed_amount INTEGER NOT NULL CHECK (escrowed_amount >= 0),
    commission INTEGER NOT NULL,
    boosted INTEGER NOT NULL DEFAULT 0,
    priority INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER,
    cancel_reason TEXT,
    cancel_refund INTEGER,
    cancel_forfeited INTEGER,
    cancelled_at INTEGER,
    CHECK (completed_count BETWEEN 0 AND target_count)
);

CREATE INDEX IF NOT EXISTS idx_tasks_listing
    ON tasks(status, boosted DESC, priority DESC, created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_tasks_creator ON tasks(creator_id, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_expiry ON tasks(expires_at) WHERE expires_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY NOT NULL,
    task_id TEXT NOT NULL,
    executor_id TEXT NOT NULL,
    status TEXT NOT NULL,
    reward_snapshot INTEGER NOT NULL,
    level_snapshot TEXT NOT NULL,
    credited_amount INTEGER,
    submitted_at INTEGER NOT NULL,
    verified_at INTEGER,
    verifier_id TEXT,
    proof_ref TEXT,
    rejection_reason TEXT,
    appeal_deadline INTEGER,
    auto_approve_at INTEGER,
    appeal_of TEXT,
    appealed INTEGER NOT NULL DEFAULT 0,
    claim_owner TEXT,
    claim_until INTEGER,
    FOREIGN KEY (task_id) REFERENCES tasks(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_open
    ON executions(task_id, executor_id) WHERE status != 'rejected';
CREATE INDEX IF NOT EXISTS idx_executions_due
    ON executions(auto_approve_at) WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_executions_task ON executions(task_id, status, submitted_at);
"#;

const TASK_COLUMNS: &str = "id, creator_id, task_type, title, target_ref, reward, target_count,
    completed_count, status, min_level_rank, verification_mode, auto_approve_secs, expires_at,
    escrowed_amount, commission, boosted, priority, version, created_at, updated_at,
    completed_at, cancel_reason, cancel_refund, cancel_forfeited, cancelled_at";

const EXECUTION_COLUMNS: &str = "id, task_id, executor_id, status, reward_snapshot,
    level_snapshot, credited_amount, submitted_at, verified_at, verifier_id, proof_ref,
    rejection_reason, appeal_deadline, auto_approve_at, appeal_of, appealed, claim_owner,
    claim_until";

const LEDGER_COLUMNS: &str =
    "id, account_id, kind, amount, task_id, execution_id, memo, idempotency_key, created_at";

/// How long a writer waits for the database lock before reporting `Conflict`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteMarketStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMarketStore {
    /// Open `taskmarket.db` under `data_dir`, creating the directory.
    pub async fn new(data_dir: PathBuf) -> Result<Self, String> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| format!("Failed to create data dir: {}", e))?;
        Self::open(database_path(&data_dir)).await
    }

    /// Open a database file directly. Several stores may share one file.
    pub async fn open(db_path: PathBuf) -> Result<Self, String> {
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
            conn.busy_timeout(BUSY_TIMEOUT)
                .map_err(|e| format!("Failed to set busy timeout: {}", e))?;

            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;
            Self::run_migrations(&conn)?;
            Self::open_platform_account(&conn)?;

            tracing::info!(path = %db_path.display(), "SQLite market store ready");
            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| format!("Task join error: {}", e))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), String> {
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|e| format!("Failed to read schema version: {}", e))?;

        if version > SCHEMA_VERSION {
            return Err(format!(
                "Database schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            ));
        }
        if version < SCHEMA_VERSION {
            tracing::info!(from = version, to = SCHEMA_VERSION, "Stamping schema version");
            conn.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
                .map_err(|e| format!("Failed to stamp schema version: {}", e))?;
        }
        Ok(())
    }

    fn open_platform_account(conn: &Connection) -> Result<(), String> {
        let now = to_millis(Utc::now());
        conn.execute(
            "INSERT OR IGNORE INTO accounts (account_id, level, balance, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?3)",
            params![crate::ledger::PLATFORM_ACCOUNT, Level::Bronze.as_str(), now],
        )
        .map_err(|e| format!("Failed to open platform account: {}", e))?;
        Ok(())
    }
}

#[async_trait]
impl MarketStore for SqliteMarketStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn run_tx(&self, f: TxFn) -> Result<TxOutput, MarketError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let output = {
                let mut uow = SqliteUow { conn: &tx };
                f(&mut uow)?
            };
            tx.commit()?;
            Ok::<_, MarketError>(output)
        })
        .await
        .map_err(|e| MarketError::Storage(format!("Task join error: {}", e)))?
    }
}

/// Repository view over an open SQLite transaction.
struct SqliteUow<'c> {
    conn: &'c Connection,
}

fn invalid(idx: usize, what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("invalid {} '{}'", what, raw).into(),
    )
}

fn parse_id<T: FromStr>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    raw.parse().map_err(|_| invalid(idx, "id", raw))
}

fn opt_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(to_millis)
}

fn get_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    row.get::<_, i64>(idx).map(from_millis)
}

fn get_opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_millis))
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let task_type: String = row.get(2)?;
    let status: String = row.get(8)?;
    let rank: i64 = row.get(9)?;
    let mode: String = row.get(10)?;

    let cancellation = match row.get::<_, Option<String>>(21)? {
        Some(reason) => Some(CancellationRecord {
            reason,
            refund_amount: row.get::<_, Option<i64>>(22)?.unwrap_or(0),
            forfeited_amount: row.get::<_, Option<i64>>(23)?.unwrap_or(0),
            cancelled_at: get_opt_time(row, 24)?.unwrap_or_else(|| from_millis(0)),
        }),
        None => None,
    };

    Ok(Task {
        id: parse_id(0, &id)?,
        creator_id: UserId::new(row.get::<_, String>(1)?),
        task_type: TaskType::parse(&task_type).ok_or_else(|| invalid(2, "task type", &task_type))?,
        title: row.get(3)?,
        target_ref: row.get(4)?,
        reward: row.get(5)?,
        target_count: row.get(6)?,
        completed_count: row.get(7)?,
        status: TaskStatus::parse(&status).ok_or_else(|| invalid(8, "task status", &status))?,
        min_executor_level: Level::from_rank(rank)
            .ok_or_else(|| invalid(9, "level rank", &rank.to_string()))?,
        verification_mode: VerificationMode::parse(&mode)
            .ok_or_else(|| invalid(10, "verification mode", &mode))?,
        auto_approve_secs: row.get(11)?,
        expires_at: get_opt_time(row, 12)?,
        escrowed_amount: row.get(13)?,
        commission: row.get(14)?,
        boosted: row.get(15)?,
        priority: row.get(16)?,
        version: row.get::<_, i64>(17)? as u64,
        created_at: get_time(row, 18)?,
        updated_at: get_time(row, 19)?,
        completed_at: get_opt_time(row, 20)?,
        cancellation,
    })
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let id: String = row.get(0)?;
    let task_id: String = row.get(1)?;
    let status: String = row.get(3)?;
    let level: String = row.get(5)?;
    let appeal_of: Option<String> = row.get(14)?;
    let claim_owner: Option<String> = row.get(16)?;
    let claim_until = get_opt_time(row, 17)?;

    Ok(Execution {
        id: parse_id(0, &id)?,
        task_id: parse_id(1, &task_id)?,
        executor_id: UserId::new(row.get::<_, String>(2)?),
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| invalid(3, "execution status", &status))?,
        reward_snapshot: row.get(4)?,
        level_snapshot: Level::parse(&level).ok_or_else(|| invalid(5, "level", &level))?,
        credited_amount: row.get(6)?,
        submitted_at: get_time(row, 7)?,
        verified_at: get_opt_time(row, 8)?,
        verifier_id: row.get(9)?,
        proof_ref: row.get(10)?,
        rejection_reason: row.get(11)?,
        appeal_deadline: get_opt_time(row, 12)?,
        auto_approve_at: get_opt_time(row, 13)?,
        appeal_of: appeal_of.as_deref().map(|raw| parse_id(14, raw)).transpose()?,
        appealed: row.get(15)?,
        claim: match (claim_owner, claim_until) {
            (Some(owner), Some(until)) => Some(Claim { owner, until }),
            _ => None,
        },
    })
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let id: String = row.get(0)?;
    let kind: String = row.get(2)?;
    let task_id: Option<String> = row.get(4)?;
    let execution_id: Option<String> = row.get(5)?;

    Ok(Transaction {
        id: parse_id(0, &id)?,
        account_id: UserId::new(row.get::<_, String>(1)?),
        kind: TransactionKind::parse(&kind).ok_or_else(|| invalid(2, "transaction kind", &kind))?,
        amount: row.get(3)?,
        task_id: task_id.as_deref().map(|raw| parse_id(4, raw)).transpose()?,
        execution_id: execution_id.as_deref().map(|raw| parse_id(5, raw)).transpose()?,
        memo: row.get(6)?,
        idempotency_key: row.get(7)?,
        created_at: get_time(row, 8)?,
    })
}

impl SqliteUow<'_> {
    fn task_exists(&self, id: TaskId) -> Result<bool, MarketError> {
        Ok(self
            .conn
            .prepare("SELECT 1 FROM tasks WHERE id = ?1")?
            .exists(params![id.to_string()])?)
    }

    fn execution_exists(&self, id: ExecutionId) -> Result<bool, MarketError> {
        Ok(self
            .conn
            .prepare("SELECT 1 FROM executions WHERE id = ?1")?
            .exists(params![id.to_string()])?)
    }

    fn query_tasks(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Task>, MarketError> {
        let mut stmt = self.conn.prepare(sql)?;
        let tasks = stmt
            .query_map(args, row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn query_executions(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Execution>, MarketError> {
        let mut stmt = self.conn.prepare(sql)?;
        let executions = stmt
            .query_map(args, row_to_execution)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(executions)
    }
}

impl Ledger for SqliteUow<'_> {
    fn account_balance(&self, account: &UserId) -> Result<Option<i64>, MarketError> {
        Ok(self
            .conn
            .query_row(
                "SELECT balance FROM accounts WHERE account_id = ?1",
                params![account.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn ledger_sum(&self, account: &UserId) -> Result<i64, MarketError> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM ledger_entries WHERE account_id = ?1",
            params![account.as_str()],
            |row| row.get(0),
        )?)
    }

    fn post(&mut self, entry: LedgerEntry) -> Result<Posting, MarketError> {
        let key = entry.idempotency_key();
        let existing = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM ledger_entries WHERE idempotency_key = ?1",
                    LEDGER_COLUMNS
                ),
                params![key],
                row_to_transaction,
            )
            .optional()?;
        if let Some(tx) = existing {
            return Ok(Posting::Replayed(tx));
        }

        let tx = entry.into_transaction(key, Utc::now());
        let created_at = to_millis(tx.created_at);
        let changed = self.conn.execute(
            "UPDATE accounts SET balance = balance + ?1, updated_at = ?2 WHERE account_id = ?3",
            params![tx.amount, created_at, tx.account_id.as_str()],
        )?;
        if changed == 0 {
            return Err(MarketError::not_found("account", &tx.account_id));
        }
        self.conn.execute(
            "INSERT INTO ledger_entries
                (id, account_id, kind, amount, task_id, execution_id, memo, idempotency_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                tx.id.to_string(),
                tx.account_id.as_str(),
                tx.kind.as_str(),
                tx.amount,
                tx.task_id.map(|id| id.to_string()),
                tx.execution_id.map(|id| id.to_string()),
                tx.memo,
                tx.idempotency_key,
                created_at,
            ],
        )?;
        Ok(Posting::Applied(tx))
    }

    fn account_transactions(&self, account: &UserId) -> Result<Vec<Transaction>, MarketError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM ledger_entries WHERE account_id = ?1 ORDER BY seq",
            LEDGER_COLUMNS
        ))?;
        let transactions = stmt
            .query_map(params![account.as_str()], row_to_transaction)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(transactions)
    }
}

impl UnitOfWork for SqliteUow<'_> {
    fn user(&self, id: &UserId) -> Result<Option<UserProfile>, MarketError> {
        Ok(self
            .conn
            .query_row(
                "SELECT account_id, level, created_at FROM accounts WHERE account_id = ?1",
                params![id.as_str()],
                |row| {
                    let level: String = row.get(1)?;
                    Ok(UserProfile {
                        id: UserId::new(row.get::<_, String>(0)?),
                        level: Level::parse(&level).ok_or_else(|| invalid(1, "level", &level))?,
                        created_at: get_time(row, 2)?,
                    })
                },
            )
            .optional()?)
    }

    fn put_user(&mut self, user: &UserProfile) -> Result<(), MarketError> {
        self.conn.execute(
            "INSERT INTO accounts (account_id, level, balance, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?3)
             ON CONFLICT(account_id) DO UPDATE SET
                level = excluded.level,
                updated_at = excluded.updated_at",
            params![user.id.as_str(), user.level.as_str(), to_millis(user.created_at)],
        )?;
        Ok(())
    }

    fn task(&self, id: TaskId) -> Result<Option<Task>, MarketError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id.to_string()],
                row_to_task,
            )
            .optional()?)
    }

    fn insert_task(&mut self, task: &Task) -> Result<(), MarketError> {
        let cancellation = task.cancellation.as_ref();
        self.conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                    ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
                TASK_COLUMNS
            ),
            params![
                task.id.to_string(),
                task.creator_id.as_str(),
                task.task_type.as_str(),
                task.title,
                task.target_ref,
                task.reward,
                task.target_count,
                task.completed_count,
                task.status.as_str(),
                task.min_executor_level.rank(),
                task.verification_mode.as_str(),
                task.auto_approve_secs,
                opt_millis(task.expires_at),
                task.escrowed_amount,
                task.commission,
                task.boosted,
                task.priority,
                task.version as i64,
                to_millis(task.created_at),
                to_millis(task.updated_at),
                opt_millis(task.completed_at),
                cancellation.map(|c| c.reason.clone()),
                cancellation.map(|c| c.refund_amount),
                cancellation.map(|c| c.forfeited_amount),
                cancellation.map(|c| to_millis(c.cancelled_at)),
            ],
        )?;
        Ok(())
    }

    fn update_task(&mut self, task: &Task, expected_version: u64) -> Result<(), MarketError> {
        let cancellation = task.cancellation.as_ref();
        let changed = self.conn.execute(
            "UPDATE tasks SET
                title = ?3, target_ref = ?4, completed_count = ?5, status = ?6,
                expires_at = ?7, escrowed_amount = ?8, boosted = ?9, priority = ?10,
                version = ?11, updated_at = ?12, completed_at = ?13, cancel_reason = ?14,
                cancel_refund = ?15, cancel_forfeited = ?16, cancelled_at = ?17
             WHERE id = ?1 AND version = ?2",
            params![
                task.id.to_string(),
                expected_version as i64,
                task.title,
                task.target_ref,
                task.completed_count,
                task.status.as_str(),
                opt_millis(task.expires_at),
                task.escrowed_amount,
                task.boosted,
                task.priority,
                task.version as i64,
                to_millis(task.updated_at),
                opt_millis(task.completed_at),
                cancellation.map(|c| c.reason.clone()),
                cancellation.map(|c| c.refund_amount),
                cancellation.map(|c| c.forfeited_amount),
                cancellation.map(|c| to_millis(c.cancelled_at)),
            ],
        )?;
        if changed == 0 {
            if !self.task_exists(task.id)? {
                return Err(MarketError::not_found("task", task.id));
            }
            return Err(MarketError::Conflict(format!(
                "task {} is no longer at version {}",
                task.id, expected_version
            )));
        }
        Ok(())
    }

    fn count_tasks_created_since(
        &self,
        creator: &UserId,
        since: DateTime<Utc>,
    ) -> Result<u32, MarketError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE creator_id = ?1 AND created_at >= ?2",
            params![creator.as_str(), to_millis(since)],
            |row| row.get(0),
        )?)
    }

    fn eligible_tasks(&self, query: &EligibilityQuery) -> Result<Vec<Task>, MarketError> {
        let sql = format!(
            "SELECT {} FROM tasks
             WHERE status = 'active'
               AND min_level_rank <= ?1
               AND creator_id != ?2
               AND completed_count < target_count
               AND (expires_at IS NULL OR expires_at > ?3)
               AND (?4 IS NULL OR task_type = ?4)
               AND NOT EXISTS (
                   SELECT 1 FROM executions e
                   WHERE e.task_id = tasks.id AND e.executor_id = ?2 AND e.status != 'rejected'
               )
               AND (?5 IS NULL OR (boosted, priority, created_at, id) < (?5, ?6, ?7, ?8))
             ORDER BY boosted DESC, priority DESC, created_at DESC, id DESC
             LIMIT ?9",
            TASK_COLUMNS
        );
        let after = query.after;
        self.query_tasks(
            &sql,
            params![
                query.level.rank(),
                query.executor_id.as_str(),
                to_millis(query.now),
                query.task_type.map(|t| t.as_str()),
                after.map(|c| c.boosted),
                after.map(|c| c.priority),
                after.map(|c| c.created_at),
                after.map(|c| c.id.to_string()),
                query.limit as i64,
            ],
        )
    }

    fn expirable_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>, MarketError> {
        let sql = format!(
            "SELECT {} FROM tasks
             WHERE status IN ('active', 'paused')
               AND expires_at IS NOT NULL AND expires_at <= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM executions e WHERE e.task_id = tasks.id AND e.status = 'pending'
               )
             ORDER BY expires_at
             LIMIT ?2",
            TASK_COLUMNS
        );
        self.query_tasks(&sql, params![to_millis(now), limit as i64])
    }

    fn execution(&self, id: ExecutionId) -> Result<Option<Execution>, MarketError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                params![id.to_string()],
                row_to_execution,
            )
            .optional()?)
    }

    fn insert_execution(&mut self, execution: &Execution) -> Result<(), MarketError> {
        let claim = execution.claim.as_ref();
        self.conn
            .execute(
                &format!(
                    "INSERT INTO executions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                        ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                    EXECUTION_COLUMNS
                ),
                params![
                    execution.id.to_string(),
                    execution.task_id.to_string(),
                    execution.executor_id.as_str(),
                    execution.status.as_str(),
                    execution.reward_snapshot,
                    execution.level_snapshot.as_str(),
                    execution.credited_amount,
                    to_millis(execution.submitted_at),
                    opt_millis(execution.verified_at),
                    execution.verifier_id,
                    execution.proof_ref,
                    execution.rejection_reason,
                    opt_millis(execution.appeal_deadline),
                    opt_millis(execution.auto_approve_at),
                    execution.appeal_of.map(|id| id.to_string()),
                    execution.appealed,
                    claim.map(|c| c.owner.clone()),
                    claim.map(|c| to_millis(c.until)),
                ],
            )
            .map_err(|e| match e.sqlite_error_code() {
                Some(ErrorCode::ConstraintViolation) => MarketError::invalid_state(format!(
                    "{} already has an open execution of task {}",
                    execution.executor_id, execution.task_id
                )),
                _ => e.into(),
            })?;
        Ok(())
    }

    fn update_execution(
        &mut self,
        execution: &Execution,
        expected_status: ExecutionStatus,
    ) -> Result<(), MarketError> {
        let claim = execution.claim.as_ref();
        let changed = self.conn.execute(
            "UPDATE executions SET
                status = ?3, credited_amount = ?4, verified_at = ?5, verifier_id = ?6,
                rejection_reason = ?7, appeal_deadline = ?8, auto_approve_at = ?9,
                appealed = ?10, claim_owner = ?11, claim_until = ?12, level_snapshot = ?13
             WHERE id = ?1 AND status = ?2",
            params![
                execution.id.to_string(),
                expected_status.as_str(),
                execution.status.as_str(),
                execution.credited_amount,
                opt_millis(execution.verified_at),
                execution.verifier_id,
                execution.rejection_reason,
                opt_millis(execution.appeal_deadline),
                opt_millis(execution.auto_approve_at),
                execution.appealed,
                claim.map(|c| c.owner.clone()),
                claim.map(|c| to_millis(c.until)),
                execution.level_snapshot.as_str(),
            ],
        )?;
        if changed == 0 {
            if !self.execution_exists(execution.id)? {
                return Err(MarketError::not_found("execution", execution.id));
            }
            return Err(MarketError::Conflict(format!(
                "execution {} is no longer {}",
                execution.id,
                expected_status.as_str()
            )));
        }
        Ok(())
    }

    fn executions_for_task(
        &self,
        task_id: TaskId,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<Execution>, MarketError> {
        let sql = format!(
            "SELECT {} FROM executions
             WHERE task_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY submitted_at, id",
            EXECUTION_COLUMNS
        );
        self.query_executions(&sql, params![task_id.to_string(), status.map(|s| s.as_str())])
    }

    fn open_execution(
        &self,
        task_id: TaskId,
        executor: &UserId,
    ) -> Result<Option<Execution>, MarketError> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM executions
                     WHERE task_id = ?1 AND executor_id = ?2 AND status != 'rejected'",
                    EXECUTION_COLUMNS
                ),
                params![task_id.to_string(), executor.as_str()],
                row_to_execution,
            )
            .optional()?)
    }

    fn claim_overdue(
        &mut self,
        worker: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, MarketError> {
        let now_ms = to_millis(now);
        let candidates = self.query_executions(
            &format!(
                "SELECT {} FROM executions
                 WHERE status = 'pending'
                   AND auto_approve_at IS NOT NULL AND auto_approve_at <= ?1
                   AND (claim_owner IS NULL OR claim_until <= ?1 OR claim_owner = ?2)
                 ORDER BY auto_approve_at
                 LIMIT ?3",
                EXECUTION_COLUMNS
            ),
            params![now_ms, worker, limit as i64],
        )?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut execution in candidates {
            let changed = self.conn.execute(
                "UPDATE executions SET claim_owner = ?2, claim_until = ?3
                 WHERE id = ?1 AND status = 'pending'
                   AND (claim_owner IS NULL OR claim_until <= ?4 OR claim_owner = ?2)",
                params![execution.id.to_string(), worker, to_millis(until), now_ms],
            )?;
            if changed == 1 {
                execution.claim = Some(Claim {
                    owner: worker.to_string(),
                    until,
                });
                claimed.push(execution);
            }
        }
        Ok(claimed)
    }

    fn release_claim(&mut self, id: ExecutionId, worker: &str) -> Result<(), MarketError> {
        self.conn.execute(
            "UPDATE executions SET claim_owner = NULL, claim_until = NULL
             WHERE id = ?1 AND claim_owner = ?2",
            params![id.to_string(), worker],
        )?;
        Ok(())
    }

    fn ledger_totals(&self) -> Result<LedgerTotals, MarketError> {
        let deposits: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM ledger_entries WHERE kind = ?1",
            params![TransactionKind::Deposit.as_str()],
            |row| row.get(0),
        )?;
        let balances: i64 =
            self.conn
                .query_row("SELECT COALESCE(SUM(balance), 0) FROM accounts", [], |row| row.get(0))?;
        let escrow: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(escrowed_amount), 0) FROM tasks",
            [],
            |row| row.get(0),
        )?;
        Ok(LedgerTotals {
            deposits,
            balances,
            escrow,
        })
    }
}

fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("taskmarket.db")
}
