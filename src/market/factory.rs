//! Task factory and eligibility filter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Committed, DomainEvent, MarketError, Marketplace, TxContext};
use crate::config::MarketConfig;
use crate::ledger::UserId;
use crate::reward::{task_cost, Level};
use crate::store::{EligibilityQuery, PageCursor, UnitOfWork};
use crate::task::{Task, TaskId, TaskSpec, TaskStatus, TaskType};
use crate::util::{next_utc_midnight, start_of_utc_day};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;
const MAX_TITLE_CHARS: usize = 200;

/// Page request for the eligible-task listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageRequest {
    /// Opaque token from a previous page's `next_cursor`.
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub next_cursor: Option<String>,
}

fn validate_spec(config: &MarketConfig, spec: &TaskSpec, now: DateTime<Utc>) -> Result<i64, MarketError> {
    let title = spec.title.trim();
    if title.is_empty() {
        return Err(MarketError::validation("title must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(MarketError::validation(format!(
            "title must be at most {} characters",
            MAX_TITLE_CHARS
        )));
    }
    if spec.reward < config.min_reward || spec.reward > config.max_reward {
        return Err(MarketError::validation(format!(
            "reward {} outside {}..={}",
            spec.reward, config.min_reward, config.max_reward
        )));
    }
    if spec.target_count < config.min_target_count || spec.target_count > config.max_target_count {
        return Err(MarketError::validation(format!(
            "target count {} outside {}..={}",
            spec.target_count, config.min_target_count, config.max_target_count
        )));
    }
    let window = spec
        .auto_approve_secs
        .unwrap_or(config.default_auto_approve_secs);
    if window < config.min_auto_approve_secs || window > config.max_auto_approve_secs {
        return Err(MarketError::validation(format!(
            "auto-approve window {}s outside {}..={}s",
            window, config.min_auto_approve_secs, config.max_auto_approve_secs
        )));
    }
    if let Some(expires_at) = spec.expires_at {
        if expires_at <= now {
            return Err(MarketError::validation("expires_at must be in the future"));
        }
    }
    Ok(window)
}

fn create_in(
    uow: &mut dyn UnitOfWork,
    ctx: &TxContext,
    creator_id: &UserId,
    spec: TaskSpec,
    auto_approve_secs: i64,
) -> Result<Committed<Task>, MarketError> {
    let creator = uow
        .user(creator_id)?
        .ok_or_else(|| MarketError::not_found("user", creator_id))?;

    let limit = ctx.config.daily_quotas.for_level(creator.level);
    let created_today = uow.count_tasks_created_since(creator_id, start_of_utc_day(ctx.now))?;
    if created_today >= limit {
        return Err(MarketError::QuotaExceeded {
            limit,
            resets_at: next_utc_midnight(ctx.now),
        });
    }

    let cost = task_cost(spec.reward, spec.target_count, creator.level)?;
    let task = Task {
        id: TaskId::new(),
        creator_id: creator_id.clone(),
        task_type: spec.task_type,
        title: spec.title.trim().to_string(),
        target_ref: spec.target_ref,
        reward: spec.reward,
        target_count: spec.target_count,
        completed_count: 0,
        status: TaskStatus::Active,
        min_executor_level: spec.min_executor_level,
        verification_mode: spec.verification_mode,
        auto_approve_secs,
        expires_at: spec.expires_at,
        escrowed_amount: cost.budget,
        commission: cost.commission,
        boosted: spec.boosted,
        priority: spec.priority,
        version: 0,
        created_at: ctx.now,
        updated_at: ctx.now,
        completed_at: None,
        cancellation: None,
    };

    uow.reserve(creator_id, cost.total, task.id)?;
    if cost.commission > 0 {
        uow.commission(cost.commission, task.id)?;
    }
    task.check_invariants().map_err(MarketError::Invariant)?;
    uow.insert_task(&task)?;

    let event = DomainEvent::TaskCreated {
        task_id: task.id,
        creator_id: creator_id.clone(),
        reward: task.reward,
        target_count: task.target_count,
        escrowed_amount: task.escrowed_amount,
    };
    Ok(Committed::new(task, vec![event]))
}

/// Flip ACTIVE <-> PAUSED. Creator only.
fn set_paused_in(
    uow: &mut dyn UnitOfWork,
    ctx: &TxContext,
    task_id: TaskId,
    actor: &UserId,
    paused: bool,
) -> Result<Committed<Task>, MarketError> {
    let mut task = uow
        .task(task_id)?
        .ok_or_else(|| MarketError::not_found("task", task_id))?;
    if &task.creator_id != actor {
        return Err(MarketError::Unauthorized(format!(
            "only the creator may {} task {}",
            if paused { "pause" } else { "resume" },
            task_id
        )));
    }
    let (from, to) = if paused {
        (TaskStatus::Active, TaskStatus::Paused)
    } else {
        (TaskStatus::Paused, TaskStatus::Active)
    };
    if task.status != from {
        return Err(MarketError::invalid_state(format!(
            "task {} is {}, expected {}",
            task_id,
            task.status.as_str(),
            from.as_str()
        )));
    }
    let expected = task.touch(ctx.now);
    task.status = to;
    uow.update_task(&task, expected)?;

    let event = if paused {
        DomainEvent::TaskPaused { task_id }
    } else {
        DomainEvent::TaskResumed { task_id }
    };
    Ok(Committed::new(task, vec![event]))
}

impl Marketplace {
    /// Validate, charge and persist a new ACTIVE task.
    ///
    /// The creator pays `reward * target_count` into escrow plus the level
    /// commission, in the same transaction that counts the daily quota.
    pub async fn create_task(&self, creator_id: &UserId, spec: TaskSpec) -> Result<Task, MarketError> {
        let window = validate_spec(&self.config, &spec, self.context().now)?;
        let committed = self
            .with_retry("create_task", || {
                let creator_id = creator_id.clone();
                let spec = spec.clone();
                self.run(move |uow, ctx| create_in(uow, ctx, &creator_id, spec, window))
            })
            .await?;

        let task = self.finish(committed);
        tracing::info!(
            task_id = %task.id,
            creator = %task.creator_id,
            reward = task.reward,
            target_count = task.target_count,
            escrow = task.escrowed_amount,
            commission = task.commission,
            "Task created"
        );
        Ok(task)
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task, MarketError> {
        self.run(move |uow, _| uow.task(task_id))
            .await?
            .ok_or_else(|| MarketError::not_found("task", task_id))
    }

    /// Tasks `executor_id` may take, boosted first, then priority, then newest.
    pub async fn list_eligible(
        &self,
        executor_id: &UserId,
        level: Level,
        task_type: Option<TaskType>,
        page: PageRequest,
    ) -> Result<TaskPage, MarketError> {
        let limit = page
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let after = page.cursor.as_deref().map(PageCursor::decode).transpose()?;
        let query = EligibilityQuery {
            executor_id: executor_id.clone(),
            level,
            task_type,
            now: self.context().now,
            after,
            // One extra row tells whether another page exists.
            limit: limit + 1,
        };

        let mut tasks = self.run(move |uow, _| uow.eligible_tasks(&query)).await?;
        let next_cursor = if tasks.len() > limit {
            tasks.truncate(limit);
            tasks
                .last()
                .map(|task| PageCursor::after(task).encode())
                .transpose()?
        } else {
            None
        };
        tracing::debug!(executor = %executor_id, count = tasks.len(), "Listed eligible tasks");
        Ok(TaskPage { tasks, next_cursor })
    }

    pub async fn pause(&self, task_id: TaskId, actor: &UserId) -> Result<Task, MarketError> {
        self.toggle_pause(task_id, actor, true).await
    }

    pub async fn resume(&self, task_id: TaskId, actor: &UserId) -> Result<Task, MarketError> {
        self.toggle_pause(task_id, actor, false).await
    }

    async fn toggle_pause(&self, task_id: TaskId, actor: &UserId, paused: bool) -> Result<Task, MarketError> {
        let committed = self
            .with_retry(if paused { "pause" } else { "resume" }, || {
                let actor = actor.clone();
                self.run(move |uow, ctx| set_paused_in(uow, ctx, task_id, &actor, paused))
            })
            .await?;
        let task = self.finish(committed);
        tracing::info!(task_id = %task_id, status = task.status.as_str(), "Task status changed");
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::super::harness::{harness, manual_spec};
    use super::*;
    use crate::ledger::TransactionKind;
    use crate::market::Clock;

    #[tokio::test]
    async fn test_scenario_a_bronze_creator_pays_commission() {
        let h = harness();
        let creator = h.user("creator", Level::Bronze, 2000).await;

        let task = h.market.create_task(&creator, manual_spec(100, 10)).await.unwrap();
        assert_eq!(task.escrowed_amount, 1000);
        assert_eq!(task.commission, 70);
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(h.market.balance(&creator).await.unwrap(), 2000 - 1070);
        assert_eq!(h.market.balance(&UserId::platform()).await.unwrap(), 70);

        let history = h.market.transactions(&creator).await.unwrap();
        let reserve = history
            .iter()
            .find(|tx| tx.kind == TransactionKind::Reserve)
            .unwrap();
        assert_eq!(reserve.amount, -1070);
        assert_eq!(reserve.task_id, Some(task.id));
        h.assert_consistent(&[&creator]).await;
        h.assert_conserved().await;
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_no_trace() {
        let h = harness();
        let creator = h.user("creator", Level::Bronze, 1069).await;
        let err = h
            .market
            .create_task(&creator, manual_spec(100, 10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MarketError::InsufficientFunds { needed: 1070, available: 1069, .. }
        ));
        assert_eq!(h.market.balance(&creator).await.unwrap(), 1069);
        assert_eq!(h.market.balance(&UserId::platform()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_validation_bounds() {
        let h = harness();
        let creator = h.user("creator", Level::Gold, 100_000).await;

        let mut spec = manual_spec(0, 10);
        assert!(matches!(
            h.market.create_task(&creator, spec.clone()).await,
            Err(MarketError::Validation(_))
        ));
        spec.reward = 10;
        spec.target_count = 0;
        assert!(h.market.create_task(&creator, spec.clone()).await.is_err());
        spec.target_count = 5;
        spec.title = "x".repeat(201);
        assert!(h.market.create_task(&creator, spec.clone()).await.is_err());
        spec.title = "ok".to_string();
        spec.expires_at = Some(h.clock.now() - Duration::minutes(1));
        assert!(h.market.create_task(&creator, spec.clone()).await.is_err());
        spec.expires_at = None;
        spec.auto_approve_secs = Some(30 * 24 * 3600);
        assert!(h.market.create_task(&creator, spec).await.is_err());
    }

    #[tokio::test]
    async fn test_daily_quota_reports_reset_time() {
        let h = harness();
        let creator = h.user("creator", Level::Bronze, 100_000).await;
        for _ in 0..3 {
            h.market.create_task(&creator, manual_spec(10, 1)).await.unwrap();
        }
        let err = h
            .market
            .create_task(&creator, manual_spec(10, 1))
            .await
            .unwrap_err();
        match err {
            MarketError::QuotaExceeded { limit, resets_at } => {
                assert_eq!(limit, 3);
                assert_eq!(resets_at, next_utc_midnight(h.clock.now()));
            }
            other => panic!("expected quota error, got {:?}", other),
        }

        // A new UTC day resets the window.
        h.clock.advance(Duration::days(1));
        assert!(h.market.create_task(&creator, manual_spec(10, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_eligibility_filters() {
        let h = harness();
        let creator = h.user("creator", Level::Premium, 100_000).await;
        let exec = h.user("exec", Level::Silver, 0).await;

        // Newer tasks list first; distinct instants keep the order fixed.
        let open = h.market.create_task(&creator, manual_spec(10, 2)).await.unwrap();
        h.clock.advance(Duration::seconds(1));
        let mut gold_only = manual_spec(10, 2);
        gold_only.min_executor_level = Level::Gold;
        h.market.create_task(&creator, gold_only).await.unwrap();
        h.clock.advance(Duration::seconds(1));
        let mut expiring = manual_spec(10, 2);
        expiring.expires_at = Some(h.clock.now() + Duration::minutes(5));
        let expiring = h.market.create_task(&creator, expiring).await.unwrap();
        h.clock.advance(Duration::seconds(1));
        let paused = h.market.create_task(&creator, manual_spec(10, 2)).await.unwrap();
        h.market.pause(paused.id, &creator).await.unwrap();

        let page = h
            .market
            .list_eligible(&exec, Level::Silver, None, PageRequest::default())
            .await
            .unwrap();
        let ids: Vec<TaskId> = page.tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![expiring.id, open.id]);

        // Once the executor has an open execution the task disappears.
        h.market.submit(&exec, open.id, None).await.unwrap();
        h.clock.advance(Duration::minutes(10));
        let page = h
            .market
            .list_eligible(&exec, Level::Silver, None, PageRequest::default())
            .await
            .unwrap();
        assert!(page.tasks.is_empty());

        // The creator never sees their own tasks.
        let page = h
            .market
            .list_eligible(&creator, Level::Premium, Some(TaskType::Subscribe), PageRequest::default())
            .await
            .unwrap();
        assert!(page.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_pagination_stable_under_inserts() {
        let h = harness();
        let creator = h.user("creator", Level::Premium, 1_000_000).await;
        let exec = h.user("exec", Level::Bronze, 0).await;

        let mut created = Vec::new();
        for i in 0..7 {
            let mut spec = manual_spec(10, 1);
            spec.priority = i % 3;
            created.push(h.market.create_task(&creator, spec).await.unwrap().id);
            h.clock.advance(Duration::seconds(1));
        }

        let page_request = |cursor: Option<String>| PageRequest {
            cursor,
            limit: Some(3),
        };
        let first = h
            .market
            .list_eligible(&exec, Level::Bronze, None, page_request(None))
            .await
            .unwrap();
        assert_eq!(first.tasks.len(), 3);

        // Inserted between page fetches: sorts ahead of the cursor.
        let mut late = manual_spec(10, 1);
        late.priority = 2;
        h.market.create_task(&creator, late).await.unwrap();

        let mut seen: Vec<TaskId> = first.tasks.iter().map(|t| t.id).collect();
        let mut cursor = first.next_cursor;
        while let Some(token) = cursor {
            let page = h
                .market
                .list_eligible(&exec, Level::Bronze, None, page_request(Some(token)))
                .await
                .unwrap();
            seen.extend(page.tasks.iter().map(|t| t.id));
            cursor = page.next_cursor;
        }

        let mut unique = seen.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), seen.len(), "duplicate rows across pages");
        for id in &created {
            assert!(seen.contains(id), "task {} skipped", id);
        }
    }

    #[tokio::test]
    async fn test_pause_and_resume_are_creator_only() {
        let h = harness();
        let creator = h.user("creator", Level::Bronze, 10_000).await;
        let other = h.user("other", Level::Bronze, 0).await;
        let task = h.market.create_task(&creator, manual_spec(10, 5)).await.unwrap();

        assert!(matches!(
            h.market.pause(task.id, &other).await,
            Err(MarketError::Unauthorized(_))
        ));
        let paused = h.market.pause(task.id, &creator).await.unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);
        assert!(matches!(
            h.market.pause(task.id, &creator).await,
            Err(MarketError::InvalidStateTransition(_))
        ));
        let resumed = h.market.resume(task.id, &creator).await.unwrap();
        assert_eq!(resumed.status, TaskStatus::Active);
        assert_eq!(resumed.version, 2);
    }

    #[tokio::test]
    async fn test_malformed_cursor_is_validation_error() {
        let h = harness();
        let exec = h.user("exec", Level::Bronze, 0).await;
        let err = h
            .market
            .list_eligible(
                &exec,
                Level::Bronze,
                None,
                PageRequest {
                    cursor: Some("%%%".to_string()),
                    limit: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));
    }
}
