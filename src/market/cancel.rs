//! Cancellation and expiry: returning unspent escrow to the creator.

use super::execution::reject_pending_in;
use super::{Committed, DomainEvent, MarketError, Marketplace, TxContext};
use crate::ledger::Ledger;
use crate::reward::cancellation_refund;
use crate::store::UnitOfWork;
use crate::task::{Actor, CancellationRecord, Task, TaskId, TaskStatus};

const CANCELLED_REASON: &str = "task cancelled";

fn cancel_in(
    uow: &mut dyn UnitOfWork,
    ctx: &TxContext,
    task_id: TaskId,
    actor: &Actor,
    reason: &str,
) -> Result<Committed<Task>, MarketError> {
    let mut task = uow
        .task(task_id)?
        .ok_or_else(|| MarketError::not_found("task", task_id))?;
    if !actor.may_moderate(&task.creator_id) {
        return Err(MarketError::Unauthorized(format!(
            "{} may not cancel task {}",
            actor.label(),
            task_id
        )));
    }
    if !task.status.accepts_approvals() {
        return Err(MarketError::invalid_state(format!(
            "task {} is already {}",
            task_id,
            task.status.as_str()
        )));
    }

    let mut events = reject_pending_in(uow, ctx, task_id, None, actor, CANCELLED_REASON)?;

    let remaining = task.expected_escrow();
    if remaining != task.escrowed_amount {
        return Err(MarketError::Invariant(format!(
            "task {} holds {} in escrow, counters say {}",
            task_id, task.escrowed_amount, remaining
        )));
    }
    let split = cancellation_refund(remaining, ctx.config.cancel_penalty_bps)?;
    let memo = format!("cancellation of task {}", task_id);
    if split.refund > 0 {
        uow.refund(&task.creator_id, split.refund, task_id, &memo)?;
    }
    if split.forfeited > 0 {
        uow.penalty(split.forfeited, task_id, &memo)?;
    }

    let expected_version = task.touch(ctx.now);
    task.status = TaskStatus::Cancelled;
    task.escrowed_amount = 0;
    task.cancellation = Some(CancellationRecord {
        reason: reason.to_string(),
        refund_amount: split.refund,
        forfeited_amount: split.forfeited,
        cancelled_at: ctx.now,
    });
    task.check_invariants().map_err(MarketError::Invariant)?;
    uow.update_task(&task, expected_version)?;

    events.push(DomainEvent::TaskCancelled {
        task_id,
        creator_id: task.creator_id.clone(),
        refund_amount: split.refund,
        forfeited_amount: split.forfeited,
    });
    Ok(Committed::new(task, events))
}

fn expire_in(uow: &mut dyn UnitOfWork, ctx: &TxContext, limit: usize) -> Result<Committed<Vec<TaskId>>, MarketError> {
    let mut expired = Vec::new();
    let mut events = Vec::new();
    for mut task in uow.expirable_tasks(ctx.now, limit)? {
        let remaining = task.escrowed_amount;
        if remaining > 0 {
            let memo = format!("expiry of task {}", task.id);
            uow.refund(&task.creator_id, remaining, task.id, &memo)?;
        }
        let expected_version = task.touch(ctx.now);
        task.status = TaskStatus::Expired;
        task.escrowed_amount = 0;
        task.check_invariants().map_err(MarketError::Invariant)?;
        uow.update_task(&task, expected_version)?;

        events.push(DomainEvent::TaskExpired {
            task_id: task.id,
            creator_id: task.creator_id.clone(),
            refund_amount: remaining,
        });
        expired.push(task.id);
    }
    Ok(Committed::new(expired, events))
}

impl Marketplace {
    /// Cancel an active or paused task.
    ///
    /// Pending executions are rejected without appeal and the remaining
    /// escrow is refunded minus the cancellation penalty.
    pub async fn cancel(&self, task_id: TaskId, actor: &Actor, reason: &str) -> Result<Task, MarketError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(MarketError::validation("a cancellation needs a reason"));
        }
        let committed = self
            .with_retry("cancel", || {
                let actor = actor.clone();
                let reason = reason.to_string();
                self.run(move |uow, ctx| cancel_in(uow, ctx, task_id, &actor, &reason))
            })
            .await?;
        let task = self.finish(committed);
        if let Some(record) = &task.cancellation {
            tracing::info!(
                task_id = %task_id,
                actor = %actor.label(),
                refund = record.refund_amount,
                forfeited = record.forfeited_amount,
                "Task cancelled"
            );
        }
        Ok(task)
    }

    /// Expire up to `limit` tasks past their deadline, refunding their escrow.
    pub async fn expire_due_tasks(&self, limit: usize) -> Result<Vec<TaskId>, MarketError> {
        let committed = self
            .with_retry("expire", || self.run(move |uow, ctx| expire_in(uow, ctx, limit)))
            .await?;
        let expired = self.finish(committed);
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired tasks");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::super::harness::{harness, harness_with, manual_spec};
    use super::*;
    use crate::config::MarketConfig;
    use crate::ledger::UserId;
    use crate::market::Clock;
    use crate::reward::Level;
    use crate::store::SqliteMarketStore;
    use crate::task::ExecutionStatus;

    #[tokio::test]
    async fn test_scenario_d_cancel_refunds_minus_penalty() {
        let h = harness();
        let creator = h.user("creator", Level::Bronze, 10_000).await;
        let task = h.market.create_task(&creator, manual_spec(50, 10)).await.unwrap();
        // 500 budget + 35 commission.
        assert_eq!(h.market.balance(&creator).await.unwrap(), 10_000 - 535);

        let actor = Actor::User(creator.clone());
        for i in 0..2 {
            let exec = h.user(&format!("exec-{}", i), Level::Bronze, 0).await;
            let execution = h.market.submit(&exec, task.id, None).await.unwrap().execution;
            h.market.approve(execution.id, actor.clone()).await.unwrap();
        }
        let waiting = h.user("waiting", Level::Bronze, 0).await;
        let pending = h.market.submit(&waiting, task.id, None).await.unwrap().execution;

        let cancelled = h.market.cancel(task.id, &actor, "campaign over").await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(cancelled.escrowed_amount, 0);
        let record = cancelled.cancellation.unwrap();
        // 400 remaining, 10% forfeited.
        assert_eq!(record.refund_amount, 360);
        assert_eq!(record.forfeited_amount, 40);
        assert_eq!(h.market.balance(&creator).await.unwrap(), 10_000 - 535 + 360);

        let pending = h.market.get_execution(pending.id).await.unwrap();
        assert_eq!(pending.status, ExecutionStatus::Rejected);
        assert_eq!(pending.appeal_deadline, None);
        assert!(matches!(
            h.market.approve(pending.id, actor.clone()).await,
            Err(MarketError::InvalidStateTransition(_))
        ));
        h.assert_consistent(&[&creator, &waiting]).await;
        h.assert_conserved().await;
    }

    #[tokio::test]
    async fn test_cancel_guards() {
        let h = harness();
        let creator = h.user("creator", Level::Bronze, 10_000).await;
        let task = h.market.create_task(&creator, manual_spec(10, 2)).await.unwrap();

        assert!(matches!(
            h.market
                .cancel(task.id, &Actor::User(UserId::new("stranger")), "mine now")
                .await,
            Err(MarketError::Unauthorized(_))
        ));
        assert!(matches!(
            h.market.cancel(task.id, &Actor::User(creator.clone()), " ").await,
            Err(MarketError::Validation(_))
        ));

        let moderator = Actor::Moderator(UserId::new("mod"));
        h.market.cancel(task.id, &moderator, "policy violation").await.unwrap();
        assert!(matches!(
            h.market.cancel(task.id, &moderator, "again").await,
            Err(MarketError::InvalidStateTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_paused_task_can_be_cancelled() {
        let h = harness();
        let creator = h.user("creator", Level::Gold, 10_000).await;
        let task = h.market.create_task(&creator, manual_spec(10, 2)).await.unwrap();
        h.market.pause(task.id, &creator).await.unwrap();
        let cancelled = h
            .market
            .cancel(task.id, &Actor::User(creator), "no longer needed")
            .await
            .unwrap();
        assert_eq!(cancelled.cancellation.unwrap().refund_amount, 18);
        h.assert_conserved().await;
    }

    #[tokio::test]
    async fn test_expiry_refunds_full_escrow() {
        let h = harness();
        let creator = h.user("creator", Level::Bronze, 10_000).await;
        let mut spec = manual_spec(20, 5);
        spec.expires_at = Some(h.clock.now() + Duration::hours(2));
        let task = h.market.create_task(&creator, spec).await.unwrap();

        let exec = h.user("exec", Level::Bronze, 0).await;
        let execution = h.market.submit(&exec, task.id, None).await.unwrap().execution;
        h.market
            .approve(execution.id, Actor::User(creator.clone()))
            .await
            .unwrap();

        assert!(h.market.expire_due_tasks(10).await.unwrap().is_empty());
        h.clock.advance(Duration::hours(3));
        let expired = h.market.expire_due_tasks(10).await.unwrap();
        assert_eq!(expired, vec![task.id]);

        let task = h.market.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Expired);
        assert_eq!(task.escrowed_amount, 0);
        // 100 + 7 commission paid, 20 spent, 80 back.
        assert_eq!(h.market.balance(&creator).await.unwrap(), 10_000 - 107 + 80);
        assert!(h.market.expire_due_tasks(10).await.unwrap().is_empty());
        h.assert_conserved().await;
    }

    #[tokio::test]
    async fn test_expiry_waits_for_pending_executions() {
        let h = harness();
        let creator = h.user("creator", Level::Bronze, 10_000).await;
        let mut spec = manual_spec(20, 5);
        spec.expires_at = Some(h.clock.now() + Duration::hours(2));
        let task = h.market.create_task(&creator, spec).await.unwrap();
        let exec = h.user("exec", Level::Bronze, 0).await;
        let execution = h.market.submit(&exec, task.id, None).await.unwrap().execution;

        h.clock.advance(Duration::hours(3));
        assert!(h.market.expire_due_tasks(10).await.unwrap().is_empty());

        h.market
            .reject(execution.id, Actor::User(creator), "no proof")
            .await
            .unwrap();
        assert_eq!(h.market.expire_due_tasks(10).await.unwrap(), vec![task.id]);
    }

    /// Cancellation racing approvals through two connections to one
    /// database: every execution ends either paid or rejected by the cancel,
    /// and money is conserved.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_races_approvals() {
        let dir = tempfile::tempdir().unwrap();
        let first = Arc::new(SqliteMarketStore::new(dir.path().to_path_buf()).await.unwrap());
        let second = Arc::new(SqliteMarketStore::new(dir.path().to_path_buf()).await.unwrap());
        let h = harness_with(first, MarketConfig::default());
        let other = Arc::new(
            Marketplace::new(second, MarketConfig::default())
                .with_clock(h.clock.clone() as Arc<dyn Clock>),
        );
        let creator = h.user("creator", Level::Bronze, 100_000).await;
        let task = h.market.create_task(&creator, manual_spec(100, 20)).await.unwrap();
        let actor = Actor::User(creator.clone());

        let mut executions = Vec::new();
        for i in 0..8 {
            let exec = h.user(&format!("exec-{}", i), Level::Bronze, 0).await;
            executions.push(h.market.submit(&exec, task.id, None).await.unwrap().execution);
        }

        let mut handles = Vec::new();
        for (i, execution) in executions.iter().enumerate() {
            let market = if i % 2 == 0 { h.market.clone() } else { other.clone() };
            let actor = actor.clone();
            let id = execution.id;
            handles.push(tokio::spawn(async move { market.approve(id, actor).await }));
        }
        let cancel = {
            let market = other.clone();
            let actor = actor.clone();
            tokio::spawn(async move { market.cancel(task.id, &actor, "stop").await })
        };

        let mut approved = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => approved += 1,
                Err(MarketError::InvalidStateTransition(_)) | Err(MarketError::AlreadyProcessed(_)) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        let cancelled = cancel.await.unwrap().unwrap();
        let record = cancelled.cancellation.unwrap();
        assert_eq!(cancelled.completed_count, approved);
        assert_eq!(cancelled.escrowed_amount, 0);
        assert_eq!(
            record.refund_amount + record.forfeited_amount,
            100 * (20 - approved as i64)
        );

        let mut paid = 0;
        for execution in &executions {
            let stored = h.market.get_execution(execution.id).await.unwrap();
            let balance = h.market.balance(&stored.executor_id).await.unwrap();
            match stored.status {
                ExecutionStatus::Approved => {
                    assert_eq!(balance, 100);
                    assert!(stored.rejection_reason.is_none());
                    paid += 1;
                }
                ExecutionStatus::Rejected => {
                    assert_eq!(balance, 0);
                    assert_eq!(stored.rejection_reason.as_deref(), Some(CANCELLED_REASON));
                    assert!(stored.appeal_deadline.is_none());
                }
                other => panic!("execution left {:?}", other),
            }
        }
        assert_eq!(paid, approved);
        h.assert_conserved().await;
    }
}
