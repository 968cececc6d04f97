//! Execution state machine: submission, verification, moderation and appeal.
//!
//! `Pending -> Approved | Rejected`, both terminal. Every transition is a
//! compare-and-swap on the execution status inside the same transaction as
//! its ledger postings and task counter update.

use chrono::Duration;
use serde::Serialize;

use super::{Committed, DomainEvent, MarketError, Marketplace, TxContext};
use crate::config::RewardLevelPolicy;
use crate::ledger::{Ledger, UserId};
use crate::reward::apply_multiplier;
use crate::store::UnitOfWork;
use crate::task::{
    verify_with_timeout, Actor, Execution, ExecutionId, ExecutionStatus, Task, TaskId, TaskStatus,
    VerificationMode, VerificationOutcome,
};

/// Rejection reason for a failed verification that gave none.
const VERIFICATION_FAILED: &str = "verification failed";
const CAPACITY_REACHED: &str = "task capacity reached";

/// What `submit` produced.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    /// The execution after any verification was applied.
    pub execution: Execution,
    /// Verifier verdict, for AUTO tasks.
    pub verification: Option<VerificationOutcome>,
}

/// Effects of an approval.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalReceipt {
    pub execution: Execution,
    pub task: Task,
    pub credited_amount: i64,
    /// Platform-funded part of the credit.
    pub bonus: i64,
    pub task_completed: bool,
}

fn load(uow: &dyn UnitOfWork, id: ExecutionId) -> Result<(Execution, Task), MarketError> {
    let execution = uow
        .execution(id)?
        .ok_or_else(|| MarketError::not_found("execution", id))?;
    let task = uow
        .task(execution.task_id)?
        .ok_or_else(|| MarketError::not_found("task", execution.task_id))?;
    Ok((execution, task))
}

fn authorize(actor: &Actor, task: &Task) -> Result<(), MarketError> {
    if actor.may_moderate(&task.creator_id) {
        Ok(())
    } else {
        Err(MarketError::Unauthorized(format!(
            "{} may not moderate task {}",
            actor.label(),
            task.id
        )))
    }
}

fn ensure_pending(execution: &Execution) -> Result<(), MarketError> {
    if execution.status == ExecutionStatus::Pending {
        Ok(())
    } else {
        Err(MarketError::AlreadyProcessed(format!(
            "execution {} is already {}",
            execution.id,
            execution.status.as_str()
        )))
    }
}

fn rejected_event(execution: &Execution) -> DomainEvent {
    DomainEvent::ExecutionRejected {
        execution_id: execution.id,
        task_id: execution.task_id,
        executor_id: execution.executor_id.clone(),
        reason: execution.rejection_reason.clone().unwrap_or_default(),
        appealable: execution.appeal_deadline.is_some(),
    }
}

/// Reject every other pending execution of a task, foreclosing appeal.
pub(crate) fn reject_pending_in(
    uow: &mut dyn UnitOfWork,
    ctx: &TxContext,
    task_id: TaskId,
    except: Option<ExecutionId>,
    actor: &Actor,
    reason: &str,
) -> Result<Vec<DomainEvent>, MarketError> {
    let mut events = Vec::new();
    for mut pending in uow.executions_for_task(task_id, Some(ExecutionStatus::Pending))? {
        if Some(pending.id) == except {
            continue;
        }
        pending.mark_rejected(actor, reason, ctx.now, None);
        uow.update_execution(&pending, ExecutionStatus::Pending)?;
        events.push(rejected_event(&pending));
    }
    Ok(events)
}

fn submit_in(
    uow: &mut dyn UnitOfWork,
    ctx: &TxContext,
    executor_id: &UserId,
    task_id: TaskId,
    proof_ref: Option<String>,
) -> Result<Committed<(Execution, Task)>, MarketError> {
    let task = uow
        .task(task_id)?
        .ok_or_else(|| MarketError::not_found("task", task_id))?;
    let executor = uow
        .user(executor_id)?
        .ok_or_else(|| MarketError::not_found("user", executor_id))?;

    if task.status != TaskStatus::Active {
        return Err(MarketError::invalid_state(format!(
            "task {} is {}",
            task_id,
            task.status.as_str()
        )));
    }
    if task.is_expired_at(ctx.now) {
        return Err(MarketError::invalid_state(format!("task {} has expired", task_id)));
    }
    if &task.creator_id == executor_id {
        return Err(MarketError::validation("creators cannot execute their own tasks"));
    }
    if executor.level < task.min_executor_level {
        return Err(MarketError::validation(format!(
            "task {} requires level {}, executor is {}",
            task_id, task.min_executor_level, executor.level
        )));
    }
    if let Some(open) = uow.open_execution(task_id, executor_id)? {
        return Err(MarketError::invalid_state(format!(
            "execution {} of task {} is already {}",
            open.id,
            task_id,
            open.status.as_str()
        )));
    }
    if task.is_full() {
        return Err(MarketError::invalid_state(CAPACITY_REACHED));
    }

    let execution = Execution {
        id: ExecutionId::new(),
        task_id,
        executor_id: executor_id.clone(),
        status: ExecutionStatus::Pending,
        reward_snapshot: task.reward,
        level_snapshot: executor.level,
        credited_amount: None,
        submitted_at: ctx.now,
        verified_at: None,
        verifier_id: None,
        proof_ref,
        rejection_reason: None,
        appeal_deadline: None,
        auto_approve_at: Some(ctx.now + task.auto_approve_window()),
        appeal_of: None,
        appealed: false,
        claim: None,
    };
    uow.insert_execution(&execution)?;

    let event = DomainEvent::ExecutionSubmitted {
        execution_id: execution.id,
        task_id,
        executor_id: executor_id.clone(),
        creator_id: task.creator_id.clone(),
    };
    Ok(Committed::new((execution, task), vec![event]))
}

/// Approve a pending execution: credit, count, maybe complete the task.
///
/// `sweep_worker` is set when the auto-approval sweep acts; it must hold the
/// execution's claim.
pub(crate) fn approve_in(
    uow: &mut dyn UnitOfWork,
    ctx: &TxContext,
    execution_id: ExecutionId,
    actor: &Actor,
    sweep_worker: Option<&str>,
) -> Result<Committed<ApprovalReceipt>, MarketError> {
    let (mut execution, mut task) = load(uow, execution_id)?;
    authorize(actor, &task)?;

    if !task.status.accepts_approvals() {
        return Err(MarketError::invalid_state(format!(
            "task {} is {}",
            task.id,
            task.status.as_str()
        )));
    }
    ensure_pending(&execution)?;
    if let Some(worker) = sweep_worker {
        let held = execution
            .claim
            .as_ref()
            .map(|claim| claim.owner == worker)
            .unwrap_or(false);
        if !held {
            return Err(MarketError::invalid_state(format!(
                "{} does not hold the claim on execution {}",
                worker, execution_id
            )));
        }
    }
    if task.is_full() {
        return Err(MarketError::invalid_state(CAPACITY_REACHED));
    }

    let level = match ctx.config.reward_level_policy {
        RewardLevelPolicy::AtSubmission => execution.level_snapshot,
        RewardLevelPolicy::AtApproval => uow
            .user(&execution.executor_id)?
            .map(|profile| profile.level)
            .ok_or_else(|| MarketError::not_found("user", &execution.executor_id))?,
    };
    let base = execution.reward_snapshot;
    let credited = apply_multiplier(base, level)?;
    let bonus = credited - base;
    if task.escrowed_amount < base {
        return Err(MarketError::Invariant(format!(
            "task {} escrow {} cannot cover reward {}",
            task.id, task.escrowed_amount, base
        )));
    }

    execution.mark_approved(actor, credited, ctx.now);
    uow.update_execution(&execution, ExecutionStatus::Pending)?;

    let memo = format!("reward for task {}", task.id);
    let posting = uow.credit(&execution.executor_id, credited, task.id, execution.id, &memo)?;
    if posting.is_replay() {
        tracing::warn!(execution_id = %execution.id, "Credit already posted; not paying twice");
    }
    if bonus > 0 {
        uow.bonus(bonus, task.id, execution.id)?;
    }

    let expected_version = task.touch(ctx.now);
    task.completed_count += 1;
    task.escrowed_amount -= base;

    let mut events = vec![DomainEvent::ExecutionApproved {
        execution_id: execution.id,
        task_id: task.id,
        executor_id: execution.executor_id.clone(),
        credited_amount: credited,
        actor: actor.label(),
    }];

    let task_completed = task.is_full();
    if task_completed {
        if task.escrowed_amount != 0 {
            return Err(MarketError::Invariant(format!(
                "task {} completed with {} left in escrow",
                task.id, task.escrowed_amount
            )));
        }
        task.status = TaskStatus::Completed;
        task.completed_at = Some(ctx.now);
        events.extend(reject_pending_in(
            uow,
            ctx,
            task.id,
            Some(execution.id),
            &Actor::System,
            CAPACITY_REACHED,
        )?);
        events.push(DomainEvent::TaskCompleted {
            task_id: task.id,
            creator_id: task.creator_id.clone(),
        });
    }
    task.check_invariants().map_err(MarketError::Invariant)?;
    uow.update_task(&task, expected_version)?;

    Ok(Committed::new(
        ApprovalReceipt {
            execution,
            task,
            credited_amount: credited,
            bonus,
            task_completed,
        },
        events,
    ))
}

pub(crate) fn reject_in(
    uow: &mut dyn UnitOfWork,
    ctx: &TxContext,
    execution_id: ExecutionId,
    actor: &Actor,
    reason: &str,
) -> Result<Committed<Execution>, MarketError> {
    let (mut execution, task) = load(uow, execution_id)?;
    authorize(actor, &task)?;
    ensure_pending(&execution)?;

    // The outcome of an appeal is final.
    let appeal_deadline = if execution.is_appeal() {
        None
    } else {
        Some(ctx.now + Duration::seconds(ctx.config.appeal_window_secs))
    };
    execution.mark_rejected(actor, reason, ctx.now, appeal_deadline);
    uow.update_execution(&execution, ExecutionStatus::Pending)?;

    let event = rejected_event(&execution);
    Ok(Committed::new(execution, vec![event]))
}

fn appeal_in(
    uow: &mut dyn UnitOfWork,
    ctx: &TxContext,
    execution_id: ExecutionId,
    executor_id: &UserId,
    note: Option<String>,
) -> Result<Committed<Execution>, MarketError> {
    let (mut original, task) = load(uow, execution_id)?;
    if &original.executor_id != executor_id {
        return Err(MarketError::Unauthorized(format!(
            "only the executor may appeal execution {}",
            execution_id
        )));
    }
    if original.status != ExecutionStatus::Rejected {
        return Err(MarketError::invalid_state(format!(
            "execution {} is {}, only rejections can be appealed",
            execution_id,
            original.status.as_str()
        )));
    }
    if original.is_appeal() {
        return Err(MarketError::invalid_state("the outcome of an appeal is final"));
    }
    if original.appealed {
        return Err(MarketError::invalid_state(format!(
            "execution {} was already appealed",
            execution_id
        )));
    }
    match original.appeal_deadline {
        None => {
            return Err(MarketError::invalid_state(format!(
                "execution {} cannot be appealed",
                execution_id
            )))
        }
        Some(deadline) if deadline < ctx.now => {
            return Err(MarketError::invalid_state(format!(
                "appeal window for execution {} closed at {}",
                execution_id, deadline
            )))
        }
        Some(_) => {}
    }
    if !task.status.accepts_approvals() || task.is_full() {
        return Err(MarketError::invalid_state(format!(
            "task {} no longer accepts approvals",
            task.id
        )));
    }
    if let Some(open) = uow.open_execution(task.id, executor_id)? {
        return Err(MarketError::invalid_state(format!(
            "execution {} of task {} is still open",
            open.id, task.id
        )));
    }

    original.appealed = true;
    uow.update_execution(&original, ExecutionStatus::Rejected)?;

    let appeal = Execution {
        id: ExecutionId::new(),
        task_id: task.id,
        executor_id: executor_id.clone(),
        status: ExecutionStatus::Pending,
        reward_snapshot: original.reward_snapshot,
        level_snapshot: original.level_snapshot,
        credited_amount: None,
        submitted_at: ctx.now,
        verified_at: None,
        verifier_id: None,
        proof_ref: note.or_else(|| original.proof_ref.clone()),
        rejection_reason: None,
        appeal_deadline: None,
        // Appeals wait for a human decision.
        auto_approve_at: None,
        appeal_of: Some(original.id),
        appealed: false,
        claim: None,
    };
    uow.insert_execution(&appeal)?;

    let event = DomainEvent::ExecutionAppealed {
        execution_id: appeal.id,
        appeal_of: original.id,
        task_id: task.id,
        executor_id: executor_id.clone(),
        creator_id: task.creator_id.clone(),
    };
    Ok(Committed::new(appeal, vec![event]))
}

impl Marketplace {
    /// Submit a completion. AUTO tasks are verified right away; a timeout or
    /// verifier error leaves the execution pending for moderation.
    pub async fn submit(
        &self,
        executor_id: &UserId,
        task_id: TaskId,
        proof_ref: Option<String>,
    ) -> Result<SubmitOutcome, MarketError> {
        let committed = self
            .with_retry("submit", || {
                let executor_id = executor_id.clone();
                let proof_ref = proof_ref.clone();
                self.run(move |uow, ctx| submit_in(uow, ctx, &executor_id, task_id, proof_ref))
            })
            .await?;
        let (execution, task) = self.finish(committed);
        tracing::info!(
            execution_id = %execution.id,
            task_id = %task_id,
            executor = %executor_id,
            mode = task.verification_mode.as_str(),
            "Execution submitted"
        );

        if task.verification_mode != VerificationMode::Auto {
            return Ok(SubmitOutcome {
                execution,
                verification: None,
            });
        }

        let outcome = verify_with_timeout(
            self.verifier.as_ref(),
            executor_id,
            &task,
            execution.proof_ref.as_deref(),
            self.config.verifier_timeout,
        )
        .await;
        let execution = self.apply_verdict(execution, &outcome).await;
        Ok(SubmitOutcome {
            execution,
            verification: Some(outcome),
        })
    }

    /// Apply a verifier verdict if the execution is still pending.
    async fn apply_verdict(&self, execution: Execution, outcome: &VerificationOutcome) -> Execution {
        let id = execution.id;
        let applied = match outcome {
            VerificationOutcome::Passed(_) => self
                .approve(id, Actor::System)
                .await
                .map(|receipt| receipt.execution),
            VerificationOutcome::Failed(reason) => {
                let reason = match reason.trim() {
                    "" => VERIFICATION_FAILED,
                    given => given,
                };
                self.reject(id, Actor::System, reason).await
            }
            VerificationOutcome::Inconclusive(reason) => {
                tracing::info!(execution_id = %id, reason = %reason, "Verification inconclusive; left pending");
                return execution;
            }
        };
        match applied {
            Ok(updated) => updated,
            Err(e) => {
                tracing::warn!(execution_id = %id, "Dropped verifier verdict: {}", e);
                self.get_execution(id).await.unwrap_or(execution)
            }
        }
    }

    /// Approve a pending execution and credit the executor.
    pub async fn approve(&self, execution_id: ExecutionId, actor: Actor) -> Result<ApprovalReceipt, MarketError> {
        self.approve_as(execution_id, actor, None).await
    }

    /// Approve on behalf of a sweep worker holding the execution's claim.
    pub(crate) async fn approve_claimed(
        &self,
        execution_id: ExecutionId,
        worker: &str,
    ) -> Result<ApprovalReceipt, MarketError> {
        self.approve_as(execution_id, Actor::System, Some(worker.to_string()))
            .await
    }

    async fn approve_as(
        &self,
        execution_id: ExecutionId,
        actor: Actor,
        worker: Option<String>,
    ) -> Result<ApprovalReceipt, MarketError> {
        let committed = self
            .with_retry("approve", || {
                let actor = actor.clone();
                let worker = worker.clone();
                self.run(move |uow, ctx| approve_in(uow, ctx, execution_id, &actor, worker.as_deref()))
            })
            .await?;
        let receipt = self.finish(committed);
        tracing::info!(
            execution_id = %execution_id,
            task_id = %receipt.task.id,
            executor = %receipt.execution.executor_id,
            amount = receipt.credited_amount,
            bonus = receipt.bonus,
            actor = %actor.label(),
            "Execution approved"
        );
        if receipt.task_completed {
            tracing::info!(task_id = %receipt.task.id, "Task completed");
        }
        Ok(receipt)
    }

    /// Reject a pending execution and open the appeal window.
    pub async fn reject(&self, execution_id: ExecutionId, actor: Actor, reason: &str) -> Result<Execution, MarketError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(MarketError::validation("a rejection needs a reason"));
        }
        let committed = self
            .with_retry("reject", || {
                let actor = actor.clone();
                let reason = reason.to_string();
                self.run(move |uow, ctx| reject_in(uow, ctx, execution_id, &actor, &reason))
            })
            .await?;
        let execution = self.finish(committed);
        tracing::info!(
            execution_id = %execution_id,
            actor = %actor.label(),
            reason,
            "Execution rejected"
        );
        Ok(execution)
    }

    /// Re-open a rejected execution for moderation, once.
    pub async fn appeal(
        &self,
        execution_id: ExecutionId,
        executor_id: &UserId,
        note: Option<String>,
    ) -> Result<Execution, MarketError> {
        let committed = self
            .with_retry("appeal", || {
                let executor_id = executor_id.clone();
                let note = note.clone();
                self.run(move |uow, ctx| appeal_in(uow, ctx, execution_id, &executor_id, note))
            })
            .await?;
        let appeal = self.finish(committed);
        tracing::info!(
            execution_id = %appeal.id,
            appeal_of = %execution_id,
            executor = %executor_id,
            "Execution appealed"
        );
        Ok(appeal)
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> Result<Execution, MarketError> {
        self.run(move |uow, _| uow.execution(execution_id))
            .await?
            .ok_or_else(|| MarketError::not_found("execution", execution_id))
    }

    /// Moderation queue of a task. Creator or moderator only.
    pub async fn pending_for_task(&self, task_id: TaskId, requester: &Actor) -> Result<Vec<Execution>, MarketError> {
        let requester = requester.clone();
        self.run(move |uow, _| {
            let task = uow
                .task(task_id)?
                .ok_or_else(|| MarketError::not_found("task", task_id))?;
            authorize(&requester, &task)?;
            uow.executions_for_task(task_id, Some(ExecutionStatus::Pending))
        })
        .await
    }
}
