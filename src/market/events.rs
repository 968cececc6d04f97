//! Outbound domain events.
//!
//! Events are published after the transaction that produced them commits.
//! Delivery is best effort: a dropped event never affects balances.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::ledger::UserId;
use crate::task::{ExecutionId, TaskId};

/// A state change other components may react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    #[serde(rename = "task:created")]
    TaskCreated {
        task_id: TaskId,
        creator_id: UserId,
        reward: i64,
        target_count: u32,
        escrowed_amount: i64,
    },
    #[serde(rename = "task:paused")]
    TaskPaused { task_id: TaskId },
    #[serde(rename = "task:resumed")]
    TaskResumed { task_id: TaskId },
    #[serde(rename = "task:completed")]
    TaskCompleted { task_id: TaskId, creator_id: UserId },
    #[serde(rename = "task:cancelled")]
    TaskCancelled {
        task_id: TaskId,
        creator_id: UserId,
        refund_amount: i64,
        forfeited_amount: i64,
    },
    #[serde(rename = "task:expired")]
    TaskExpired {
        task_id: TaskId,
        creator_id: UserId,
        refund_amount: i64,
    },
    #[serde(rename = "execution:submitted")]
    ExecutionSubmitted {
        execution_id: ExecutionId,
        task_id: TaskId,
        executor_id: UserId,
        /// Moderation authority for the submission.
        creator_id: UserId,
    },
    #[serde(rename = "execution:approved")]
    ExecutionApproved {
        execution_id: ExecutionId,
        task_id: TaskId,
        executor_id: UserId,
        credited_amount: i64,
        actor: String,
    },
    #[serde(rename = "execution:rejected")]
    ExecutionRejected {
        execution_id: ExecutionId,
        task_id: TaskId,
        executor_id: UserId,
        reason: String,
        appealable: bool,
    },
    #[serde(rename = "execution:appealed")]
    ExecutionAppealed {
        execution_id: ExecutionId,
        appeal_of: ExecutionId,
        task_id: TaskId,
        executor_id: UserId,
        creator_id: UserId,
    },
}

impl DomainEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            DomainEvent::TaskCreated { .. } => "task:created",
            DomainEvent::TaskPaused { .. } => "task:paused",
            DomainEvent::TaskResumed { .. } => "task:resumed",
            DomainEvent::TaskCompleted { .. } => "task:completed",
            DomainEvent::TaskCancelled { .. } => "task:cancelled",
            DomainEvent::TaskExpired { .. } => "task:expired",
            DomainEvent::ExecutionSubmitted { .. } => "execution:submitted",
            DomainEvent::ExecutionApproved { .. } => "execution:approved",
            DomainEvent::ExecutionRejected { .. } => "execution:rejected",
            DomainEvent::ExecutionAppealed { .. } => "execution:appealed",
        }
    }

    /// User who should be notified about this event, if anyone.
    pub fn recipient(&self) -> Option<&UserId> {
        match self {
            DomainEvent::TaskCreated { .. }
            | DomainEvent::TaskPaused { .. }
            | DomainEvent::TaskResumed { .. }
            | DomainEvent::TaskCancelled { .. } => None,
            DomainEvent::TaskCompleted { creator_id, .. }
            | DomainEvent::TaskExpired { creator_id, .. }
            | DomainEvent::ExecutionSubmitted { creator_id, .. }
            | DomainEvent::ExecutionAppealed { creator_id, .. } => Some(creator_id),
            DomainEvent::ExecutionApproved { executor_id, .. }
            | DomainEvent::ExecutionRejected { executor_id, .. } => Some(executor_id),
        }
    }
}

/// Outbound port for domain events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

/// Fans events out to every current subscriber (e.g. the SSE stream).
#[derive(Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<DomainEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: DomainEvent) {
        tracing::debug!(event = event.event_name(), "Domain event");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
