//! Background sweep: auto-approves overdue pending executions and expires
//! tasks past their deadline.
//!
//! Several sweep instances may share one store. Each execution is leased to
//! one worker before it is approved, and approval re-checks the lease and
//! the pending status inside its transaction, so no execution is credited
//! twice.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{MarketError, Marketplace};
use crate::config::SweepConfig;
use crate::task::{Execution, ExecutionId};

/// What one sweep pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub claimed: usize,
    pub approved: usize,
    pub released: usize,
    pub expired: usize,
}

impl Marketplace {
    /// Lease up to `limit` overdue pending executions to `worker`.
    pub(crate) async fn claim_overdue(
        &self,
        worker: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Execution>, MarketError> {
        let worker = worker.to_string();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| MarketError::validation(format!("claim lease out of range: {}", e)))?;
        self.run(move |uow, ctx| uow.claim_overdue(&worker, ctx.now, ctx.now + lease, limit))
            .await
    }

    pub(crate) async fn release_claim(&self, execution_id: ExecutionId, worker: &str) -> Result<(), MarketError> {
        let worker = worker.to_string();
        self.run(move |uow, _| uow.release_claim(execution_id, &worker))
            .await
    }
}

pub struct SweepWorker {
    market: Arc<Marketplace>,
    worker_id: String,
    config: SweepConfig,
}

impl SweepWorker {
    pub fn new(market: Arc<Marketplace>, config: SweepConfig) -> Self {
        Self {
            market,
            worker_id: format!("sweep-{}", Uuid::new_v4()),
            config,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// One pass: claim, approve, release what could not be approved, expire.
    pub async fn run_once(&self) -> Result<SweepReport, MarketError> {
        let mut report = SweepReport::default();
        let claimed = self
            .market
            .claim_overdue(&self.worker_id, self.config.batch_size, self.config.claim_lease)
            .await?;
        report.claimed = claimed.len();

        for execution in claimed {
            match self.market.approve_claimed(execution.id, &self.worker_id).await {
                Ok(_) => report.approved += 1,
                Err(e) => {
                    tracing::debug!(
                        worker = %self.worker_id,
                        execution_id = %execution.id,
                        "Auto-approval skipped: {}",
                        e
                    );
                    if let Err(e) = self.market.release_claim(execution.id, &self.worker_id).await {
                        tracing::warn!(execution_id = %execution.id, "Failed to release claim: {}", e);
                    } else {
                        report.released += 1;
                    }
                }
            }
        }

        report.expired = self.market.expire_due_tasks(self.config.batch_size).await?.len();
        if report != SweepReport::default() {
            tracing::info!(
                worker = %self.worker_id,
                claimed = report.claimed,
                approved = report.approved,
                released = report.released,
                expired = report.expired,
                "Sweep pass"
            );
        }
        Ok(report)
    }

    /// Run passes until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            worker = %self.worker_id,
            interval_secs = self.config.interval.as_secs(),
            "Sweep started"
        );
        loop {
            if let Err(e) = self.run_once().await {
                tracing::warn!(worker = %self.worker_id, "Sweep pass failed: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(jittered(self.config.interval)) => {}
            }
        }
        tracing::info!(worker = %self.worker_id, "Sweep stopped");
    }
}

/// `interval` plus or minus up to 10%, so instances drift apart.
fn jittered(interval: Duration) -> Duration {
    let spread = interval.as_millis() as u64 / 10;
    if spread == 0 {
        return interval;
    }
    let offset = rand::thread_rng().gen_range(0..=2 * spread);
    (interval + Duration::from_millis(offset)).saturating_sub(Duration::from_millis(spread))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;

    use super::super::harness::{harness, harness_with, manual_spec, Harness};
    use super::*;
    use crate::config::MarketConfig;
    use crate::market::Clock;
    use crate::reward::Level;
    use crate::store::SqliteMarketStore;
    use crate::task::{Actor, ExecutionStatus, TaskStatus};

    fn sweep(h: &Harness, id: &str) -> SweepWorker {
        SweepWorker::new(h.market.clone(), SweepConfig::default()).with_worker_id(id)
    }

    #[tokio::test]
    async fn test_scenario_e_overdue_execution_auto_approved() {
        let h = harness();
        let creator = h.user("creator", Level::Bronze, 10_000).await;
        let task = h.market.create_task(&creator, manual_spec(100, 2)).await.unwrap();
        let exec = h.user("exec", Level::Gold, 0).await;
        let execution = h.market.submit(&exec, task.id, None).await.unwrap().execution;

        let worker = sweep(&h, "sweep-a");
        assert_eq!(worker.run_once().await.unwrap(), SweepReport::default());

        h.clock.advance(ChronoDuration::seconds(3601));
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.approved, 1);

        let approved = h.market.get_execution(execution.id).await.unwrap();
        assert_eq!(approved.status, ExecutionStatus::Approved);
        assert_eq!(approved.verifier_id.as_deref(), Some("system"));
        assert_eq!(approved.claim, None);
        assert_eq!(h.market.balance(&exec).await.unwrap(), 135);

        // Nothing left to do.
        assert_eq!(worker.run_once().await.unwrap().claimed, 0);
        h.assert_conserved().await;
    }

    #[tokio::test]
    async fn test_sweep_skips_appeals_and_moderated() {
        let h = harness();
        let creator = h.user("creator", Level::Bronze, 10_000).await;
        let task = h.market.create_task(&creator, manual_spec(100, 3)).await.unwrap();
        let exec = h.user("exec", Level::Bronze, 0).await;
        let execution = h.market.submit(&exec, task.id, None).await.unwrap().execution;
        h.market
            .reject(execution.id, Actor::User(creator.clone()), "wrong account")
            .await
            .unwrap();
        let appeal = h.market.appeal(execution.id, &exec, None).await.unwrap();

        h.clock.advance(ChronoDuration::days(2));
        let report = sweep(&h, "sweep-a").run_once().await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(
            h.market.get_execution(appeal.id).await.unwrap().status,
            ExecutionStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_claim_lease_is_exclusive() {
        let h = harness();
        let creator = h.user("creator", Level::Bronze, 10_000).await;
        let task = h.market.create_task(&creator, manual_spec(100, 3)).await.unwrap();
        let exec = h.user("exec", Level::Bronze, 0).await;
        let execution = h.market.submit(&exec, task.id, None).await.unwrap().execution;

        h.clock.advance(ChronoDuration::seconds(3601));
        let claimed = h
            .market
            .claim_overdue("sweep-a", 10, std::time::Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        // Another worker cannot take a live lease.
        let other = h
            .market
            .claim_overdue("sweep-b", 10, std::time::Duration::from_secs(60))
            .await
            .unwrap();
        assert!(other.is_empty());
        assert!(matches!(
            h.market.approve_claimed(execution.id, "sweep-b").await,
            Err(MarketError::InvalidStateTransition(_))
        ));

        h.market.pause(task.id, &creator).await.unwrap();
        h.market.approve_claimed(execution.id, "sweep-a").await.unwrap();
        assert_eq!(h.market.get_task(task.id).await.unwrap().status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn test_sweep_expires_tasks() {
        let h = harness();
        let creator = h.user("creator", Level::Bronze, 10_000).await;
        let mut spec = manual_spec(10, 3);
        spec.expires_at = Some(h.clock.now() + ChronoDuration::minutes(5));
        let task = h.market.create_task(&creator, spec).await.unwrap();

        h.clock.advance(ChronoDuration::minutes(10));
        let report = sweep(&h, "sweep-a").run_once().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(h.market.get_task(task.id).await.unwrap().status, TaskStatus::Expired);
        h.assert_conserved().await;
    }

    /// Two sweep instances on separate connections to one database never
    /// credit an execution twice.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_instances_never_double_credit() {
        let dir = tempfile::tempdir().unwrap();
        let first = Arc::new(SqliteMarketStore::new(dir.path().to_path_buf()).await.unwrap());
        let second = Arc::new(SqliteMarketStore::new(dir.path().to_path_buf()).await.unwrap());
        let h = harness_with(first, MarketConfig::default());
        let shared_clock = h.clock.clone();
        let other = Arc::new(
            Marketplace::new(second, MarketConfig::default())
                .with_clock(shared_clock.clone() as Arc<dyn Clock>),
        );

        let creator = h.user("creator", Level::Bronze, 1_000_000).await;
        let task = h.market.create_task(&creator, manual_spec(10, 30)).await.unwrap();
        let mut executors = Vec::new();
        for i in 0..12 {
            let exec = h.user(&format!("exec-{}", i), Level::Bronze, 0).await;
            h.market.submit(&exec, task.id, None).await.unwrap();
            executors.push(exec);
        }
        shared_clock.advance(ChronoDuration::hours(2));

        let config = SweepConfig {
            batch_size: 5,
            ..SweepConfig::default()
        };
        let a = SweepWorker::new(h.market.clone(), config.clone()).with_worker_id("sweep-a");
        let b = SweepWorker::new(other, config).with_worker_id("sweep-b");
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move {
                let mut approved = 0;
                for _ in 0..4 {
                    approved += a.run_once().await.unwrap().approved;
                }
                approved
            }),
            tokio::spawn(async move {
                let mut approved = 0;
                for _ in 0..4 {
                    approved += b.run_once().await.unwrap().approved;
                }
                approved
            }),
        );
        assert_eq!(ra.unwrap() + rb.unwrap(), 12);

        for exec in &executors {
            assert_eq!(h.market.balance(exec).await.unwrap(), 10);
            assert_eq!(h.market.transactions(exec).await.unwrap().len(), 1);
        }
        assert_eq!(h.market.get_task(task.id).await.unwrap().completed_count, 12);
        h.assert_conserved().await;
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = harness();
        let config = SweepConfig {
            interval: std::time::Duration::from_millis(10),
            ..SweepConfig::default()
        };
        let worker = SweepWorker::new(h.market.clone(), config);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let interval = std::time::Duration::from_secs(30);
        for _ in 0..100 {
            let d = jittered(interval);
            assert!(d >= std::time::Duration::from_secs(27));
            assert!(d <= std::time::Duration::from_secs(33));
        }
        assert_eq!(jittered(std::time::Duration::ZERO), std::time::Duration::ZERO);
    }
}
