//! Marketplace service: task factory, execution state machine, cancellation
//! and the auto-approval sweep, over a [`MarketStore`].
//!
//! Every operation that moves money runs as one store transaction. Domain
//! events and notifications go out only after that transaction commits.

mod cancel;
mod error;
mod events;
mod execution;
mod factory;
mod notify;
mod sweep;

pub use error::MarketError;
pub use events::{BroadcastEventSink, DomainEvent, EventSink};
pub use execution::{ApprovalReceipt, SubmitOutcome};
pub use factory::{PageRequest, TaskPage, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use notify::{LogNotifier, Notifier, NotifyError, WebhookNotifier};
pub use sweep::{SweepReport, SweepWorker};

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::config::MarketConfig;
use crate::ledger::{AccountAudit, Transaction, UserId};
use crate::reward::Level;
use crate::store::{transact, LedgerTotals, MarketStore, UnitOfWork, UserProfile};
use crate::task::VerifierRef;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of a committed transaction plus the events it produced.
pub(crate) struct Committed<T> {
    pub(crate) value: T,
    pub(crate) events: Vec<DomainEvent>,
}

impl<T> Committed<T> {
    pub(crate) fn new(value: T, events: Vec<DomainEvent>) -> Self {
        Self { value, events }
    }
}

/// What a transaction body sees besides the unit of work.
#[derive(Clone)]
pub(crate) struct TxContext {
    pub(crate) now: DateTime<Utc>,
    pub(crate) config: Arc<MarketConfig>,
}

pub struct Marketplace {
    store: Arc<dyn MarketStore>,
    verifier: Option<VerifierRef>,
    notifier: Arc<dyn Notifier>,
    events: Arc<dyn EventSink>,
    config: Arc<MarketConfig>,
    clock: Arc<dyn Clock>,
}

impl Marketplace {
    pub fn new(store: Arc<dyn MarketStore>, config: MarketConfig) -> Self {
        Self {
            store,
            verifier: None,
            notifier: Arc::new(LogNotifier),
            events: Arc::new(BroadcastEventSink::default()),
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_verifier(mut self, verifier: VerifierRef) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_persistent()
    }

    pub(crate) fn context(&self) -> TxContext {
        TxContext {
            now: self.clock.now(),
            config: Arc::clone(&self.config),
        }
    }

    /// Run a transaction body with a fresh context.
    pub(crate) async fn run<R, F>(&self, f: F) -> Result<R, MarketError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn UnitOfWork, &TxContext) -> Result<R, MarketError> + Send + 'static,
    {
        let ctx = self.context();
        transact(self.store.as_ref(), move |uow| f(uow, &ctx)).await
    }

    /// Run `attempt`, retrying once on a lost race.
    ///
    /// A second conflict surfaces as `InvalidStateTransition`.
    pub(crate) async fn with_retry<R, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<R, MarketError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, MarketError>>,
    {
        match attempt().await {
            Err(e) if e.is_retryable() => {
                tracing::debug!(op, error = %e, "Retrying after conflict");
                match attempt().await {
                    Err(e) if e.is_retryable() => Err(MarketError::invalid_state(format!(
                        "{} lost a concurrent update: {}",
                        op, e
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Emit committed events and notify their recipients.
    pub(crate) fn publish(&self, events: Vec<DomainEvent>) {
        for event in events {
            if let Some(recipient) = event.recipient() {
                match serde_json::to_value(&event) {
                    Ok(payload) => notify::dispatch(
                        Arc::clone(&self.notifier),
                        recipient.clone(),
                        event.event_name(),
                        payload,
                    ),
                    Err(e) => tracing::warn!(event = event.event_name(), "Unserializable event: {}", e),
                }
            }
            self.events.emit(event);
        }
    }

    /// Publish a committed result's events and hand back its value.
    pub(crate) fn finish<T>(&self, committed: Committed<T>) -> T {
        self.publish(committed.events);
        committed.value
    }

    // ---- users & accounts ----

    /// Register a user, or update the level of an existing one.
    pub async fn register_user(&self, id: UserId, level: Level) -> Result<UserProfile, MarketError> {
        if id.as_str().trim().is_empty() {
            return Err(MarketError::validation("user id must not be empty"));
        }
        if id.is_platform() {
            return Err(MarketError::validation(format!("{} is a reserved account", id)));
        }
        let profile = self
            .with_retry("register_user", || {
                let id = id.clone();
                self.run(move |uow, ctx| {
                    let profile = match uow.user(&id)? {
                        Some(existing) => UserProfile { level, ..existing },
                        None => UserProfile {
                            id: id.clone(),
                            level,
                            created_at: ctx.now,
                        },
                    };
                    uow.put_user(&profile)?;
                    Ok(profile)
                })
            })
            .await?;
        tracing::info!(user = %profile.id, level = %profile.level, "User registered");
        Ok(profile)
    }

    /// Change the level of an existing user.
    pub async fn set_level(&self, id: &UserId, level: Level) -> Result<UserProfile, MarketError> {
        self.user(id).await?;
        self.register_user(id.clone(), level).await
    }

    pub async fn user(&self, id: &UserId) -> Result<UserProfile, MarketError> {
        let lookup = id.clone();
        self.run(move |uow, _| uow.user(&lookup))
            .await?
            .filter(|profile| !profile.id.is_platform())
            .ok_or_else(|| MarketError::not_found("user", id))
    }

    /// Top up a user's account. Replaying a `reference` moves no money.
    pub async fn deposit(&self, account: &UserId, amount: i64, reference: &str) -> Result<Transaction, MarketError> {
        if account.is_platform() {
            return Err(MarketError::validation("deposits to the platform account are not allowed"));
        }
        let posting = self
            .with_retry("deposit", || {
                let account = account.clone();
                let reference = reference.to_string();
                self.run(move |uow, _| {
                    if uow.user(&account)?.is_none() {
                        return Err(MarketError::not_found("user", &account));
                    }
                    uow.deposit(&account, amount, &reference)
                })
            })
            .await?;
        if posting.is_replay() {
            tracing::debug!(account = %account, reference, "Deposit replayed");
        } else {
            tracing::info!(account = %account, amount, reference, "Deposit posted");
        }
        Ok(posting.into_transaction())
    }

    pub async fn balance(&self, account: &UserId) -> Result<i64, MarketError> {
        let lookup = account.clone();
        self.run(move |uow, _| uow.account_balance(&lookup))
            .await?
            .ok_or_else(|| MarketError::not_found("account", account))
    }

    pub async fn transactions(&self, account: &UserId) -> Result<Vec<Transaction>, MarketError> {
        self.balance(account).await?;
        let lookup = account.clone();
        self.run(move |uow, _| uow.account_transactions(&lookup)).await
    }

    /// Compare an account's cached balance with its transaction log.
    pub async fn audit_account(&self, account: &UserId) -> Result<AccountAudit, MarketError> {
        let lookup = account.clone();
        let audit = self.run(move |uow, _| uow.audit(&lookup)).await?;
        if !audit.is_consistent() {
            tracing::error!(
                account = %account,
                balance = audit.balance,
                ledger_sum = audit.ledger_sum,
                "Ledger inconsistency"
            );
        }
        Ok(audit)
    }

    /// Deposits versus balances plus escrow, across the whole store.
    pub async fn ledger_totals(&self) -> Result<LedgerTotals, MarketError> {
        self.run(|uow, _| uow.ledger_totals()).await
    }
}

#[cfg(test)]
pub(crate) mod harness {
    //! Marketplace wiring shared by the service tests.

    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::store::InMemoryMarketStore;
    use crate::task::{TaskSpec, TaskType, VerificationMode};

    pub(crate) struct Harness {
        pub(crate) market: Arc<Marketplace>,
        pub(crate) clock: Arc<ManualClock>,
        pub(crate) events: BroadcastEventSink,
    }

    pub(crate) fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
    }

    pub(crate) fn harness_with(store: Arc<dyn MarketStore>, config: MarketConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(start_time()));
        let events = BroadcastEventSink::new(256);
        let market = Marketplace::new(store, config)
            .with_clock(clock.clone())
            .with_events(Arc::new(events.clone()));
        Harness {
            market: Arc::new(market),
            clock,
            events,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(Arc::new(InMemoryMarketStore::new()), MarketConfig::default())
    }

    pub(crate) fn manual_spec(reward: i64, target_count: u32) -> TaskSpec {
        TaskSpec {
            task_type: TaskType::Subscribe,
            title: "Subscribe to the channel".to_string(),
            target_ref: "@channel".to_string(),
            reward,
            target_count,
            min_executor_level: Level::Bronze,
            verification_mode: VerificationMode::Manual,
            auto_approve_secs: Some(3600),
            expires_at: None,
            boosted: false,
            priority: 0,
        }
    }

    impl Harness {
        pub(crate) async fn user(&self, id: &str, level: Level, funds: i64) -> UserId {
            let id = UserId::new(id);
            self.market.register_user(id.clone(), level).await.unwrap();
            if funds > 0 {
                self.market
                    .deposit(&id, funds, &format!("seed-{}", id))
                    .await
                    .unwrap();
            }
            id
        }

        pub(crate) async fn assert_conserved(&self) {
            let totals = self.market.ledger_totals().await.unwrap();
            assert!(totals.is_conserved(), "money not conserved: {:?}", totals);
        }

        pub(crate) async fn assert_consistent(&self, accounts: &[&UserId]) {
            for account in accounts {
                let audit = self.market.audit_account(account).await.unwrap();
                assert!(audit.is_consistent(), "{} inconsistent: {:?}", account, audit);
            }
            let platform = self.market.audit_account(&UserId::platform()).await.unwrap();
            assert!(platform.is_consistent());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::harness::harness;
    use super::*;

    #[tokio::test]
    async fn test_register_and_deposit() {
        let h = harness();
        let alice = h.user("alice", Level::Silver, 0).await;

        let tx = h.market.deposit(&alice, 1500, "wire-1").await.unwrap();
        assert_eq!(tx.amount, 1500);
        // Same reference again is a replay.
        let replay = h.market.deposit(&alice, 1500, "wire-1").await.unwrap();
        assert_eq!(replay.id, tx.id);
        assert_eq!(h.market.balance(&alice).await.unwrap(), 1500);
        assert_eq!(h.market.transactions(&alice).await.unwrap().len(), 1);
        h.assert_consistent(&[&alice]).await;
        h.assert_conserved().await;
    }

    #[tokio::test]
    async fn test_platform_id_is_reserved() {
        let h = harness();
        let err = h
            .market
            .register_user(UserId::platform(), Level::Premium)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));
        assert!(matches!(
            h.market.user(&UserId::platform()).await,
            Err(MarketError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_deposit_requires_registration() {
        let h = harness();
        let err = h
            .market
            .deposit(&UserId::new("ghost"), 100, "wire-9")
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::NotFound { entity: "user", .. }));
    }

    #[tokio::test]
    async fn test_set_level_keeps_created_at() {
        let h = harness();
        let bob = h.user("bob", Level::Bronze, 0).await;
        let before = h.market.user(&bob).await.unwrap();
        h.clock.advance(chrono::Duration::days(3));
        let after = h.market.set_level(&bob, Level::Gold).await.unwrap();
        assert_eq!(after.level, Level::Gold);
        assert_eq!(after.created_at, before.created_at);
        assert!(h.market.set_level(&UserId::new("nobody"), Level::Gold).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_second_conflict() {
        let h = harness();
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<(), MarketError> = h
            .market
            .with_retry("retry-check", || {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(MarketError::Conflict("busy".to_string())) }
            })
            .await;
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(matches!(result, Err(MarketError::InvalidStateTransition(_))));
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(harness::start_time());
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(
            clock.now(),
            harness::start_time() + chrono::Duration::minutes(5)
        );
    }

    #[test]
    fn test_manual_clock_survives_poisoned_lock() {
        let clock = Arc::new(ManualClock::new(harness::start_time()));
        let poisoner = Arc::clone(&clock);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.now.lock().unwrap();
            panic!("poison the clock");
        })
        .join();
        assert!(clock.now.is_poisoned());

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(clock.now(), harness::start_time() + chrono::Duration::seconds(1));
    }
}
