//! Balance engine orchestration layer
//!
//! Ties the durable store, balance cache, hold ledger, flusher, snapshot
//! scheduler and broadcaster together into the public API.
//!
//! # Example
//!
//! ```no_run
//! use balance_core::{BalanceEngine, Config, Direction};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> balance_core::Result<()> {
//!     let engine = BalanceEngine::open(Config::default()).await?;
//!
//!     engine
//!         .create_hold("ACC1".into(), "TX1".into(), Decimal::from(40), Direction::Debit)
//!         .await?;
//!     let view = engine.get_balance(&"ACC1".into()).await?;
//!     println!("available: {}", view.snapshot.available_balance);
//!
//!     engine.shutdown().await
//! }
//! ```
//!
//! # Locking
//!
//! Every mutation of one account's in-memory state (hold ledger entry,
//! optimistic cache adjustment) runs under that account's async mutex.
//! Cache hits never take the lock.
//!
//! A confirm claims its hold before waiting for the lock. A timeout that
//! fires while the claim is held releases nothing; if the confirm then fails,
//! dropping the claim re-arms the timeout to fire immediately.

use crate::{
    broadcaster::{Broadcaster, Subscription},
    cache::{connect_cache, BalanceCache},
    events::{BalanceEvent, EventBus},
    flusher::{spawn_flusher, FlusherHandle},
    holds::{Expiry, HoldLedger},
    metrics::Metrics,
    snapshot::SnapshotScheduler,
    storage::{DurableStore, RocksStore},
    types::{
        AccountId, AccountRecord, AggregateView, BalanceSnapshot, BalanceView, DailyBalance,
        DeltaKind, Direction, HoldOutcome, HoldStatus, HolderId, ListenerId, PendingHold,
        QueuedDelta, ReleaseReason, Settlement, TransactionId,
    },
    Config, Error, Result,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use velocity_engine::{evaluate_warnings, LimitsTable, VelocityHeadroom};

/// Number of posted transactions carried in a balance view
pub const RECENT_TRANSACTIONS: usize = 5;

struct EngineInner {
    config: Config,
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn BalanceCache>,
    holds: HoldLedger,
    flusher: FlusherHandle,
    flusher_task: Mutex<Option<JoinHandle<()>>>,
    snapshots: Arc<SnapshotScheduler>,
    snapshot_task: Mutex<Option<JoinHandle<()>>>,
    broadcaster: Arc<Broadcaster>,
    events: EventBus,
    limits: LimitsTable,
    locks: DashMap<AccountId, Arc<tokio::sync::Mutex<()>>>,
    metrics: Metrics,
    shut_down: AtomicBool,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(task) = self.snapshot_task.get_mut().take() {
            task.abort();
        }
    }
}

/// A confirm's claim on its hold, released on drop
struct ConfirmClaim<'a> {
    engine: &'a BalanceEngine,
    account_id: &'a AccountId,
    transaction_id: &'a TransactionId,
}

impl Drop for ConfirmClaim<'_> {
    fn drop(&mut self) {
        if self.engine.inner.holds.end_confirm(self.account_id, self.transaction_id) {
            debug!(
                account_id = %self.account_id,
                transaction_id = %self.transaction_id,
                "Re-arming timeout deferred by unfinished confirm"
            );
            self.engine
                .arm_timeout(self.account_id, self.transaction_id, Duration::ZERO);
        }
    }
}

/// Real-time balance and pending hold engine
#[derive(Clone)]
pub struct BalanceEngine {
    inner: Arc<EngineInner>,
}

impl BalanceEngine {
    /// Open the RocksDB store under `config.data_dir` and the configured cache
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(RocksStore::open(&config)?);
        let cache = connect_cache(&config.cache).await;
        Self::start(config, store, cache)
    }

    /// Start the engine on explicit collaborators
    ///
    /// Spawns the flusher and (if enabled) the snapshot scheduler, so it
    /// must run inside a Tokio runtime.
    pub fn start(config: Config, store: Arc<dyn DurableStore>, cache: Arc<dyn BalanceCache>) -> Result<Self> {
        config.validate()?;
        let limits = config.limits_table()?;
        let metrics = Metrics::new().map_err(|e| Error::Config(format!("metrics: {}", e)))?;

        let (flusher, flusher_task) = spawn_flusher(store.clone(), &config.flusher, metrics.clone());
        let snapshots = SnapshotScheduler::new(store.clone(), config.snapshot.interval(), metrics.clone());
        let snapshot_task = config.snapshot.enabled.then(|| snapshots.spawn());

        info!(
            service = %config.service_name,
            cache = cache.backend(),
            hold_timeout_secs = config.holds.timeout_secs,
            "Balance engine started"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                holds: HoldLedger::new(config.holds.timeout()),
                broadcaster: Broadcaster::new(config.broadcaster.listener_buffer, metrics.clone()),
                events: EventBus::new(config.broadcaster.event_capacity),
                flusher,
                flusher_task: Mutex::new(Some(flusher_task)),
                snapshots,
                snapshot_task: Mutex::new(snapshot_task),
                store,
                cache,
                limits,
                locks: DashMap::new(),
                metrics,
                shut_down: AtomicBool::new(false),
                config,
            }),
        })
    }

    fn account_lock(&self, account_id: &AccountId) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .locks
            .entry(account_id.clone())
            .or_default()
            .clone()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Concurrency("engine is shut down".to_string()));
        }
        Ok(())
    }

    // Accounts

    /// Insert or replace an account row
    pub async fn upsert_account(&self, account: AccountRecord) -> Result<()> {
        let lock = self.account_lock(&account.account_id);
        let _guard = lock.lock().await;
        self.inner.store.upsert_account(&account)?;
        self.inner.cache.invalidate(&account.account_id).await;
        Ok(())
    }

    // Reads

    /// Balance, limits, warnings and headroom of an account
    pub async fn get_balance(&self, account_id: &AccountId) -> Result<BalanceView> {
        let snapshot = self.balance_snapshot(account_id).await?;
        Ok(self.view(snapshot))
    }

    async fn balance_snapshot(&self, account_id: &AccountId) -> Result<BalanceSnapshot> {
        if let Some(snapshot) = self.inner.cache.get(account_id).await {
            self.inner.metrics.record_cache_lookup(true);
            return Ok(snapshot);
        }
        self.inner.metrics.record_cache_lookup(false);

        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;
        if let Some(snapshot) = self.inner.cache.get(account_id).await {
            return Ok(snapshot);
        }

        let snapshot = self.compute_snapshot(account_id)?;
        self.inner.cache.put(&snapshot).await;
        Ok(snapshot)
    }

    fn compute_snapshot(&self, account_id: &AccountId) -> Result<BalanceSnapshot> {
        let store = &self.inner.store;
        let account = store
            .get_account(account_id)?
            .ok_or_else(|| Error::NotFound(format!("account {}", account_id)))?;
        let activity = store.activity(account_id, Utc::now())?;
        let recent = store.recent_transactions(account_id, RECENT_TRANSACTIONS)?;
        let pending = self.inner.holds.pending_totals(account_id);

        Ok(BalanceSnapshot::compose(&account, activity, pending, recent))
    }

    fn view(&self, snapshot: BalanceSnapshot) -> BalanceView {
        let limits = self.inner.limits.limits_for(snapshot.program_type);
        let activity = snapshot.activity();
        BalanceView {
            warnings: evaluate_warnings(&activity, &limits),
            headroom: VelocityHeadroom::compute(&activity, &limits),
            limits,
            snapshot,
        }
    }

    /// Totals across a holder's active accounts
    pub async fn get_aggregated_balance(&self, holder_id: &HolderId) -> Result<AggregateView> {
        let mut view = AggregateView {
            holder_id: Some(holder_id.clone()),
            ..Default::default()
        };

        for account in self.inner.store.accounts_for_holder(holder_id)? {
            if !account.is_active() {
                continue;
            }
            let pending = self.inner.holds.pending_totals(&account.account_id).debits;
            let available = account.current_balance - pending;

            view.total_balance += account.current_balance;
            view.total_available += available;
            view.total_pending += pending;

            let program = view.programs.entry(account.program_type).or_default();
            program.balance += account.current_balance;
            program.available += available;
            program.pending += pending;
        }
        Ok(view)
    }

    /// Daily balance history over the last `days` days
    pub async fn get_balance_history(&self, account_id: &AccountId, days: u32) -> Result<Vec<DailyBalance>> {
        if self.inner.store.get_account(account_id)?.is_none() {
            return Err(Error::NotFound(format!("account {}", account_id)));
        }
        self.inner.snapshots.history(account_id, days)
    }

    /// Pending holds of an account
    pub fn pending_holds(&self, account_id: &AccountId) -> Vec<PendingHold> {
        self.inner.holds.holds_for(account_id)
    }

    // Hold lifecycle

    /// Reserve `amount` against an account
    ///
    /// Returns once the in-memory state is updated; persistence of the
    /// reservation delta is asynchronous.
    pub async fn create_hold(
        &self,
        account_id: AccountId,
        transaction_id: TransactionId,
        amount: Decimal,
        direction: Direction,
    ) -> Result<PendingHold> {
        self.ensure_running()?;
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!("hold amount must be positive, got {}", amount)));
        }

        let lock = self.account_lock(&account_id);
        let guard = lock.lock().await;

        let cached = self.inner.cache.get(&account_id).await;
        if cached.is_none() && self.inner.store.get_account(&account_id)?.is_none() {
            return Err(Error::NotFound(format!("account {}", account_id)));
        }

        let hold = self
            .inner
            .holds
            .insert(&account_id, &transaction_id, amount, direction)?;

        if let Some(mut snapshot) = cached {
            snapshot.apply_hold(amount, direction);
            self.inner.cache.replace(&snapshot).await;
        }

        self.enqueue(QueuedDelta::new(
            account_id.clone(),
            transaction_id.clone(),
            amount,
            direction,
            DeltaKind::Reserve,
        ));
        let deadline = self.inner.holds.timeout() + self.inner.config.holds.confirm_grace();
        self.arm_timeout(&account_id, &transaction_id, deadline);

        self.inner.metrics.holds_created.inc();
        self.inner.metrics.holds_active.inc();
        self.inner.events.publish(BalanceEvent::PendingTransaction {
            account_id: account_id.clone(),
            transaction_id: transaction_id.clone(),
            amount,
            direction,
        });
        debug!(account_id = %account_id, transaction_id = %transaction_id, %amount, %direction, "Hold created");

        drop(guard);
        self.spawn_notify(account_id);
        Ok(hold)
    }

    fn arm_timeout(&self, account_id: &AccountId, transaction_id: &TransactionId, delay: Duration) {
        // Also reached from ConfirmClaim::drop, which may run off-runtime
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(account_id = %account_id, transaction_id = %transaction_id, "No runtime to arm hold timeout");
            return;
        };
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let (account, tx) = (account_id.clone(), transaction_id.clone());

        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let engine = BalanceEngine { inner };
                if let Err(e) = engine.release_hold(&account, &tx, ReleaseReason::Timeout).await {
                    warn!(account_id = %account, transaction_id = %tx, "Timeout release failed: {}", e);
                }
            }
        });

        if !self.inner.holds.arm_timer(account_id, transaction_id, task.abort_handle()) {
            task.abort();
        }
    }

    /// Finalize a hold, posting `final_amount` (default: the reserved amount)
    ///
    /// Unknown or already-finished holds are a no-op. If the durable store
    /// rejects the posting the hold stays PENDING. A confirm that has started
    /// waiting for the account lock wins over the hold's timeout.
    pub async fn confirm(
        &self,
        account_id: &AccountId,
        transaction_id: &TransactionId,
        final_amount: Option<Decimal>,
    ) -> Result<HoldOutcome> {
        let _claim = self
            .inner
            .holds
            .begin_confirm(account_id, transaction_id)
            .then(|| ConfirmClaim {
                engine: self,
                account_id,
                transaction_id,
            });
        self.confirm_locked(account_id, transaction_id, final_amount).await
    }

    async fn confirm_locked(
        &self,
        account_id: &AccountId,
        transaction_id: &TransactionId,
        final_amount: Option<Decimal>,
    ) -> Result<HoldOutcome> {
        let lock = self.account_lock(account_id);
        let guard = lock.lock().await;

        let Some(hold) = self.inner.holds.pending(account_id, transaction_id) else {
            warn!(account_id = %account_id, transaction_id = %transaction_id, "Confirm for unknown or finished hold");
            return Ok(HoldOutcome::NoOp);
        };

        let final_amount = final_amount.unwrap_or(hold.amount);
        if final_amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!("final amount must be positive, got {}", final_amount)));
        }

        let settlement = Settlement {
            account_id: account_id.clone(),
            transaction_id: transaction_id.clone(),
            direction: hold.direction,
            reserved_amount: hold.amount,
            final_amount,
            settled_at: Utc::now(),
        };
        self.inner.store.settle_hold(&settlement)?;

        let Some(finished) = self
            .inner
            .holds
            .finish(account_id, transaction_id, HoldStatus::Completed)
        else {
            return Ok(HoldOutcome::NoOp);
        };
        if let Some(timer) = finished.timer {
            timer.abort();
        }

        self.enqueue(QueuedDelta::new(
            account_id.clone(),
            transaction_id.clone(),
            final_amount,
            hold.direction,
            DeltaKind::Settle,
        ));
        self.inner.cache.invalidate(account_id).await;

        self.inner.metrics.holds_confirmed.inc();
        self.inner.metrics.holds_active.dec();
        self.inner.events.publish(BalanceEvent::TransactionConfirmed {
            account_id: account_id.clone(),
            transaction_id: transaction_id.clone(),
            amount: final_amount,
        });
        debug!(
            account_id = %account_id,
            transaction_id = %transaction_id,
            reserved = %hold.amount,
            %final_amount,
            "Hold confirmed"
        );

        drop(guard);
        self.spawn_notify(account_id.clone());
        Ok(HoldOutcome::Confirmed { amount: final_amount })
    }

    /// Cancel a hold; a no-op when it is unknown or already finished
    pub async fn release(
        &self,
        account_id: &AccountId,
        transaction_id: &TransactionId,
        reason: impl Into<String>,
    ) -> Result<HoldOutcome> {
        self.release_hold(account_id, transaction_id, ReleaseReason::Cancelled(reason.into()))
            .await
    }

    async fn release_hold(
        &self,
        account_id: &AccountId,
        transaction_id: &TransactionId,
        reason: ReleaseReason,
    ) -> Result<HoldOutcome> {
        let lock = self.account_lock(account_id);
        let guard = lock.lock().await;

        let finished = match reason {
            ReleaseReason::Timeout => match self.inner.holds.expire(account_id, transaction_id) {
                Expiry::Released(finished) => Some(finished),
                Expiry::Deferred => {
                    debug!(account_id = %account_id, transaction_id = %transaction_id, "Timeout deferred to in-flight confirm");
                    return Ok(HoldOutcome::NoOp);
                }
                Expiry::Gone => None,
            },
            ReleaseReason::Cancelled(_) => {
                self.inner
                    .holds
                    .finish(account_id, transaction_id, HoldStatus::Cancelled)
            }
        };
        let Some(finished) = finished else {
            debug!(account_id = %account_id, transaction_id = %transaction_id, "Release for unknown or finished hold");
            return Ok(HoldOutcome::NoOp);
        };
        // The timeout task must not abort itself mid-release
        if reason != ReleaseReason::Timeout {
            if let Some(timer) = finished.timer {
                timer.abort();
            }
        }

        let hold = finished.hold;
        if let Some(mut snapshot) = self.inner.cache.get(account_id).await {
            snapshot.reverse_hold(hold.amount, hold.direction);
            self.inner.cache.replace(&snapshot).await;
        }

        self.enqueue(QueuedDelta::new(
            account_id.clone(),
            transaction_id.clone(),
            hold.amount,
            hold.direction,
            DeltaKind::Release,
        ));

        self.inner.metrics.holds_cancelled.inc();
        self.inner.metrics.holds_active.dec();
        self.inner.events.publish(BalanceEvent::TransactionCancelled {
            account_id: account_id.clone(),
            transaction_id: transaction_id.clone(),
            amount: hold.amount,
            reason: reason.to_string(),
        });
        debug!(account_id = %account_id, transaction_id = %transaction_id, %reason, "Hold released");

        drop(guard);
        self.spawn_notify(account_id.clone());
        Ok(HoldOutcome::Cancelled)
    }

    fn enqueue(&self, delta: QueuedDelta) {
        if let Err(e) = self.inner.flusher.enqueue(delta) {
            warn!("Delta not queued: {}", e);
        }
    }

    // Subscriptions and events

    /// Subscribe a listener; the current balance is pushed immediately
    pub async fn subscribe(&self, account_id: AccountId, listener_id: ListenerId) -> Result<Subscription> {
        self.ensure_running()?;
        let view = self.get_balance(&account_id).await?;
        Ok(self
            .inner
            .broadcaster
            .register(account_id, listener_id, Some(view)))
    }

    /// Recompute and push an account's balance to its listeners
    ///
    /// Returns the number of listeners reached.
    pub async fn notify(&self, account_id: &AccountId) -> usize {
        let listeners = self.inner.broadcaster.listener_count(account_id);
        if listeners == 0 && self.inner.events.consumer_count() == 0 {
            return 0;
        }

        match self.get_balance(account_id).await {
            Ok(view) => {
                let delivered = self.inner.broadcaster.publish(&view);
                self.inner.events.publish(BalanceEvent::BalanceUpdate {
                    account_id: account_id.clone(),
                    balance: Box::new(view),
                });
                delivered
            }
            Err(e) => {
                warn!(account_id = %account_id, "Balance notification skipped: {}", e);
                0
            }
        }
    }

    fn spawn_notify(&self, account_id: AccountId) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.notify(&account_id).await;
        });
    }

    /// Stream of named engine events
    pub fn events(&self) -> broadcast::Receiver<BalanceEvent> {
        self.inner.events.subscribe()
    }

    // Operations

    /// Drain the delta queue now
    pub async fn flush_now(&self) -> Result<usize> {
        self.inner.flusher.flush().await
    }

    /// Run a snapshot pass now
    pub fn take_snapshot(&self) -> Result<usize> {
        self.inner.snapshots.run_once()
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Stop background work and drop in-memory state
    ///
    /// Cancels the snapshot loop and every hold timer, makes a final flush
    /// attempt and clears subscriptions, holds and cached balances.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down balance engine");

        let snapshot_task = self.inner.snapshot_task.lock().take();
        if let Some(task) = snapshot_task {
            task.abort();
        }

        let timers = self.inner.holds.clear();
        let abandoned = timers.len();
        timers.iter().for_each(|timer| timer.abort());
        if abandoned > 0 {
            warn!(holds = abandoned, "Pending holds dropped at shutdown");
        }

        let flushed = self.inner.flusher.shutdown().await;
        let flusher_task = self.inner.flusher_task.lock().take();
        if let Some(task) = flusher_task {
            let _ = task.await;
        }

        self.inner.broadcaster.clear();
        self.inner.cache.clear().await;
        self.inner.locks.clear();
        self.inner.metrics.holds_active.set(0);

        let flushed = flushed?;
        info!(deltas = flushed, "Balance engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::storage::MemoryStore;
    use crate::types::AccountStatus;
    use velocity_engine::{ProgramType, WarningKind};

    async fn engine_with(accounts: Vec<AccountRecord>) -> (BalanceEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_accounts(accounts));
        let mut config = Config::default();
        config.snapshot.enabled = false;
        let cache = Arc::new(MemoryCache::new(config.cache.local_ttl()));
        let engine = BalanceEngine::start(config, store.clone(), cache).unwrap();
        (engine, store)
    }

    fn snap_account(balance: i64) -> AccountRecord {
        AccountRecord::new("ACC1", "H1", ProgramType::Snap, Decimal::from(balance))
    }

    fn acc() -> AccountId {
        AccountId::new("ACC1")
    }

    #[tokio::test]
    async fn test_create_hold_validation() {
        let (engine, _store) = engine_with(vec![snap_account(100)]).await;

        let err = engine
            .create_hold(acc(), "T1".into(), Decimal::ZERO, Direction::Debit)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));

        let err = engine
            .create_hold("NOPE".into(), "T1".into(), Decimal::ONE, Direction::Debit)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        engine
            .create_hold(acc(), "T1".into(), Decimal::ONE, Direction::Debit)
            .await
            .unwrap();
        let err = engine
            .create_hold(acc(), "T1".into(), Decimal::ONE, Direction::Debit)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateHold { .. }));
    }

    #[tokio::test]
    async fn test_hold_adjusts_cached_balance() {
        let (engine, _store) = engine_with(vec![snap_account(100)]).await;

        // Warm the cache so the optimistic path is exercised
        engine.get_balance(&acc()).await.unwrap();
        engine
            .create_hold(acc(), "T1".into(), Decimal::from(40), Direction::Debit)
            .await
            .unwrap();
        engine
            .create_hold(acc(), "T2".into(), Decimal::from(15), Direction::Credit)
            .await
            .unwrap();

        let view = engine.get_balance(&acc()).await.unwrap();
        assert_eq!(view.snapshot.current_balance, Decimal::from(100));
        assert_eq!(view.snapshot.available_balance, Decimal::from(60));
        assert_eq!(view.snapshot.pending_credits, Decimal::from(15));
        assert!(engine.metrics().cache_hits.get() >= 1);
    }

    #[tokio::test]
    async fn test_confirm_unknown_hold_is_noop() {
        let (engine, store) = engine_with(vec![snap_account(100)]).await;
        let outcome = engine.confirm(&acc(), &"T404".into(), None).await.unwrap();
        assert_eq!(outcome, HoldOutcome::NoOp);
        assert_eq!(store.settlement_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_confirm_keeps_hold_pending() {
        let (engine, store) = engine_with(vec![snap_account(100)]).await;
        engine
            .create_hold(acc(), "T1".into(), Decimal::from(30), Direction::Debit)
            .await
            .unwrap();

        store.fail_next_settlements(1);
        let err = engine.confirm(&acc(), &"T1".into(), None).await.unwrap_err();
        assert!(matches!(err, Error::TransientStoreFailure(_)));
        assert_eq!(engine.pending_holds(&acc()).len(), 1);

        let outcome = engine.confirm(&acc(), &"T1".into(), None).await.unwrap();
        assert_eq!(outcome, HoldOutcome::Confirmed { amount: Decimal::from(30) });
        assert!(engine.pending_holds(&acc()).is_empty());
    }

    /// Queue a timeout release and then a confirm behind a held account lock
    async fn race_timeout_and_confirm(
        engine: &BalanceEngine,
    ) -> (JoinHandle<HoldOutcome>, JoinHandle<Result<HoldOutcome>>) {
        let lock = engine.account_lock(&acc());
        let guard = lock.lock().await;

        let timeout = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .release_hold(&acc(), &"T1".into(), ReleaseReason::Timeout)
                    .await
                    .unwrap()
            })
        };
        tokio::task::yield_now().await;
        let confirm = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.confirm(&acc(), &"T1".into(), None).await })
        };
        tokio::task::yield_now().await;

        drop(guard);
        (timeout, confirm)
    }

    #[tokio::test]
    async fn test_confirm_waiting_on_lock_beats_timeout() {
        let (engine, store) = engine_with(vec![snap_account(100)]).await;
        engine
            .create_hold(acc(), "T1".into(), Decimal::from(30), Direction::Debit)
            .await
            .unwrap();

        // The timeout reaches the lock first but must not release
        let (timeout, confirm) = race_timeout_and_confirm(&engine).await;
        assert_eq!(timeout.await.unwrap(), HoldOutcome::NoOp);
        assert_eq!(
            confirm.await.unwrap().unwrap(),
            HoldOutcome::Confirmed { amount: Decimal::from(30) }
        );

        engine.flush_now().await.unwrap();
        assert_eq!(store.settlement_count(), 1);
        assert!(store.delta_log().iter().all(|d| d.kind != DeltaKind::Release));
        assert_eq!(engine.metrics().holds_cancelled.get(), 0);

        let view = engine.get_balance(&acc()).await.unwrap();
        assert_eq!(view.snapshot.current_balance, Decimal::from(70));
    }

    #[tokio::test]
    async fn test_deferred_timeout_fires_after_failed_confirm() {
        let (engine, store) = engine_with(vec![snap_account(100)]).await;
        engine
            .create_hold(acc(), "T1".into(), Decimal::from(30), Direction::Debit)
            .await
            .unwrap();
        store.fail_next_settlements(1);

        let (timeout, confirm) = race_timeout_and_confirm(&engine).await;
        assert_eq!(timeout.await.unwrap(), HoldOutcome::NoOp);
        assert!(confirm.await.unwrap().is_err());

        // The timeout is re-armed with no delay
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.pending_holds(&acc()).is_empty());
        assert_eq!(engine.metrics().holds_cancelled.get(), 1);

        engine.flush_now().await.unwrap();
        assert_eq!(store.settlement_count(), 0);
        assert_eq!(
            store.delta_log().iter().filter(|d| d.kind == DeltaKind::Release).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_view_carries_warnings_and_headroom() {
        let (engine, _store) = engine_with(vec![snap_account(30)]).await;
        let view = engine.get_balance(&acc()).await.unwrap();

        assert_eq!(view.warnings[0].kind, WarningKind::LowBalance);
        assert_eq!(view.limits.daily_limit, Some(Decimal::from(200)));
        assert_eq!(view.headroom.remaining_daily_amount, Some(Decimal::from(200)));
        assert_eq!(view.headroom.remaining_transactions, Some(10));
    }

    #[tokio::test]
    async fn test_aggregated_balance_skips_inactive_accounts() {
        let mut closed = AccountRecord::new("ACC3", "H1", ProgramType::Snap, Decimal::from(999));
        closed.status = AccountStatus::Closed;
        let (engine, _store) = engine_with(vec![
            snap_account(100),
            AccountRecord::new("ACC2", "H1", ProgramType::Tanf, Decimal::from(250)),
            AccountRecord::new("ACC4", "H2", ProgramType::Snap, Decimal::from(70)),
            closed,
        ])
        .await;
        engine
            .create_hold(acc(), "T1".into(), Decimal::from(40), Direction::Debit)
            .await
            .unwrap();

        let view = engine.get_aggregated_balance(&HolderId::new("H1")).await.unwrap();
        assert_eq!(view.total_balance, Decimal::from(350));
        assert_eq!(view.total_pending, Decimal::from(40));
        assert_eq!(view.total_available, Decimal::from(310));
        assert_eq!(view.programs[&ProgramType::Snap].available, Decimal::from(60));
        assert_eq!(view.programs[&ProgramType::Tanf].balance, Decimal::from(250));
    }

    #[tokio::test]
    async fn test_subscribe_pushes_current_balance() {
        let (engine, _store) = engine_with(vec![snap_account(100)]).await;
        let mut sub = engine.subscribe(acc(), ListenerId::new("socket-1")).await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.snapshot.available_balance, Decimal::from(100));

        engine
            .create_hold(acc(), "T1".into(), Decimal::from(25), Direction::Debit)
            .await
            .unwrap();
        let update = sub.recv().await.unwrap();
        assert_eq!(update.snapshot.available_balance, Decimal::from(75));
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let (engine, _store) = engine_with(vec![snap_account(100)]).await;
        let mut events = engine.events();

        engine
            .create_hold(acc(), "T1".into(), Decimal::from(10), Direction::Debit)
            .await
            .unwrap();
        engine.release(&acc(), &"T1".into(), "customer cancelled").await.unwrap();

        let mut names = Vec::new();
        while names.len() < 2 {
            let event = events.recv().await.unwrap();
            if !matches!(event, BalanceEvent::BalanceUpdate { .. }) {
                names.push(event.name());
            }
        }
        assert_eq!(names, vec!["pending_transaction", "transaction_cancelled"]);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_holds() {
        let (engine, store) = engine_with(vec![snap_account(100)]).await;
        engine
            .create_hold(acc(), "T1".into(), Decimal::from(10), Direction::Debit)
            .await
            .unwrap();

        engine.shutdown().await.unwrap();
        assert!(engine.pending_holds(&acc()).is_empty());
        assert_eq!(store.delta_log().len(), 1);
        assert!(matches!(
            engine
                .create_hold(acc(), "T2".into(), Decimal::ONE, Direction::Debit)
                .await,
            Err(Error::Concurrency(_))
        ));
        // Idempotent
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_history_of_unknown_account() {
        let (engine, _store) = engine_with(vec![snap_account(100)]).await;
        assert!(matches!(
            engine.get_balance_history(&"NOPE".into(), 7).await,
            Err(Error::NotFound(_))
        ));

        engine.take_snapshot().unwrap();
        let history = engine.get_balance_history(&acc(), 7).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].average_balance, Decimal::from(100));
    }
}
