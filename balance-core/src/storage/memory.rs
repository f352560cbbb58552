//! In-memory durable store
//!
//! Used by tests and by embedders without a data directory. Supports fault
//! injection so retry and failure paths can be exercised deterministically.

use super::{aggregate_activity, DurableStore};
use crate::error::{Error, Result};
use crate::types::{
    AccountId, AccountRecord, ActivityAggregates, HolderId, QueuedDelta, Settlement, SnapshotRow,
    TransactionId, TransactionSummary,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<AccountId, AccountRecord>,
    transactions: BTreeMap<AccountId, Vec<TransactionSummary>>,
    deltas: BTreeMap<Vec<u8>, QueuedDelta>,
    delta_log: Vec<QueuedDelta>,
    settlements: HashSet<(AccountId, TransactionId)>,
    snapshots: Vec<SnapshotRow>,
}

/// Durable store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
    failing_batches: AtomicUsize,
    failing_settlements: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl MemoryStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create store seeded with accounts
    pub fn with_accounts(accounts: impl IntoIterator<Item = AccountRecord>) -> Self {
        let store = Self::new();
        {
            let mut tables = store.tables.write();
            for account in accounts {
                tables.accounts.insert(account.account_id.clone(), account);
            }
        }
        store
    }

    /// Make every call fail until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` calls to `apply_deltas`
    pub fn fail_next_batches(&self, n: usize) {
        self.failing_batches.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` calls to `settle_hold`
    pub fn fail_next_settlements(&self, n: usize) {
        self.failing_settlements.store(n, Ordering::SeqCst);
    }

    /// Sizes of the successfully applied batches, in order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    /// Every delta application, retries included, in order
    pub fn delta_log(&self) -> Vec<QueuedDelta> {
        self.tables.read().delta_log.clone()
    }

    /// Distinct deltas after idempotent application
    pub fn distinct_delta_count(&self) -> usize {
        self.tables.read().deltas.len()
    }

    /// Number of distinct settled holds
    pub fn settlement_count(&self) -> usize {
        self.tables.read().settlements.len()
    }

    /// All stored snapshot rows
    pub fn snapshots(&self) -> Vec<SnapshotRow> {
        self.tables.read().snapshots.clone()
    }

    /// Record a posted transaction directly (seeding history)
    pub fn record_transaction(&self, account_id: &AccountId, tx: TransactionSummary) {
        self.tables
            .write()
            .transactions
            .entry(account_id.clone())
            .or_default()
            .push(tx);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::TransientStoreFailure("store unavailable".to_string()));
        }
        Ok(())
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl DurableStore for MemoryStore {
    fn upsert_account(&self, account: &AccountRecord) -> Result<()> {
        self.check()?;
        self.tables
            .write()
            .accounts
            .insert(account.account_id.clone(), account.clone());
        Ok(())
    }

    fn get_account(&self, account_id: &AccountId) -> Result<Option<AccountRecord>> {
        self.check()?;
        Ok(self.tables.read().accounts.get(account_id).cloned())
    }

    fn active_accounts(&self) -> Result<Vec<AccountRecord>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .accounts
            .values()
            .filter(|a| a.is_active())
            .cloned()
            .collect())
    }

    fn accounts_for_holder(&self, holder_id: &HolderId) -> Result<Vec<AccountRecord>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .accounts
            .values()
            .filter(|a| &a.holder_id == holder_id)
            .cloned()
            .collect())
    }

    fn activity(&self, account_id: &AccountId, now: DateTime<Utc>) -> Result<ActivityAggregates> {
        self.check()?;
        let tables = self.tables.read();
        Ok(tables
            .transactions
            .get(account_id)
            .map(|txs| aggregate_activity(txs, now))
            .unwrap_or_default())
    }

    fn recent_transactions(&self, account_id: &AccountId, limit: usize) -> Result<Vec<TransactionSummary>> {
        self.check()?;
        let tables = self.tables.read();
        let mut txs = tables.transactions.get(account_id).cloned().unwrap_or_default();
        txs.sort_by(|a, b| b.posted_at.cmp(&a.posted_at));
        txs.truncate(limit);
        Ok(txs)
    }

    fn apply_deltas(&self, deltas: &[QueuedDelta]) -> Result<()> {
        self.check()?;
        if Self::take_failure(&self.failing_batches) {
            return Err(Error::TransientStoreFailure("injected batch failure".to_string()));
        }

        let mut tables = self.tables.write();
        for delta in deltas {
            tables.deltas.insert(delta.idempotency_key(), delta.clone());
            tables.delta_log.push(delta.clone());
        }
        self.batch_sizes.lock().push(deltas.len());
        Ok(())
    }

    fn settle_hold(&self, settlement: &Settlement) -> Result<()> {
        self.check()?;
        if Self::take_failure(&self.failing_settlements) {
            return Err(Error::TransientStoreFailure("injected settlement failure".to_string()));
        }

        let mut tables = self.tables.write();
        let key = (settlement.account_id.clone(), settlement.transaction_id.clone());
        if tables.settlements.contains(&key) {
            return Ok(());
        }

        let account = tables
            .accounts
            .get_mut(&settlement.account_id)
            .ok_or_else(|| Error::NotFound(format!("account {}", settlement.account_id)))?;
        account.current_balance += settlement.balance_change();

        tables
            .transactions
            .entry(settlement.account_id.clone())
            .or_default()
            .push(settlement.to_summary());
        tables.settlements.insert(key);
        Ok(())
    }

    fn insert_snapshots(&self, rows: &[SnapshotRow]) -> Result<()> {
        self.check()?;
        self.tables.write().snapshots.extend_from_slice(rows);
        Ok(())
    }

    fn snapshots_since(&self, account_id: &AccountId, since: DateTime<Utc>) -> Result<Vec<SnapshotRow>> {
        self.check()?;
        let mut rows: Vec<SnapshotRow> = self
            .tables
            .read()
            .snapshots
            .iter()
            .filter(|row| &row.account_id == account_id && row.taken_at >= since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.taken_at.cmp(&b.taken_at));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeltaKind, Direction};
    use rust_decimal::Decimal;
    use velocity_engine::ProgramType;

    fn store() -> MemoryStore {
        MemoryStore::with_accounts(vec![AccountRecord::new(
            "ACC1",
            "H1",
            ProgramType::Snap,
            Decimal::from(100),
        )])
    }

    fn settlement(txid: &str, reserved: i64, final_amount: i64) -> Settlement {
        Settlement {
            account_id: AccountId::new("ACC1"),
            transaction_id: TransactionId::new(txid),
            direction: Direction::Debit,
            reserved_amount: Decimal::from(reserved),
            final_amount: Decimal::from(final_amount),
            settled_at: Utc::now(),
        }
    }

    #[test]
    fn test_settle_is_idempotent() {
        let store = store();
        store.settle_hold(&settlement("T1", 50, 60)).unwrap();
        store.settle_hold(&settlement("T1", 50, 60)).unwrap();

        let account = store.get_account(&AccountId::new("ACC1")).unwrap().unwrap();
        assert_eq!(account.current_balance, Decimal::from(40));
        assert_eq!(store.settlement_count(), 1);

        let activity = store.activity(&AccountId::new("ACC1"), Utc::now()).unwrap();
        assert_eq!(activity.daily_spent, Decimal::from(60));
        assert_eq!(activity.daily_transaction_count, 1);
    }

    #[test]
    fn test_injected_batch_failure() {
        let store = store();
        let delta = QueuedDelta::new(
            AccountId::new("ACC1"),
            TransactionId::new("T1"),
            Decimal::from(10),
            Direction::Debit,
            DeltaKind::Reserve,
        );

        store.fail_next_batches(1);
        assert!(store.apply_deltas(&[delta.clone()]).unwrap_err().is_transient());

        store.apply_deltas(&[delta.clone()]).unwrap();
        store.apply_deltas(&[delta]).unwrap();
        assert_eq!(store.batch_sizes(), vec![1, 1]);
        assert_eq!(store.delta_log().len(), 2);
        assert_eq!(store.distinct_delta_count(), 1);
    }

    #[test]
    fn test_unavailable_store() {
        let store = store();
        store.set_unavailable(true);
        assert!(store.get_account(&AccountId::new("ACC1")).is_err());
        store.set_unavailable(false);
        assert!(store.get_account(&AccountId::new("ACC1")).unwrap().is_some());
    }

    #[test]
    fn test_settle_unknown_account() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.settle_hold(&settlement("T1", 10, 10)),
            Err(Error::NotFound(_))
        ));
    }
}
