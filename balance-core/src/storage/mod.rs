//! Durable store abstraction
//!
//! The store is the single source of truth for `current_balance`. Calls are
//! synchronous (RocksDB is); async callers run them inline on short paths
//! and never hold an account lock across anything but a single call.

mod memory;
mod rocks;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

use crate::error::Result;
use crate::types::{
    AccountId, AccountRecord, ActivityAggregates, Direction, HolderId, QueuedDelta, Settlement,
    SnapshotRow, TransactionSummary,
};
use chrono::{DateTime, Datelike, NaiveTime, Utc};

/// Durable balance store
pub trait DurableStore: Send + Sync {
    /// Insert or replace an account row
    fn upsert_account(&self, account: &AccountRecord) -> Result<()>;

    /// Point lookup of an account row
    fn get_account(&self, account_id: &AccountId) -> Result<Option<AccountRecord>>;

    /// All accounts with status ACTIVE
    fn active_accounts(&self) -> Result<Vec<AccountRecord>>;

    /// All accounts of a holder, any status
    fn accounts_for_holder(&self, holder_id: &HolderId) -> Result<Vec<AccountRecord>>;

    /// Daily and monthly spend aggregates as of `now`
    fn activity(&self, account_id: &AccountId, now: DateTime<Utc>) -> Result<ActivityAggregates>;

    /// Posted transactions, newest first
    fn recent_transactions(&self, account_id: &AccountId, limit: usize) -> Result<Vec<TransactionSummary>>;

    /// Persist a batch of deltas in one atomic write
    ///
    /// Re-applying a delta with the same idempotency key overwrites the
    /// earlier record.
    fn apply_deltas(&self, deltas: &[QueuedDelta]) -> Result<()>;

    /// Post a confirmed hold to `current_balance`
    ///
    /// Idempotent per `(account_id, transaction_id)`.
    fn settle_hold(&self, settlement: &Settlement) -> Result<()>;

    /// Insert snapshot rows
    fn insert_snapshots(&self, rows: &[SnapshotRow]) -> Result<()>;

    /// Snapshots of an account taken at or after `since`, oldest first
    fn snapshots_since(&self, account_id: &AccountId, since: DateTime<Utc>) -> Result<Vec<SnapshotRow>>;
}

/// Fold posted transactions into spend aggregates (UTC day / month)
pub(crate) fn aggregate_activity<'a>(
    transactions: impl IntoIterator<Item = &'a TransactionSummary>,
    now: DateTime<Utc>,
) -> ActivityAggregates {
    let today = now.date_naive();
    let start_of_day = today.and_time(NaiveTime::MIN).and_utc();
    let start_of_month = today
        .with_day(1)
        .map(|first| first.and_time(NaiveTime::MIN).and_utc())
        .unwrap_or(start_of_day);

    let mut activity = ActivityAggregates::default();
    for tx in transactions {
        if tx.posted_at >= start_of_day {
            activity.daily_transaction_count += 1;
        }
        if tx.direction != Direction::Debit {
            continue;
        }
        if tx.posted_at >= start_of_day {
            activity.daily_spent += tx.amount;
        }
        if tx.posted_at >= start_of_month {
            activity.monthly_spent += tx.amount;
        }
    }
    activity
}
