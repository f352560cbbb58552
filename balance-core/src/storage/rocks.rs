//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Balance rows (key: account_id)
//! - `transactions` - Posted transactions (key: account_id | posted_at_ms | transaction_id)
//! - `settlements` - Settled hold markers (key: account_id | transaction_id)
//! - `deltas` - Delta audit trail (key: idempotency key)
//! - `snapshots` - Point-in-time balances (key: account_id | taken_at_ms)
//!
//! `account_id` is written length-prefixed (`u32` BE), so one account's key
//! range never contains another's.

use super::{aggregate_activity, DurableStore};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{
    push_key_component, AccountId, AccountRecord, ActivityAggregates, HolderId, QueuedDelta,
    Settlement, SnapshotRow, TransactionSummary,
};
use chrono::{DateTime, Datelike, NaiveTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction as ScanDirection, IteratorMode, Options,
    WriteBatch, DB,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_TRANSACTIONS: &str = "transactions";
const CF_SETTLEMENTS: &str = "settlements";
const CF_DELTAS: &str = "deltas";
const CF_SNAPSHOTS: &str = "snapshots";

/// Durable store backed by RocksDB
pub struct RocksStore {
    db: Arc<DB>,
    // Serializes read-modify-write of account rows
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create database under `config.data_dir`
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_point()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_SETTLEMENTS, Self::cf_options_point()),
            ColumnFamilyDescriptor::new(CF_DELTAS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_SNAPSHOTS, Self::cf_options_log()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        tracing::info!(path = ?path, "Opened balance store");

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    // Column family options

    fn cf_options_point() -> Options {
        let mut opts = Options::default();
        // Hot point lookups, use LZ4 and bloom filters
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::TransientStoreFailure(format!("Column family {} not found", name)))
    }

    /// Forward scan of `cf` starting at `from`, while keys share `prefix`
    fn scan<T: DeserializeOwned>(&self, cf_name: &str, prefix: &[u8], from: &[u8]) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(from, ScanDirection::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    fn all<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    // Key helpers

    fn account_prefix(account_id: &AccountId) -> Vec<u8> {
        let mut key = Vec::new();
        push_key_component(&mut key, account_id.as_str());
        key
    }

    fn timed_key(account_id: &AccountId, at: DateTime<Utc>) -> Vec<u8> {
        let mut key = Self::account_prefix(account_id);
        key.extend_from_slice(&(at.timestamp_millis().max(0) as u64).to_be_bytes());
        key
    }

    fn transaction_key(account_id: &AccountId, tx: &TransactionSummary) -> Vec<u8> {
        let mut key = Self::timed_key(account_id, tx.posted_at);
        key.extend_from_slice(tx.transaction_id.as_str().as_bytes());
        key
    }

    fn settlement_key(settlement: &Settlement) -> Vec<u8> {
        let mut key = Self::account_prefix(&settlement.account_id);
        key.extend_from_slice(settlement.transaction_id.as_str().as_bytes());
        key
    }
}

impl DurableStore for RocksStore {
    fn upsert_account(&self, account: &AccountRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf = self.cf(CF_ACCOUNTS)?;
        let value = bincode::serialize(account)?;
        self.db.put_cf(&cf, account.account_id.as_str().as_bytes(), value)?;
        Ok(())
    }

    fn get_account(&self, account_id: &AccountId) -> Result<Option<AccountRecord>> {
        let cf = self.cf(CF_ACCOUNTS)?;
        match self.db.get_cf(&cf, account_id.as_str().as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn active_accounts(&self) -> Result<Vec<AccountRecord>> {
        let accounts: Vec<AccountRecord> = self.all(CF_ACCOUNTS)?;
        Ok(accounts.into_iter().filter(|a| a.is_active()).collect())
    }

    fn accounts_for_holder(&self, holder_id: &HolderId) -> Result<Vec<AccountRecord>> {
        let accounts: Vec<AccountRecord> = self.all(CF_ACCOUNTS)?;
        Ok(accounts
            .into_iter()
            .filter(|a| &a.holder_id == holder_id)
            .collect())
    }

    fn activity(&self, account_id: &AccountId, now: DateTime<Utc>) -> Result<ActivityAggregates> {
        let today = now.date_naive();
        let start_of_month = today
            .with_day(1)
            .unwrap_or(today)
            .and_time(NaiveTime::MIN)
            .and_utc();

        let prefix = Self::account_prefix(account_id);
        let from = Self::timed_key(account_id, start_of_month);
        let txs: Vec<TransactionSummary> = self.scan(CF_TRANSACTIONS, &prefix, &from)?;
        Ok(aggregate_activity(&txs, now))
    }

    fn recent_transactions(&self, account_id: &AccountId, limit: usize) -> Result<Vec<TransactionSummary>> {
        let cf = self.cf(CF_TRANSACTIONS)?;
        let prefix = Self::account_prefix(account_id);
        let mut upper = prefix.clone();
        upper.extend_from_slice(&[0xFF; 9]);

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, ScanDirection::Reverse));

        let mut out = Vec::with_capacity(limit);
        for item in iter {
            if out.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    fn apply_deltas(&self, deltas: &[QueuedDelta]) -> Result<()> {
        let cf = self.cf(CF_DELTAS)?;
        let mut batch = WriteBatch::default();
        for delta in deltas {
            batch.put_cf(&cf, delta.idempotency_key(), bincode::serialize(delta)?);
        }

        // Atomic commit
        self.db.write(batch)?;

        tracing::debug!(count = deltas.len(), "Delta batch written");
        Ok(())
    }

    fn settle_hold(&self, settlement: &Settlement) -> Result<()> {
        let _guard = self.write_lock.lock();

        let cf_settlements = self.cf(CF_SETTLEMENTS)?;
        let settlement_key = Self::settlement_key(settlement);
        if self.db.get_cf(&cf_settlements, &settlement_key)?.is_some() {
            return Ok(());
        }

        let mut account = self
            .get_account(&settlement.account_id)?
            .ok_or_else(|| Error::NotFound(format!("account {}", settlement.account_id)))?;
        account.current_balance += settlement.balance_change();

        let summary = settlement.to_summary();
        let mut batch = WriteBatch::default();

        let cf_accounts = self.cf(CF_ACCOUNTS)?;
        batch.put_cf(
            &cf_accounts,
            account.account_id.as_str().as_bytes(),
            bincode::serialize(&account)?,
        );

        let cf_transactions = self.cf(CF_TRANSACTIONS)?;
        batch.put_cf(
            &cf_transactions,
            Self::transaction_key(&settlement.account_id, &summary),
            bincode::serialize(&summary)?,
        );

        batch.put_cf(&cf_settlements, &settlement_key, bincode::serialize(&settlement.settled_at)?);

        self.db.write(batch)?;

        tracing::debug!(
            account_id = %settlement.account_id,
            transaction_id = %settlement.transaction_id,
            balance = %account.current_balance,
            "Hold settled"
        );
        Ok(())
    }

    fn insert_snapshots(&self, rows: &[SnapshotRow]) -> Result<()> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut batch = WriteBatch::default();
        for row in rows {
            batch.put_cf(
                &cf,
                Self::timed_key(&row.account_id, row.taken_at),
                bincode::serialize(row)?,
            );
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn snapshots_since(&self, account_id: &AccountId, since: DateTime<Utc>) -> Result<Vec<SnapshotRow>> {
        let prefix = Self::account_prefix(account_id);
        let from = Self::timed_key(account_id, since);
        self.scan(CF_SNAPSHOTS, &prefix, &from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeltaKind, Direction, TransactionId};
    use rust_decimal::Decimal;
    use tempfile::TempDir;
    use velocity_engine::ProgramType;

    fn test_store() -> (RocksStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (RocksStore::open(&config).unwrap(), temp_dir)
    }

    fn seed(store: &RocksStore) -> AccountId {
        let account = AccountRecord::new("ACC1", "H1", ProgramType::Snap, Decimal::from(100));
        store.upsert_account(&account).unwrap();
        account.account_id
    }

    fn settlement(txid: &str, amount: i64, settled_at: DateTime<Utc>) -> Settlement {
        Settlement {
            account_id: AccountId::new("ACC1"),
            transaction_id: TransactionId::new(txid),
            direction: Direction::Debit,
            reserved_amount: Decimal::from(amount),
            final_amount: Decimal::from(amount),
            settled_at,
        }
    }

    #[test]
    fn test_store_open() {
        let (store, _temp) = test_store();
        assert!(store.db.cf_handle(CF_ACCOUNTS).is_some());
        assert!(store.db.cf_handle(CF_SNAPSHOTS).is_some());
    }

    #[test]
    fn test_account_roundtrip_and_filters() {
        let (store, _temp) = test_store();
        let id = seed(&store);

        let mut closed = AccountRecord::new("ACC2", "H1", ProgramType::Wic, Decimal::from(5));
        closed.status = crate::types::AccountStatus::Closed;
        store.upsert_account(&closed).unwrap();
        store
            .upsert_account(&AccountRecord::new("ACC3", "H2", ProgramType::Tanf, Decimal::ONE))
            .unwrap();

        assert_eq!(store.get_account(&id).unwrap().unwrap().current_balance, Decimal::from(100));
        assert!(store.get_account(&AccountId::new("missing")).unwrap().is_none());
        assert_eq!(store.active_accounts().unwrap().len(), 2);
        assert_eq!(store.accounts_for_holder(&HolderId::new("H1")).unwrap().len(), 2);
    }

    #[test]
    fn test_settle_posts_balance_once() {
        let (store, _temp) = test_store();
        let id = seed(&store);

        let mut overpaid = settlement("T1", 50, Utc::now());
        overpaid.final_amount = Decimal::from(60);
        store.settle_hold(&overpaid).unwrap();
        store.settle_hold(&overpaid).unwrap();

        let account = store.get_account(&id).unwrap().unwrap();
        assert_eq!(account.current_balance, Decimal::from(40));

        let activity = store.activity(&id, Utc::now()).unwrap();
        assert_eq!(activity.daily_spent, Decimal::from(60));
        assert_eq!(activity.daily_transaction_count, 1);
    }

    #[test]
    fn test_recent_transactions_newest_first() {
        let (store, _temp) = test_store();
        let id = seed(&store);
        let now = Utc::now();

        for i in 0..7 {
            store
                .settle_hold(&settlement(&format!("T{}", i), 1, now - chrono::Duration::minutes(10 - i)))
                .unwrap();
        }
        // Another account sharing the id prefix must not leak in
        store
            .upsert_account(&AccountRecord::new("ACC10", "H1", ProgramType::Snap, Decimal::from(10)))
            .unwrap();

        let recent = store.recent_transactions(&id, 5).unwrap();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].transaction_id, TransactionId::new("T6"));
        assert_eq!(recent[4].transaction_id, TransactionId::new("T2"));
    }

    #[test]
    fn test_pipe_in_ids_does_not_alias_accounts() {
        let (store, _temp) = test_store();
        let short = seed(&store);
        let long = AccountRecord::new("ACC1|B", "H1", ProgramType::Snap, Decimal::from(100));
        store.upsert_account(&long).unwrap();

        let now = Utc::now();
        store.settle_hold(&settlement("B|T", 10, now)).unwrap();
        store
            .settle_hold(&Settlement {
                account_id: long.account_id.clone(),
                ..settlement("T", 25, now)
            })
            .unwrap();

        assert_eq!(store.get_account(&short).unwrap().unwrap().current_balance, Decimal::from(90));
        assert_eq!(
            store.get_account(&long.account_id).unwrap().unwrap().current_balance,
            Decimal::from(75)
        );

        let activity = store.activity(&short, now).unwrap();
        assert_eq!(activity.daily_spent, Decimal::from(10));
        assert_eq!(activity.daily_transaction_count, 1);
        let recent = store.recent_transactions(&short, 5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].transaction_id, TransactionId::new("B|T"));
    }

    #[test]
    fn test_delta_batch_is_idempotent() {
        let (store, _temp) = test_store();
        let delta = QueuedDelta::new(
            AccountId::new("ACC1"),
            TransactionId::new("T1"),
            Decimal::from(10),
            Direction::Debit,
            DeltaKind::Reserve,
        );
        store.apply_deltas(&[delta.clone()]).unwrap();
        store.apply_deltas(&[delta]).unwrap();

        let cf = store.cf(CF_DELTAS).unwrap();
        let count = store.db.iterator_cf(&cf, IteratorMode::Start).count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_snapshots_since() {
        let (store, _temp) = test_store();
        let id = seed(&store);
        let now = Utc::now();
        let rows: Vec<SnapshotRow> = (0..3)
            .map(|h| SnapshotRow {
                account_id: id.clone(),
                balance: Decimal::from(100 - h),
                taken_at: now - chrono::Duration::hours(h),
            })
            .collect();
        store.insert_snapshots(&rows).unwrap();

        let since = store.snapshots_since(&id, now - chrono::Duration::minutes(90)).unwrap();
        assert_eq!(since.len(), 2);
        assert!(since[0].taken_at < since[1].taken_at);
    }
}
