//! Periodic balance snapshots
//!
//! Fires on a fixed interval (hourly by default) and writes one row per
//! active account. A failed run is logged and counted; the loop keeps going.

use crate::error::Result;
use crate::metrics::Metrics;
use crate::storage::DurableStore;
use crate::types::{AccountId, DailyBalance, SnapshotRow};
use chrono::{DateTime, Days, NaiveTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Snapshot scheduler
pub struct SnapshotScheduler {
    store: Arc<dyn DurableStore>,
    interval: Duration,
    metrics: Metrics,
    last_run: RwLock<Option<DateTime<Utc>>>,
}

impl SnapshotScheduler {
    /// Create new scheduler
    pub fn new(store: Arc<dyn DurableStore>, interval: Duration, metrics: Metrics) -> Arc<Self> {
        Arc::new(Self {
            store,
            interval,
            metrics,
            last_run: RwLock::new(None),
        })
    }

    /// Run the scheduler loop in a background task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).start())
    }

    /// Start scheduler loop
    pub async fn start(self: Arc<Self>) {
        info!(interval_secs = self.interval.as_secs(), "Starting snapshot scheduler");

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if let Err(e) = self.run_once() {
                warn!("Snapshot run failed: {}", e);
            }
        }
    }

    /// Snapshot every active account now
    pub fn run_once(&self) -> Result<usize> {
        let result = self.write_snapshots();
        match &result {
            Ok(count) => {
                self.metrics.snapshots_written.inc_by(*count as u64);
                *self.last_run.write() = Some(Utc::now());
                debug!(accounts = count, "Balance snapshots written");
            }
            Err(_) => self.metrics.snapshot_failures.inc(),
        }
        result
    }

    fn write_snapshots(&self) -> Result<usize> {
        let taken_at = Utc::now();
        let rows: Vec<SnapshotRow> = self
            .store
            .active_accounts()?
            .into_iter()
            .map(|account| SnapshotRow {
                account_id: account.account_id,
                balance: account.current_balance,
                taken_at,
            })
            .collect();

        if !rows.is_empty() {
            self.store.insert_snapshots(&rows)?;
        }
        Ok(rows.len())
    }

    /// Daily balance aggregates over the last `days` days, newest first
    ///
    /// The window starts at UTC midnight `days` days before today.
    pub fn history(&self, account_id: &AccountId, days: u32) -> Result<Vec<DailyBalance>> {
        let rows = self.store.snapshots_since(account_id, window_start(Utc::now(), days))?;
        Ok(DailyBalance::aggregate(&rows))
    }

    /// Completion time of the last successful run
    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.read()
    }
}

fn window_start(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    now.date_naive()
        .checked_sub_days(Days::new(u64::from(days)))
        .map(|day| day.and_time(NaiveTime::MIN).and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{AccountRecord, AccountStatus};
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use velocity_engine::ProgramType;

    fn store() -> Arc<MemoryStore> {
        let mut closed = AccountRecord::new("ACC3", "H1", ProgramType::Wic, Decimal::from(9));
        closed.status = AccountStatus::Closed;
        Arc::new(MemoryStore::with_accounts(vec![
            AccountRecord::new("ACC1", "H1", ProgramType::Snap, Decimal::from(100)),
            AccountRecord::new("ACC2", "H1", ProgramType::Tanf, Decimal::from(250)),
            closed,
        ]))
    }

    #[test]
    fn test_run_once_snapshots_active_accounts() {
        let store = store();
        let scheduler = SnapshotScheduler::new(store.clone(), Duration::from_secs(3600), Metrics::new().unwrap());

        assert_eq!(scheduler.run_once().unwrap(), 2);
        assert_eq!(store.snapshots().len(), 2);
        assert!(scheduler.last_run().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_failed_run() {
        let store = store();
        let metrics = Metrics::new().unwrap();
        let scheduler = SnapshotScheduler::new(store.clone(), Duration::from_secs(3600), metrics.clone());
        let task = scheduler.spawn();

        store.set_unavailable(true);
        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert_eq!(metrics.snapshot_failures.get(), 1);
        assert!(store.snapshots().is_empty());

        store.set_unavailable(false);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(store.snapshots().len(), 2);
        assert_eq!(metrics.snapshots_written.get(), 2);

        task.abort();
    }

    #[test]
    fn test_window_starts_at_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 15, 30, 0).unwrap();
        assert_eq!(window_start(now, 0), Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap());
        assert_eq!(window_start(now, 7), Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap());
        assert_eq!(window_start(now, u32::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_history_keeps_morning_of_first_day() {
        let store = store();
        let account = AccountId::new("ACC1");
        let first_day = (Utc::now() - chrono::Duration::days(2)).date_naive();
        store
            .insert_snapshots(&[SnapshotRow {
                account_id: account.clone(),
                balance: Decimal::from(42),
                taken_at: first_day.and_hms_opt(0, 30, 0).unwrap().and_utc(),
            }])
            .unwrap();

        let scheduler = SnapshotScheduler::new(store, Duration::from_secs(3600), Metrics::new().unwrap());
        let history = scheduler.history(&account, 2).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].date, first_day);
    }

    #[test]
    fn test_history_with_unbounded_window() {
        let store = store();
        let scheduler = SnapshotScheduler::new(store.clone(), Duration::from_secs(3600), Metrics::new().unwrap());
        scheduler.run_once().unwrap();

        let history = scheduler.history(&AccountId::new("ACC1"), u32::MAX).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].average_balance, Decimal::from(100));
    }

    #[test]
    fn test_history_aggregates_by_day() {
        let store = store();
        let now = Utc::now();
        let account = AccountId::new("ACC1");
        let rows: Vec<SnapshotRow> = [0i64, 1, 2, 24, 24 * 40]
            .iter()
            .zip([100, 80, 60, 50, 10])
            .map(|(hours_ago, balance)| SnapshotRow {
                account_id: account.clone(),
                balance: Decimal::from(balance),
                taken_at: now - chrono::Duration::hours(*hours_ago),
            })
            .collect();
        store.insert_snapshots(&rows).unwrap();

        let scheduler = SnapshotScheduler::new(store, Duration::from_secs(3600), Metrics::new().unwrap());
        let history = scheduler.history(&account, 30).unwrap();

        // The 40-day-old row falls outside the window
        let samples: u32 = history.iter().map(|d| d.samples).sum();
        assert_eq!(samples, 4);
        assert!(history.iter().all(|d| d.min_balance >= Decimal::from(50)));
        assert!(history.windows(2).all(|w| w[0].date > w[1].date));
    }
}
