//! Pending hold ledger
//!
//! In-memory record of in-flight reservations. Every hold makes exactly one
//! terminal transition; `finish` is the single check-and-transition point
//! both the confirm and the release paths go through.
//!
//! A confirm claims its hold (`begin_confirm`) before it queues for the
//! account lock. A timeout that fires while a claim is outstanding backs off
//! (`expire` returns [`Expiry::Deferred`]), so confirmation wins the race.

use crate::error::{Error, Result};
use crate::types::{AccountId, Direction, HoldStatus, PendingHold, PendingTotals, TransactionId};
use chrono::Utc;
use dashmap::{mapref::one::RefMut, DashMap};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

struct HoldEntry {
    hold: PendingHold,
    created: Instant,
    timer: Option<AbortHandle>,
    confirms_in_flight: u32,
    expiry_deferred: bool,
}

type AccountHolds<'a> = RefMut<'a, AccountId, HashMap<TransactionId, HoldEntry>>;

/// A hold that just reached a terminal state
#[derive(Debug)]
pub struct FinishedHold {
    /// The hold, with its terminal status
    pub hold: PendingHold,

    /// Its timeout task, if one was armed
    pub timer: Option<AbortHandle>,
}

/// What a firing timeout did to its hold
#[derive(Debug)]
pub enum Expiry {
    /// The hold was cancelled
    Released(FinishedHold),

    /// A confirm is in flight; the hold stays PENDING
    Deferred,

    /// The hold already left PENDING
    Gone,
}

/// Pending holds grouped by account
pub struct HoldLedger {
    holds: DashMap<AccountId, HashMap<TransactionId, HoldEntry>>,
    timeout: Duration,
}

impl HoldLedger {
    /// Create ledger with the auto-release timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            holds: DashMap::new(),
            timeout,
        }
    }

    /// Auto-release timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a new PENDING hold
    pub fn insert(
        &self,
        account_id: &AccountId,
        transaction_id: &TransactionId,
        amount: Decimal,
        direction: Direction,
    ) -> Result<PendingHold> {
        let mut account = self.holds.entry(account_id.clone()).or_default();
        if account.contains_key(transaction_id) {
            return Err(Error::DuplicateHold {
                account_id: account_id.to_string(),
                transaction_id: transaction_id.to_string(),
            });
        }

        let hold = PendingHold {
            account_id: account_id.clone(),
            transaction_id: transaction_id.clone(),
            amount,
            direction,
            created_at: Utc::now(),
            status: HoldStatus::Pending,
        };
        account.insert(
            transaction_id.clone(),
            HoldEntry {
                hold: hold.clone(),
                created: Instant::now(),
                timer: None,
                confirms_in_flight: 0,
                expiry_deferred: false,
            },
        );
        Ok(hold)
    }

    /// Attach the timeout task of a hold
    ///
    /// Returns `false` (and the caller should abort the task) when the hold
    /// is already gone.
    pub fn arm_timer(&self, account_id: &AccountId, transaction_id: &TransactionId, timer: AbortHandle) -> bool {
        self.holds
            .get_mut(account_id)
            .and_then(|mut account| account.get_mut(transaction_id).map(|e| e.timer = Some(timer)))
            .is_some()
    }

    /// Claim a hold for an upcoming confirm; `false` if it is not pending
    pub fn begin_confirm(&self, account_id: &AccountId, transaction_id: &TransactionId) -> bool {
        self.holds
            .get_mut(account_id)
            .and_then(|mut account| {
                account
                    .get_mut(transaction_id)
                    .map(|entry| entry.confirms_in_flight += 1)
            })
            .is_some()
    }

    /// Drop a confirm claim
    ///
    /// Returns `true` when the hold is still PENDING and its timeout fired
    /// while claimed, i.e. the caller must re-arm the release.
    pub fn end_confirm(&self, account_id: &AccountId, transaction_id: &TransactionId) -> bool {
        let Some(mut account) = self.holds.get_mut(account_id) else {
            return false;
        };
        let Some(entry) = account.get_mut(transaction_id) else {
            return false;
        };
        entry.confirms_in_flight = entry.confirms_in_flight.saturating_sub(1);
        entry.confirms_in_flight == 0 && std::mem::take(&mut entry.expiry_deferred)
    }

    /// Cancel a hold whose timeout fired, unless a confirm has claimed it
    pub fn expire(&self, account_id: &AccountId, transaction_id: &TransactionId) -> Expiry {
        let Some(mut account) = self.holds.get_mut(account_id) else {
            return Expiry::Gone;
        };
        match account.get_mut(transaction_id) {
            None => return Expiry::Gone,
            Some(entry) if entry.confirms_in_flight > 0 => {
                entry.expiry_deferred = true;
                return Expiry::Deferred;
            }
            Some(_) => {}
        }
        match Self::finish_in(&self.holds, account, account_id, transaction_id, HoldStatus::Cancelled) {
            Some(finished) => Expiry::Released(finished),
            None => Expiry::Gone,
        }
    }

    /// The hold if it is still PENDING
    pub fn pending(&self, account_id: &AccountId, transaction_id: &TransactionId) -> Option<PendingHold> {
        let account = self.holds.get(account_id)?;
        account
            .get(transaction_id)
            .filter(|entry| entry.hold.status == HoldStatus::Pending)
            .map(|entry| entry.hold.clone())
    }

    /// Transition PENDING -> `status` and remove the hold
    ///
    /// Returns `None` when the hold is absent or already terminal, so a
    /// second caller racing the first observes a no-op.
    pub fn finish(
        &self,
        account_id: &AccountId,
        transaction_id: &TransactionId,
        status: HoldStatus,
    ) -> Option<FinishedHold> {
        let account = self.holds.get_mut(account_id)?;
        Self::finish_in(&self.holds, account, account_id, transaction_id, status)
    }

    fn finish_in(
        holds: &DashMap<AccountId, HashMap<TransactionId, HoldEntry>>,
        mut account: AccountHolds<'_>,
        account_id: &AccountId,
        transaction_id: &TransactionId,
        status: HoldStatus,
    ) -> Option<FinishedHold> {
        let is_pending = account
            .get(transaction_id)
            .map(|entry| entry.hold.status == HoldStatus::Pending)
            .unwrap_or(false);
        if !is_pending || !status.is_terminal() {
            return None;
        }

        let mut entry = account.remove(transaction_id)?;
        let now_empty = account.is_empty();
        drop(account);
        if now_empty {
            holds.remove_if(account_id, |_, remaining| remaining.is_empty());
        }

        entry.hold.status = status;
        Some(FinishedHold {
            hold: entry.hold,
            timer: entry.timer.take(),
        })
    }

    /// Sums of the account's not-yet-expired PENDING holds
    pub fn pending_totals(&self, account_id: &AccountId) -> PendingTotals {
        let mut totals = PendingTotals::default();
        let Some(account) = self.holds.get(account_id) else {
            return totals;
        };

        for entry in account.values() {
            if entry.hold.status != HoldStatus::Pending || entry.created.elapsed() >= self.timeout {
                continue;
            }
            match entry.hold.direction {
                Direction::Debit => totals.debits += entry.hold.amount,
                Direction::Credit => totals.credits += entry.hold.amount,
            }
        }
        totals
    }

    /// PENDING holds of an account
    pub fn holds_for(&self, account_id: &AccountId) -> Vec<PendingHold> {
        self.holds
            .get(account_id)
            .map(|account| account.values().map(|e| e.hold.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of holds in the ledger
    pub fn len(&self) -> usize {
        self.holds.iter().map(|account| account.len()).sum()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.holds.is_empty()
    }

    /// Drop every hold, returning their timeout tasks
    pub fn clear(&self) -> Vec<AbortHandle> {
        let timers = self
            .holds
            .iter_mut()
            .flat_map(|mut account| {
                account
                    .values_mut()
                    .filter_map(|e| e.timer.take())
                    .collect::<Vec<_>>()
            })
            .collect();
        self.holds.clear();
        timers
    }
}
