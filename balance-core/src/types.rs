//! Core types for the balance engine
//!
//! All types are designed for:
//! - Deterministic serialization (bincode in RocksDB, JSON in the shared cache)
//! - Exact arithmetic (Decimal for money)

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;
use velocity_engine::{ActivitySnapshot, ProgramType, VelocityHeadroom, VelocityLimits, Warning};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create new identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get as string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }
    };
}

string_id!(
    /// Benefit account identifier
    AccountId
);
string_id!(
    /// Transaction identifier supplied by the authorizing subsystem
    TransactionId
);
string_id!(
    /// Benefit holder (the person owning one or more accounts)
    HolderId
);
string_id!(
    /// Live listener identifier (e.g. a push-socket id)
    ListenerId
);

/// Direction of money movement on an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// Money leaves the account
    Debit,
    /// Money enters the account
    Credit,
}

impl Direction {
    /// Apply the direction's sign to an amount
    pub fn signed(&self, amount: Decimal) -> Decimal {
        match self {
            Direction::Debit => -amount,
            Direction::Credit => amount,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Direction::Debit => b'D',
            Direction::Credit => b'C',
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Debit => write!(f, "DEBIT"),
            Direction::Credit => write!(f, "CREDIT"),
        }
    }
}

/// Lifecycle status of a hold or posted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HoldStatus {
    /// Reserved, not yet final
    Pending,
    /// Confirmed (terminal)
    Completed,
    /// Released by cancellation or timeout (terminal)
    Cancelled,
}

impl HoldStatus {
    /// Check if status is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HoldStatus::Pending)
    }
}

/// Why a hold was released
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseReason {
    /// Pending longer than the hold timeout
    Timeout,
    /// Explicit cancellation by the caller
    Cancelled(String),
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseReason::Timeout => write!(f, "TIMEOUT"),
            ReleaseReason::Cancelled(reason) => write!(f, "{}", reason),
        }
    }
}

/// Result of a confirm or release call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldOutcome {
    /// Hold completed; `amount` is what was posted
    Confirmed {
        /// Final posted amount
        amount: Decimal,
    },
    /// Hold released
    Cancelled,
    /// Nothing to do (unknown hold or already terminal)
    NoOp,
}

/// Account status in the durable store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountStatus {
    /// Open for spending, included in snapshots
    Active,
    /// Temporarily frozen
    Suspended,
    /// Closed
    Closed,
}

/// Durable balance row, one per benefit account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Account ID
    pub account_id: AccountId,

    /// Owning holder
    pub holder_id: HolderId,

    /// Benefit program
    pub program_type: ProgramType,

    /// Authoritative balance
    pub current_balance: Decimal,

    /// Account status
    pub status: AccountStatus,

    /// Date of the last disbursement
    pub last_disbursement_date: Option<DateTime<Utc>>,

    /// Amount of the last disbursement
    pub last_disbursement_amount: Option<Decimal>,

    /// Date of the next scheduled disbursement
    pub next_disbursement_date: Option<DateTime<Utc>>,

    /// Lifetime disbursed amount
    pub total_disbursed: Decimal,
}

impl AccountRecord {
    /// New active account with an opening balance
    pub fn new(
        account_id: impl Into<AccountId>,
        holder_id: impl Into<HolderId>,
        program_type: ProgramType,
        current_balance: Decimal,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            holder_id: holder_id.into(),
            program_type,
            current_balance,
            status: AccountStatus::Active,
            last_disbursement_date: None,
            last_disbursement_amount: None,
            next_disbursement_date: None,
            total_disbursed: Decimal::ZERO,
        }
    }

    /// Check if account is active
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<String> for HolderId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Posted transaction, newest-first in balance views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSummary {
    /// Transaction ID
    pub transaction_id: TransactionId,

    /// Direction
    pub direction: Direction,

    /// Posted amount
    pub amount: Decimal,

    /// Status
    pub status: HoldStatus,

    /// Posting timestamp
    pub posted_at: DateTime<Utc>,
}

/// Spend aggregates read from the durable store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityAggregates {
    /// Debits posted since start of day (UTC)
    pub daily_spent: Decimal,

    /// Debits posted since start of month (UTC)
    pub monthly_spent: Decimal,

    /// Transactions posted since start of day (UTC)
    pub daily_transaction_count: u32,
}

/// Totals of the not-yet-expired pending holds of one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingTotals {
    /// Sum of pending debit holds
    pub debits: Decimal,

    /// Sum of pending credit holds
    pub credits: Decimal,
}

/// Computed balance, the unit the cache stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Account ID
    pub account_id: AccountId,

    /// Owning holder
    pub holder_id: HolderId,

    /// Benefit program
    pub program_type: ProgramType,

    /// Authoritative durable balance
    pub current_balance: Decimal,

    /// Outstanding debit holds
    pub pending_debits: Decimal,

    /// Outstanding credit holds
    pub pending_credits: Decimal,

    /// `current_balance - pending_debits`
    pub available_balance: Decimal,

    /// Debits posted today
    pub daily_spent: Decimal,

    /// Debits posted this month
    pub monthly_spent: Decimal,

    /// Transactions posted today
    pub daily_transaction_count: u32,

    /// Date of the last disbursement
    pub last_disbursement_date: Option<DateTime<Utc>>,

    /// Amount of the last disbursement
    pub last_disbursement_amount: Option<Decimal>,

    /// Date of the next scheduled disbursement
    pub next_disbursement_date: Option<DateTime<Utc>>,

    /// Lifetime disbursed amount
    pub total_disbursed: Decimal,

    /// Most recent posted transactions
    pub recent_transactions: Vec<TransactionSummary>,

    /// When the snapshot was computed
    pub as_of: DateTime<Utc>,
}

impl BalanceSnapshot {
    /// Combine the durable row, its aggregates and the pending holds
    pub fn compose(
        account: &AccountRecord,
        activity: ActivityAggregates,
        pending: PendingTotals,
        recent_transactions: Vec<TransactionSummary>,
    ) -> Self {
        Self {
            account_id: account.account_id.clone(),
            holder_id: account.holder_id.clone(),
            program_type: account.program_type,
            current_balance: account.current_balance,
            pending_debits: pending.debits,
            pending_credits: pending.credits,
            available_balance: account.current_balance - pending.debits,
            daily_spent: activity.daily_spent,
            monthly_spent: activity.monthly_spent,
            daily_transaction_count: activity.daily_transaction_count,
            last_disbursement_date: account.last_disbursement_date,
            last_disbursement_amount: account.last_disbursement_amount,
            next_disbursement_date: account.next_disbursement_date,
            total_disbursed: account.total_disbursed,
            recent_transactions,
            as_of: Utc::now(),
        }
    }

    /// Optimistically account for a new hold
    pub fn apply_hold(&mut self, amount: Decimal, direction: Direction) {
        match direction {
            Direction::Debit => self.pending_debits += amount,
            Direction::Credit => self.pending_credits += amount,
        }
        self.available_balance = self.current_balance - self.pending_debits;
    }

    /// Undo `apply_hold`
    pub fn reverse_hold(&mut self, amount: Decimal, direction: Direction) {
        match direction {
            Direction::Debit => self.pending_debits = (self.pending_debits - amount).max(Decimal::ZERO),
            Direction::Credit => self.pending_credits = (self.pending_credits - amount).max(Decimal::ZERO),
        }
        self.available_balance = self.current_balance - self.pending_debits;
    }

    /// Figures the velocity evaluator works on
    pub fn activity(&self) -> ActivitySnapshot {
        ActivitySnapshot {
            current_balance: self.current_balance,
            available_balance: self.available_balance,
            pending_debits: self.pending_debits,
            daily_spent: self.daily_spent,
            monthly_spent: self.monthly_spent,
            daily_transaction_count: self.daily_transaction_count,
        }
    }
}

/// What `get_balance` returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceView {
    /// Balance figures
    #[serde(flatten)]
    pub snapshot: BalanceSnapshot,

    /// Effective velocity limits of the program
    pub limits: VelocityLimits,

    /// Active warnings
    pub warnings: Vec<Warning>,

    /// Remaining velocity headroom
    pub headroom: VelocityHeadroom,
}

/// Balance of one program inside an aggregate view
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramBalance {
    /// Durable balance
    pub balance: Decimal,

    /// Balance minus pending debits
    pub available: Decimal,

    /// Pending debits
    pub pending: Decimal,
}

/// Sum across all active accounts of a holder
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateView {
    /// Holder
    pub holder_id: Option<HolderId>,

    /// Sum of durable balances
    pub total_balance: Decimal,

    /// Sum of available balances
    pub total_available: Decimal,

    /// Sum of pending debits
    pub total_pending: Decimal,

    /// Per-program breakdown
    pub programs: BTreeMap<ProgramType, ProgramBalance>,
}

/// What a queued delta records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeltaKind {
    /// Hold created
    Reserve,
    /// Hold released (cancel or timeout)
    Release,
    /// Hold confirmed
    Settle,
}

impl DeltaKind {
    fn tag(&self) -> u8 {
        match self {
            DeltaKind::Reserve => b'R',
            DeltaKind::Release => b'X',
            DeltaKind::Settle => b'S',
        }
    }
}

/// Balance delta awaiting durable persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedDelta {
    /// Unique delta ID (UUIDv7 for time-ordering)
    pub delta_id: Uuid,

    /// Account
    pub account_id: AccountId,

    /// Transaction the delta belongs to
    pub transaction_id: TransactionId,

    /// Amount (always positive)
    pub amount: Decimal,

    /// Direction of the underlying hold
    pub direction: Direction,

    /// Lifecycle step
    pub kind: DeltaKind,

    /// Submission time
    pub timestamp: DateTime<Utc>,
}

impl QueuedDelta {
    /// New delta stamped now
    pub fn new(
        account_id: AccountId,
        transaction_id: TransactionId,
        amount: Decimal,
        direction: Direction,
        kind: DeltaKind,
    ) -> Self {
        Self {
            delta_id: Uuid::now_v7(),
            account_id,
            transaction_id,
            amount,
            direction,
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Key under which re-applying the delta is a no-op
    ///
    /// Layout: length-prefixed `account_id`, length-prefixed
    /// `transaction_id`, then the kind and direction tags.
    pub fn idempotency_key(&self) -> Vec<u8> {
        let mut key = Vec::new();
        push_key_component(&mut key, self.account_id.as_str());
        push_key_component(&mut key, self.transaction_id.as_str());
        key.push(self.kind.tag());
        key.push(self.direction.tag());
        key
    }
}

/// Append `part` to a storage key as a `u32` big-endian length plus bytes
///
/// Ids are free-form strings, so no separator byte can be reserved.
pub(crate) fn push_key_component(key: &mut Vec<u8>, part: &str) {
    key.extend_from_slice(&(part.len() as u32).to_be_bytes());
    key.extend_from_slice(part.as_bytes());
}

/// Durable effect of a hold confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    /// Account
    pub account_id: AccountId,

    /// Transaction
    pub transaction_id: TransactionId,

    /// Direction
    pub direction: Direction,

    /// Amount reserved by the hold
    pub reserved_amount: Decimal,

    /// Amount confirmed
    pub final_amount: Decimal,

    /// Confirmation timestamp
    pub settled_at: DateTime<Utc>,
}

impl Settlement {
    /// Signed change applied to `current_balance`
    ///
    /// The reserved amount plus the signed difference to the final amount.
    pub fn balance_change(&self) -> Decimal {
        let difference = self.final_amount - self.reserved_amount;
        self.direction.signed(self.reserved_amount) + self.direction.signed(difference)
    }

    /// Transaction record written alongside the balance change
    pub fn to_summary(&self) -> TransactionSummary {
        TransactionSummary {
            transaction_id: self.transaction_id.clone(),
            direction: self.direction,
            amount: self.final_amount,
            status: HoldStatus::Completed,
            posted_at: self.settled_at,
        }
    }
}

/// Point-in-time balance copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    /// Account
    pub account_id: AccountId,

    /// Durable balance at `taken_at`
    pub balance: Decimal,

    /// Snapshot timestamp
    pub taken_at: DateTime<Utc>,
}

/// Daily aggregate of snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBalance {
    /// Day (UTC)
    pub date: NaiveDate,

    /// Mean balance over the day's snapshots
    pub average_balance: Decimal,

    /// Lowest snapshot
    pub min_balance: Decimal,

    /// Highest snapshot
    pub max_balance: Decimal,

    /// Number of snapshots that day
    pub samples: u32,
}

impl DailyBalance {
    /// Group snapshots by UTC day, newest day first
    pub fn aggregate(rows: &[SnapshotRow]) -> Vec<DailyBalance> {
        let mut days: BTreeMap<NaiveDate, Vec<Decimal>> = BTreeMap::new();
        for row in rows {
            days.entry(row.taken_at.date_naive()).or_default().push(row.balance);
        }

        days.into_iter()
            .rev()
            .filter_map(|(date, balances)| {
                let min_balance = balances.iter().min().copied()?;
                let max_balance = balances.iter().max().copied()?;
                let total: Decimal = balances.iter().sum();
                let samples = balances.len() as u32;
                Some(DailyBalance {
                    date,
                    average_balance: total / Decimal::from(samples),
                    min_balance,
                    max_balance,
                    samples,
                })
            })
            .collect()
    }
}

/// Read-only view of a pending hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingHold {
    /// Account
    pub account_id: AccountId,

    /// Transaction
    pub transaction_id: TransactionId,

    /// Reserved amount
    pub amount: Decimal,

    /// Direction
    pub direction: Direction,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Status
    pub status: HoldStatus,
}
