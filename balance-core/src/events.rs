//! Balance events emitted to the outside world
//!
//! The bus is a bounded `broadcast` channel: publishing never blocks and a
//! consumer that falls behind loses the oldest events.

use crate::types::{AccountId, BalanceView, Direction, TransactionId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Named engine event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BalanceEvent {
    /// Hold created
    PendingTransaction {
        /// Account
        account_id: AccountId,
        /// Transaction
        transaction_id: TransactionId,
        /// Reserved amount
        amount: Decimal,
        /// Direction
        direction: Direction,
    },

    /// Hold confirmed
    TransactionConfirmed {
        /// Account
        account_id: AccountId,
        /// Transaction
        transaction_id: TransactionId,
        /// Posted amount
        amount: Decimal,
    },

    /// Hold released
    TransactionCancelled {
        /// Account
        account_id: AccountId,
        /// Transaction
        transaction_id: TransactionId,
        /// Released amount
        amount: Decimal,
        /// `TIMEOUT` or the caller's reason
        reason: String,
    },

    /// Fresh balance pushed to subscribers
    BalanceUpdate {
        /// Account
        account_id: AccountId,
        /// Recomputed balance
        balance: Box<BalanceView>,
    },
}

impl BalanceEvent {
    /// Wire name
    pub fn name(&self) -> &'static str {
        match self {
            BalanceEvent::PendingTransaction { .. } => "pending_transaction",
            BalanceEvent::TransactionConfirmed { .. } => "transaction_confirmed",
            BalanceEvent::TransactionCancelled { .. } => "transaction_cancelled",
            BalanceEvent::BalanceUpdate { .. } => "balance_update",
        }
    }

    /// Account the event concerns
    pub fn account_id(&self) -> &AccountId {
        match self {
            BalanceEvent::PendingTransaction { account_id, .. }
            | BalanceEvent::TransactionConfirmed { account_id, .. }
            | BalanceEvent::TransactionCancelled { account_id, .. }
            | BalanceEvent::BalanceUpdate { account_id, .. } => account_id,
        }
    }
}

/// Fan-out of engine events to external sinks
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BalanceEvent>,
}

impl EventBus {
    /// Create bus holding up to `capacity` unread events per consumer
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish; returns the number of consumers reached
    pub fn publish(&self, event: BalanceEvent) -> usize {
        tracing::debug!(event = event.name(), account_id = %event.account_id(), "Publishing event");
        self.sender.send(event).unwrap_or(0)
    }

    /// Attach a consumer
    pub fn subscribe(&self) -> broadcast::Receiver<BalanceEvent> {
        self.sender.subscribe()
    }

    /// Number of attached consumers
    pub fn consumer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
