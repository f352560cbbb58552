//! Balance Core
//!
//! Real-time benefits balance engine with pending hold reconciliation.
//!
//! # Architecture
//!
//! - **Durable store**: Account rows, posted transactions and snapshots (RocksDB)
//! - **Balance cache**: Short-lived computed balances (Redis or in-process)
//! - **Hold ledger**: In-memory pending holds with per-hold timeout timers
//! - **Flusher**: Single-writer actor persisting balance deltas in batches
//! - **Broadcaster**: Per-account listener fan-out with bounded buffers
//!
//! # Invariants
//!
//! - Available balance: current − Σ(pending debits), never persisted
//! - A hold leaves PENDING exactly once (confirm, release or timeout)
//! - Current balance changes only when a hold is confirmed
//! - Listener back-pressure never blocks a hold operation

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod types;
pub mod storage;
pub mod cache;
pub mod holds;
pub mod flusher;
pub mod events;
pub mod broadcaster;
pub mod snapshot;
pub mod engine;
pub mod error;
pub mod config;
pub mod metrics;

// Re-exports
pub use broadcaster::Subscription;
pub use cache::{BalanceCache, MemoryCache, RedisCache};
pub use config::Config;
pub use engine::BalanceEngine;
pub use error::{Error, Result};
pub use events::BalanceEvent;
pub use metrics::Metrics;
pub use storage::{DurableStore, MemoryStore, RocksStore};
pub use types::{
    AccountId, AccountRecord, AccountStatus, AggregateView, BalanceSnapshot, BalanceView,
    DailyBalance, Direction, HoldOutcome, HoldStatus, HolderId, ListenerId, PendingHold,
    TransactionId,
};
pub use velocity_engine::{ProgramType, VelocityLimits, Warning, WarningKind};
