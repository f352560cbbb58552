//! Subscription broadcaster
//!
//! Each listener owns a bounded outbound channel. Publishing uses
//! `try_send`: a full buffer drops the new update, a closed receiver
//! unregisters the listener. Nothing here ever waits on a listener.

use crate::metrics::Metrics;
use crate::types::{AccountId, BalanceView, ListenerId};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};

struct Listener {
    token: u64,
    sender: mpsc::Sender<BalanceView>,
}

/// Registry of live listeners per account
pub struct Broadcaster {
    listeners: DashMap<AccountId, HashMap<ListenerId, Listener>>,
    buffer: usize,
    next_token: AtomicU64,
    metrics: Metrics,
}

impl Broadcaster {
    /// Create broadcaster with a per-listener buffer size
    pub fn new(buffer: usize, metrics: Metrics) -> Arc<Self> {
        Arc::new(Self {
            listeners: DashMap::new(),
            buffer: buffer.max(1),
            next_token: AtomicU64::new(1),
            metrics,
        })
    }

    /// Register a listener, replacing one with the same id
    ///
    /// `initial` is queued to the new listener before it becomes visible to
    /// publishers.
    pub fn register(
        self: &Arc<Self>,
        account_id: AccountId,
        listener_id: ListenerId,
        initial: Option<BalanceView>,
    ) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        if let Some(view) = initial {
            let _ = sender.try_send(view);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entry(account_id.clone())
            .or_default()
            .insert(listener_id.clone(), Listener { token, sender });

        tracing::debug!(account_id = %account_id, listener_id = %listener_id, "Listener registered");

        Subscription {
            account_id,
            listener_id,
            token,
            receiver,
            broadcaster: Arc::downgrade(self),
            active: true,
        }
    }

    fn unregister(&self, account_id: &AccountId, listener_id: &ListenerId, token: u64) {
        let Some(mut account) = self.listeners.get_mut(account_id) else {
            return;
        };
        if account.get(listener_id).map(|l| l.token) == Some(token) {
            account.remove(listener_id);
            tracing::debug!(account_id = %account_id, listener_id = %listener_id, "Listener removed");
        }
        let now_empty = account.is_empty();
        drop(account);
        if now_empty {
            self.listeners.remove_if(account_id, |_, set| set.is_empty());
        }
    }

    /// Push a view to every listener of its account; returns deliveries
    pub fn publish(&self, view: &BalanceView) -> usize {
        let account_id = &view.snapshot.account_id;
        let Some(mut account) = self.listeners.get_mut(account_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (listener_id, listener) in account.iter() {
            match listener.sender.try_send(view.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.metrics.notifications_dropped.inc();
                    tracing::warn!(
                        account_id = %account_id,
                        listener_id = %listener_id,
                        "Listener buffer full, dropping balance update"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(listener_id.clone()),
            }
        }
        for listener_id in &closed {
            account.remove(listener_id);
        }

        let now_empty = account.is_empty();
        drop(account);
        if now_empty {
            self.listeners.remove_if(account_id, |_, set| set.is_empty());
        }
        delivered
    }

    /// Listeners registered for an account
    pub fn listener_count(&self, account_id: &AccountId) -> usize {
        self.listeners.get(account_id).map(|a| a.len()).unwrap_or(0)
    }

    /// Accounts with at least one listener
    pub fn account_count(&self) -> usize {
        self.listeners.len()
    }

    /// Drop every listener; their receivers see end-of-stream
    pub fn clear(&self) {
        self.listeners.clear();
    }
}

/// Live subscription to an account's balance updates
///
/// Dropping it unsubscribes.
pub struct Subscription {
    account_id: AccountId,
    listener_id: ListenerId,
    token: u64,
    receiver: mpsc::Receiver<BalanceView>,
    broadcaster: Weak<Broadcaster>,
    active: bool,
}

impl Subscription {
    /// Next update; `None` once unsubscribed or the engine shut down
    pub async fn recv(&mut self) -> Option<BalanceView> {
        self.receiver.recv().await
    }

    /// Next update if one is already queued
    pub fn try_recv(&mut self) -> Option<BalanceView> {
        self.receiver.try_recv().ok()
    }

    /// Account
    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Listener
    pub fn listener_id(&self) -> &ListenerId {
        &self.listener_id
    }

    /// Stop receiving updates
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.unregister(&self.account_id, &self.listener_id, self.token);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
