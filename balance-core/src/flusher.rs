//! Batch persistence flusher
//!
//! Single-writer actor owning the queue of balance deltas:
//! - `enqueue` never blocks (unbounded mailbox)
//! - Drains in bounded batches, one atomic store write per batch
//! - Drains on every enqueue burst and on a fixed interval
//! - A failed batch goes back to the front of the queue (at-least-once)
//!
//! ```text
//! FlusherHandle (Clone) ── mpsc::unbounded ──► FlushActor (single task)
//!                                                 │ DeltaQueue
//!                                                 ▼
//!                                      DurableStore::apply_deltas()
//! ```

use crate::config::FlusherConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::storage::DurableStore;
use crate::types::QueuedDelta;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

/// FIFO of deltas awaiting persistence
pub struct DeltaQueue {
    queue: VecDeque<QueuedDelta>,
    max_batch_size: usize,
}

impl DeltaQueue {
    /// Create queue draining at most `max_batch_size` deltas per write
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Append a delta
    pub fn push(&mut self, delta: QueuedDelta) {
        self.queue.push_back(delta);
    }

    /// Number of queued deltas
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Write queued deltas batch by batch until empty or a batch fails
    ///
    /// Returns the number of deltas written. A failed batch is put back at
    /// the front in its original order and the error is returned.
    pub fn drain(&mut self, store: &dyn DurableStore, metrics: &Metrics) -> Result<usize> {
        let mut written = 0;
        while !self.queue.is_empty() {
            let take = self.queue.len().min(self.max_batch_size);
            let batch: Vec<QueuedDelta> = self.queue.drain(..take).collect();

            match store.apply_deltas(&batch) {
                Ok(()) => {
                    metrics.record_batch_flush(batch.len());
                    written += batch.len();
                    tracing::debug!(batch_size = batch.len(), remaining = self.queue.len(), "Flushed delta batch");
                }
                Err(e) => {
                    metrics.flush_failures.inc();
                    for delta in batch.into_iter().rev() {
                        self.queue.push_front(delta);
                    }
                    return Err(e);
                }
            }
        }
        Ok(written)
    }
}

/// Message sent to the flush actor
pub enum FlusherMessage {
    /// Queue a delta
    Enqueue(QueuedDelta),

    /// Drain immediately
    Flush {
        /// Deltas written, or the batch error
        response: oneshot::Sender<Result<usize>>,
    },

    /// Final drain, then stop
    Shutdown {
        /// Deltas written, or the batch error
        response: oneshot::Sender<Result<usize>>,
    },
}

/// Actor that owns the delta queue
pub struct FlushActor {
    store: Arc<dyn DurableStore>,
    mailbox: mpsc::UnboundedReceiver<FlusherMessage>,
    queue: DeltaQueue,
    flush_interval: Duration,
    metrics: Metrics,
}

impl FlushActor {
    /// Create new actor
    pub fn new(
        store: Arc<dyn DurableStore>,
        mailbox: mpsc::UnboundedReceiver<FlusherMessage>,
        config: &FlusherConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            mailbox,
            queue: DeltaQueue::new(config.max_batch_size),
            flush_interval: config.flush_interval(),
            metrics,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        let mut flush_timer = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(FlusherMessage::Enqueue(delta)) => {
                        self.queue.push(delta);
                        // Take the whole burst so it drains in full batches
                        let mut deferred = None;
                        while let Ok(next) = self.mailbox.try_recv() {
                            match next {
                                FlusherMessage::Enqueue(delta) => self.queue.push(delta),
                                other => {
                                    deferred = Some(other);
                                    break;
                                }
                            }
                        }
                        self.drain_logged("enqueue");

                        if let Some(msg) = deferred {
                            if !self.handle_control(msg) {
                                break;
                            }
                        }
                    }
                    Some(msg) => {
                        if !self.handle_control(msg) {
                            break;
                        }
                    }
                    // Every handle dropped
                    None => {
                        self.drain_logged("close");
                        break;
                    }
                },

                _ = flush_timer.tick() => {
                    if !self.queue.is_empty() {
                        self.drain_logged("interval");
                    }
                }
            }
        }

        if !self.queue.is_empty() {
            tracing::error!(lost = self.queue.len(), "Flusher stopped with undelivered deltas");
        }
    }

    /// Handle Flush / Shutdown; returns `false` when the actor must stop
    fn handle_control(&mut self, msg: FlusherMessage) -> bool {
        match msg {
            FlusherMessage::Enqueue(delta) => {
                self.queue.push(delta);
                self.drain_logged("enqueue");
                true
            }
            FlusherMessage::Flush { response } => {
                let _ = response.send(self.drain());
                true
            }
            FlusherMessage::Shutdown { response } => {
                let _ = response.send(self.drain());
                false
            }
        }
    }

    fn drain(&mut self) -> Result<usize> {
        let result = self.queue.drain(self.store.as_ref(), &self.metrics);
        self.metrics.deltas_queued.set(self.queue.len() as i64);
        result
    }

    fn drain_logged(&mut self, trigger: &'static str) {
        if let Err(e) = self.drain() {
            tracing::error!(trigger, queued = self.queue.len(), "Error flushing deltas: {}", e);
        }
    }
}

/// Handle for sending messages to the flush actor
#[derive(Clone)]
pub struct FlusherHandle {
    sender: mpsc::UnboundedSender<FlusherMessage>,
    metrics: Metrics,
}

impl FlusherHandle {
    /// Queue a delta; never blocks
    pub fn enqueue(&self, delta: QueuedDelta) -> Result<()> {
        self.sender
            .send(FlusherMessage::Enqueue(delta))
            .map_err(|_| Error::Concurrency("Flusher mailbox closed".to_string()))?;
        self.metrics.deltas_queued.inc();
        Ok(())
    }

    /// Drain everything queued so far
    pub async fn flush(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(FlusherMessage::Flush { response: tx })
            .map_err(|_| Error::Concurrency("Flusher mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Final drain and stop
    pub async fn shutdown(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(FlusherMessage::Shutdown { response: tx })
            .map_err(|_| Error::Concurrency("Flusher mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }
}

/// Spawn the flush actor
pub fn spawn_flusher(
    store: Arc<dyn DurableStore>,
    config: &FlusherConfig,
    metrics: Metrics,
) -> (FlusherHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = FlushActor::new(store, rx, config, metrics.clone());
    let join = tokio::spawn(actor.run());
    (FlusherHandle { sender: tx, metrics }, join)
}
