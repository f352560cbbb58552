//! Metrics collection for observability
//!
//! Prometheus metrics for the balance engine. Every engine owns its own
//! registry, so several engines can live in one process.
//!
//! # Metrics
//!
//! - `balance_holds_created_total` - Holds created
//! - `balance_holds_confirmed_total` - Holds confirmed
//! - `balance_holds_cancelled_total` - Holds released (explicit or timeout)
//! - `balance_holds_active` - Holds currently pending
//! - `balance_cache_hits_total` / `balance_cache_misses_total` - Cache lookups
//! - `balance_flush_batch_size` - Histogram of flushed batch sizes
//! - `balance_flush_failures_total` - Failed batch writes
//! - `balance_deltas_queued` - Deltas awaiting persistence
//! - `balance_notifications_dropped_total` - Updates dropped on full listener buffers
//! - `balance_snapshots_written_total` - Snapshot rows written
//! - `balance_snapshot_failures_total` - Failed snapshot runs

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Holds created
    pub holds_created: IntCounter,

    /// Holds confirmed
    pub holds_confirmed: IntCounter,

    /// Holds released
    pub holds_cancelled: IntCounter,

    /// Holds currently pending
    pub holds_active: IntGauge,

    /// Cache hits
    pub cache_hits: IntCounter,

    /// Cache misses
    pub cache_misses: IntCounter,

    /// Batch size histogram
    pub flush_batch_size: Histogram,

    /// Failed batch writes
    pub flush_failures: IntCounter,

    /// Deltas awaiting persistence
    pub deltas_queued: IntGauge,

    /// Dropped listener updates
    pub notifications_dropped: IntCounter,

    /// Snapshot rows written
    pub snapshots_written: IntCounter,

    /// Failed snapshot runs
    pub snapshot_failures: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };
        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            let gauge = IntGauge::new(name, help)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        let flush_batch_size = Histogram::with_opts(
            HistogramOpts::new("balance_flush_batch_size", "Histogram of flushed batch sizes")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]),
        )?;
        registry.register(Box::new(flush_batch_size.clone()))?;

        Ok(Self {
            holds_created: counter("balance_holds_created_total", "Holds created")?,
            holds_confirmed: counter("balance_holds_confirmed_total", "Holds confirmed")?,
            holds_cancelled: counter("balance_holds_cancelled_total", "Holds released")?,
            holds_active: gauge("balance_holds_active", "Holds currently pending")?,
            cache_hits: counter("balance_cache_hits_total", "Balance cache hits")?,
            cache_misses: counter("balance_cache_misses_total", "Balance cache misses")?,
            flush_batch_size,
            flush_failures: counter("balance_flush_failures_total", "Failed delta batch writes")?,
            deltas_queued: gauge("balance_deltas_queued", "Deltas awaiting persistence")?,
            notifications_dropped: counter(
                "balance_notifications_dropped_total",
                "Updates dropped on full listener buffers",
            )?,
            snapshots_written: counter("balance_snapshots_written_total", "Snapshot rows written")?,
            snapshot_failures: counter("balance_snapshot_failures_total", "Failed snapshot runs")?,
            registry,
        })
    }

    /// Record batch flush
    pub fn record_batch_flush(&self, batch_size: usize) {
        self.flush_batch_size.observe(batch_size as f64);
    }

    /// Record cache lookup
    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.inc();
        } else {
            self.cache_misses.inc();
        }
    }

    /// Cache hit rate in percent
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.get();
        let total = hits + self.cache_misses.get();
        if total == 0 {
            0.0
        } else {
            (hits as f64) / (total as f64) * 100.0
        }
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every registered metric
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.holds_created.get(), 0);
        assert_eq!(metrics.deltas_queued.get(), 0);
    }

    #[test]
    fn test_instances_do_not_collide() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.holds_created.inc();
        assert_eq!(a.holds_created.get(), 1);
        assert_eq!(b.holds_created.get(), 0);
    }

    #[test]
    fn test_cache_hit_rate() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.cache_hit_rate(), 0.0);
        metrics.record_cache_lookup(true);
        metrics.record_cache_lookup(true);
        metrics.record_cache_lookup(true);
        metrics.record_cache_lookup(false);
        assert_eq!(metrics.cache_hit_rate(), 75.0);
    }

    #[test]
    fn test_registry_gathers_all_families() {
        let metrics = Metrics::new().unwrap();
        metrics.record_batch_flush(100);
        assert_eq!(metrics.registry().gather().len(), 12);
    }

    #[test]
    fn test_text_exposition() {
        let metrics = Metrics::new().unwrap();
        metrics.holds_created.inc_by(3);
        let text = metrics.encode().unwrap();
        assert!(text.contains("balance_holds_created_total 3"));
        assert!(text.contains("# TYPE balance_flush_batch_size histogram"));
    }
}
