//! Counters and gauges for the data plane.
//!
//! Lock-free atomics, cloned freely across workers. The ingestion block is
//! surfaced verbatim by the status endpoint; the full set is exportable in
//! Prometheus text format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

/// Monotonic counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Point-in-time gauge.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    value: AtomicI64,
}

impl Gauge {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicI64::new(0),
        }
    }

    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Registry shared by the orchestrator, matcher and detector.
#[derive(Debug, Clone)]
pub struct Metrics {
    /// Markets upserted from full syncs.
    pub markets_ingested: Arc<Counter>,
    /// Order books written through to the cache.
    pub orderbooks_updated: Arc<Counter>,
    /// Quotes written through to the cache.
    pub quotes_updated: Arc<Counter>,
    /// Ingestion errors recorded and moved past.
    pub errors_count: Arc<Counter>,
    /// Events discarded by the latest-wins buffer on overflow.
    pub events_dropped: Arc<Counter>,
    /// Rows dropped for violating book invariants on ingress.
    pub integrity_drops: Arc<Counter>,
    /// Updates discarded for arriving out of timestamp order.
    pub stale_updates_dropped: Arc<Counter>,

    /// Match proposals written by the matcher.
    pub matches_proposed: Arc<Counter>,
    /// Pairs skipped by the end-date prefilter.
    pub pairs_prefiltered: Arc<Counter>,

    /// Detector scans completed.
    pub scans_completed: Arc<Counter>,
    /// Opportunities detected and persisted.
    pub opportunities_detected: Arc<Counter>,
    /// Matches skipped because a cached book was missing or stale.
    pub stale_books_skipped: Arc<Counter>,

    /// Markets currently tracked as ACTIVE.
    pub active_markets: Arc<Gauge>,

    last_full_sync_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            markets_ingested: Arc::new(Counter::new("markets_ingested")),
            orderbooks_updated: Arc::new(Counter::new("orderbooks_updated")),
            quotes_updated: Arc::new(Counter::new("quotes_updated")),
            errors_count: Arc::new(Counter::new("errors_count")),
            events_dropped: Arc::new(Counter::new("events_dropped")),
            integrity_drops: Arc::new(Counter::new("integrity_drops")),
            stale_updates_dropped: Arc::new(Counter::new("stale_updates_dropped")),
            matches_proposed: Arc::new(Counter::new("matches_proposed")),
            pairs_prefiltered: Arc::new(Counter::new("pairs_prefiltered")),
            scans_completed: Arc::new(Counter::new("scans_completed")),
            opportunities_detected: Arc::new(Counter::new("opportunities_detected")),
            stale_books_skipped: Arc::new(Counter::new("stale_books_skipped")),
            active_markets: Arc::new(Gauge::new("active_markets")),
            last_full_sync_at: Arc::new(Mutex::new(None)),
        }
    }

    pub fn mark_full_sync(&self, at: DateTime<Utc>) {
        *self.last_full_sync_at.lock().unwrap() = Some(at);
    }

    pub fn last_full_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.last_full_sync_at.lock().unwrap()
    }

    /// Prometheus text exposition of every counter and gauge.
    pub fn export_prometheus(&self) -> String {
        let counters: [&Counter; 12] = [
            &self.markets_ingested,
            &self.orderbooks_updated,
            &self.quotes_updated,
            &self.errors_count,
            &self.events_dropped,
            &self.integrity_drops,
            &self.stale_updates_dropped,
            &self.matches_proposed,
            &self.pairs_prefiltered,
            &self.scans_completed,
            &self.opportunities_detected,
            &self.stale_books_skipped,
        ];

        let mut output = String::new();
        for counter in counters {
            output.push_str(&format!(
                "# TYPE {name} counter\n{name} {value}\n",
                name = counter.name,
                value = counter.get()
            ));
        }
        output.push_str(&format!(
            "# TYPE {name} gauge\n{name} {value}\n",
            name = self.active_markets.name,
            value = self.active_markets.get()
        ));
        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.orderbooks_updated.inc();
        metrics.orderbooks_updated.add(4);
        assert_eq!(metrics.orderbooks_updated.get(), 5);

        metrics.active_markets.set(37);
        assert_eq!(metrics.active_markets.get(), 37);
    }

    #[test]
    fn prometheus_export_contains_all_series() {
        let metrics = Metrics::new();
        metrics.markets_ingested.add(12);
        let text = metrics.export_prometheus();
        assert!(text.contains("markets_ingested 12"));
        assert!(text.contains("# TYPE opportunities_detected counter"));
        assert!(text.contains("# TYPE active_markets gauge"));
    }

    #[test]
    fn full_sync_timestamp_round_trips() {
        let metrics = Metrics::new();
        assert!(metrics.last_full_sync_at().is_none());
        let now = Utc::now();
        metrics.mark_full_sync(now);
        assert_eq!(metrics.last_full_sync_at(), Some(now));
    }
}
