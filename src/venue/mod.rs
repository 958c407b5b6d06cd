//! Venue adapters: the uniform capability set every venue implements.
//!
//! An adapter normalizes one venue's markets, quotes and order books into
//! the common shape, tracks its own health, and (where the venue supports
//! it) runs a push transport that feeds the orchestrator's event sink.

pub mod kalshi;
pub mod polymarket;
pub mod push;

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::events::EventSink;
use crate::types::{Market, OrderBook, Quote, Venue};

/// Error kinds an adapter call can surface. The orchestrator branches on the
/// kind, so this is a typed enum rather than an opaque `anyhow::Error`.
#[derive(Debug)]
pub enum VenueError {
    /// Timeout, 5xx, transport reset. Retried with backoff.
    Transient(String),
    /// 429 or venue-specific signal; the gate widens pacing, the call is
    /// abandoned until the next tick.
    RateLimited { retry_after_secs: Option<u64> },
    /// Token invalid/expired after the adapter's single re-auth attempt.
    Auth(String),
    /// Unexpected payload shape; dropped, never retried.
    Schema(String),
    /// Venue reports the market no longer exists.
    Closed { external_id: String },
    /// The adapter does not implement this capability (e.g. push).
    Unsupported(&'static str),
}

impl std::fmt::Display for VenueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VenueError::Transient(msg) => write!(f, "transient: {}", msg),
            VenueError::RateLimited { retry_after_secs } => match retry_after_secs {
                Some(secs) => write!(f, "rate limited (retry after {}s)", secs),
                None => write!(f, "rate limited"),
            },
            VenueError::Auth(msg) => write!(f, "auth: {}", msg),
            VenueError::Schema(msg) => write!(f, "schema: {}", msg),
            VenueError::Closed { external_id } => write!(f, "market closed: {}", external_id),
            VenueError::Unsupported(what) => write!(f, "unsupported: {}", what),
        }
    }
}

impl std::error::Error for VenueError {}

impl VenueError {
    /// Classify a reqwest failure into the transient/auth/rate-limited kinds.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        VenueError::Transient(err.to_string())
    }

    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => VenueError::Auth(message),
            404 => VenueError::Schema(message),
            429 => VenueError::RateLimited {
                retry_after_secs: None,
            },
            _ if (500..=599).contains(&status) => VenueError::Transient(message),
            408 | 425 => VenueError::Transient(message),
            _ => VenueError::Schema(message),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Transient(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, VenueError::RateLimited { .. })
    }
}

/// Adapter status derived from consecutive error counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Offline,
}

/// Point-in-time health snapshot for one venue.
#[derive(Debug, Clone, Serialize)]
pub struct VenueHealth {
    pub venue: Venue,
    pub status: HealthStatus,
    pub avg_latency_ms: u64,
    pub consecutive_errors: u32,
    pub market_count: u64,
    pub last_fetch: Option<DateTime<Utc>>,
}

const LATENCY_WINDOW: usize = 100;
const DEGRADED_AFTER: u32 = 3;
const OFFLINE_AFTER: u32 = 10;

struct HealthInner {
    latencies: VecDeque<u64>,
    consecutive_errors: u32,
    market_count: u64,
    last_fetch: Option<DateTime<Utc>>,
}

/// Rolling health tracker shared by an adapter and its push worker.
///
/// Any success resets `consecutive_errors`; 3 consecutive errors degrade,
/// 10 take the venue offline.
pub struct HealthTracker {
    venue: Venue,
    inner: Mutex<HealthInner>,
}

impl HealthTracker {
    pub fn new(venue: Venue) -> Self {
        Self {
            venue,
            inner: Mutex::new(HealthInner {
                latencies: VecDeque::with_capacity(LATENCY_WINDOW),
                consecutive_errors: 0,
                market_count: 0,
                last_fetch: None,
            }),
        }
    }

    pub fn record_success(&self, latency_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.latencies.len() == LATENCY_WINDOW {
            inner.latencies.pop_front();
        }
        inner.latencies.push_back(latency_ms);
        inner.consecutive_errors = 0;
        inner.last_fetch = Some(Utc::now());
    }

    pub fn record_error(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_errors = inner.consecutive_errors.saturating_add(1);
    }

    pub fn set_market_count(&self, count: u64) {
        self.inner.lock().unwrap().market_count = count;
    }

    pub fn status(&self) -> HealthStatus {
        let errors = self.inner.lock().unwrap().consecutive_errors;
        status_for(errors)
    }

    pub fn snapshot(&self) -> VenueHealth {
        let inner = self.inner.lock().unwrap();
        let avg_latency_ms = if inner.latencies.is_empty() {
            0
        } else {
            inner.latencies.iter().sum::<u64>() / inner.latencies.len() as u64
        };
        VenueHealth {
            venue: self.venue,
            status: status_for(inner.consecutive_errors),
            avg_latency_ms,
            consecutive_errors: inner.consecutive_errors,
            market_count: inner.market_count,
            last_fetch: inner.last_fetch,
        }
    }
}

fn status_for(consecutive_errors: u32) -> HealthStatus {
    if consecutive_errors >= OFFLINE_AFTER {
        HealthStatus::Offline
    } else if consecutive_errors >= DEGRADED_AFTER {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// A fetched value plus the wall-clock latency of the call that produced it.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub value: T,
    pub latency_ms: u64,
}

/// Uniform capability set implemented per venue.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn venue(&self) -> Venue;

    /// Full list of currently tradeable markets, normalized.
    async fn fetch_active_markets(&self) -> Result<Fetched<Vec<Market>>, VenueError>;

    /// Top-N levels on both sides; `None` when the venue has no book for the
    /// id (distinct from `Closed`, which means the market is gone).
    async fn fetch_order_book(
        &self,
        external_id: &str,
    ) -> Result<Fetched<Option<OrderBook>>, VenueError>;

    /// Top-of-book only; cheaper than depth on most venues.
    async fn fetch_quote(&self, external_id: &str) -> Result<Fetched<Option<Quote>>, VenueError>;

    /// Open the venue's push transport and deliver events for the given ids
    /// into `sink` until `stop_push` or shutdown. Venues without a push
    /// transport return `Unsupported` and are polled instead.
    async fn start_push(
        &self,
        subscribed_ids: Vec<String>,
        sink: EventSink,
    ) -> Result<(), VenueError>;

    async fn stop_push(&self);

    fn health(&self) -> VenueHealth;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_transitions() {
        let tracker = HealthTracker::new(Venue::Kalshi);
        assert_eq!(tracker.status(), HealthStatus::Healthy);

        for _ in 0..3 {
            tracker.record_error();
        }
        assert_eq!(tracker.status(), HealthStatus::Degraded);

        for _ in 0..7 {
            tracker.record_error();
        }
        assert_eq!(tracker.status(), HealthStatus::Offline);

        tracker.record_success(42);
        assert_eq!(tracker.status(), HealthStatus::Healthy);
        assert_eq!(tracker.snapshot().consecutive_errors, 0);
    }

    #[test]
    fn latency_window_mean() {
        let tracker = HealthTracker::new(Venue::Polymarket);
        for latency in [10u64, 20, 30] {
            tracker.record_success(latency);
        }
        assert_eq!(tracker.snapshot().avg_latency_ms, 20);

        // Window caps at 100 entries.
        for _ in 0..200 {
            tracker.record_success(50);
        }
        assert_eq!(tracker.snapshot().avg_latency_ms, 50);
    }

    #[test]
    fn status_classification() {
        assert!(VenueError::from_status(503, "oops".into()).is_transient());
        assert!(VenueError::from_status(429, "slow down".into()).is_rate_limited());
        assert!(matches!(
            VenueError::from_status(401, "denied".into()),
            VenueError::Auth(_)
        ));
        assert!(matches!(
            VenueError::from_status(400, "bad".into()),
            VenueError::Schema(_)
        ));
    }
}
