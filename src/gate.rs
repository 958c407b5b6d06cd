//! Per-venue concurrency gate.
//!
//! Two limits compose: a hard cap on concurrent in-flight requests and a
//! steady pacing quota. On a rate-limit signal the gate additionally widens
//! an extra inter-request gap exponentially for a cool-off window, then
//! resets once the window passes.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use governor::{
    clock::DefaultClock, middleware::NoOpMiddleware, state::InMemoryState, state::NotKeyed, Quota,
    RateLimiter,
};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::types::Venue;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Extra gap applied after the first rate-limit signal (ms).
const COOLOFF_BASE_GAP_MS: u64 = 200;
/// Cap on the widened gap (ms).
const COOLOFF_MAX_GAP_MS: u64 = 10_000;
/// How long a rate-limit signal keeps the widened pacing in force.
const COOLOFF_WINDOW: Duration = Duration::from_secs(30);

/// Concurrency gate for one venue.
pub struct VenueGate {
    venue: Venue,
    semaphore: Semaphore,
    limiter: DirectLimiter,
    extra_gap_ms: AtomicU64,
    cooloff_until: Mutex<Option<Instant>>,
}

/// RAII permit; holding it counts against the venue's in-flight cap.
pub struct GatePermit<'a> {
    _permit: SemaphorePermit<'a>,
}

impl VenueGate {
    /// `max_in_flight` concurrent requests, `per_min` paced evenly across the
    /// minute (burst of 1, i.e. a minimum inter-request gap of `60s/per_min`).
    pub fn new(venue: Venue, max_in_flight: usize, per_min: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(per_min.max(1)).unwrap())
            .allow_burst(NonZeroU32::new(1).unwrap());
        Self {
            venue,
            semaphore: Semaphore::new(max_in_flight.max(1)),
            limiter: RateLimiter::direct(quota),
            extra_gap_ms: AtomicU64::new(0),
            cooloff_until: Mutex::new(None),
        }
    }

    /// Default in-flight caps: generous quotas get 10, the rest 5.
    pub fn default_for(venue: Venue, per_min: u32) -> Self {
        let max_in_flight = match venue {
            Venue::Polymarket => 10,
            Venue::Kalshi => 5,
        };
        Self::new(venue, max_in_flight, per_min)
    }

    /// Wait for pacing and an in-flight slot.
    pub async fn acquire(&self) -> GatePermit<'_> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("gate semaphore never closes");

        self.limiter.until_ready().await;

        let extra = self.current_extra_gap();
        if extra > 0 {
            tokio::time::sleep(Duration::from_millis(extra)).await;
        }

        GatePermit { _permit: permit }
    }

    /// Record a rate-limit signal: double the extra gap (capped) and restart
    /// the cool-off window.
    pub fn report_rate_limited(&self) {
        let current = self.extra_gap_ms.load(Ordering::Relaxed);
        let widened = if current == 0 {
            COOLOFF_BASE_GAP_MS
        } else {
            (current * 2).min(COOLOFF_MAX_GAP_MS)
        };
        self.extra_gap_ms.store(widened, Ordering::Relaxed);
        *self.cooloff_until.lock().unwrap() = Some(Instant::now() + COOLOFF_WINDOW);
        warn!(
            venue = %self.venue,
            gap_ms = widened,
            "rate limited; widening request pacing"
        );
    }

    fn current_extra_gap(&self) -> u64 {
        let mut cooloff = self.cooloff_until.lock().unwrap();
        match *cooloff {
            Some(until) if Instant::now() < until => self.extra_gap_ms.load(Ordering::Relaxed),
            Some(_) => {
                // Window elapsed without a new signal; pacing returns to normal.
                *cooloff = None;
                self.extra_gap_ms.store(0, Ordering::Relaxed);
                debug!(venue = %self.venue, "rate-limit cool-off expired");
                0
            }
            None => 0,
        }
    }

    /// Current widened gap, for introspection/tests.
    pub fn extra_gap_ms(&self) -> u64 {
        self.extra_gap_ms.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_flight_cap_is_enforced() {
        let gate = VenueGate::new(Venue::Kalshi, 2, 6_000);
        let p1 = gate.acquire().await;
        let _p2 = gate.acquire().await;

        // Third acquire must wait until a permit is released.
        let third = tokio::time::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(third.is_err());

        drop(p1);
        let third = tokio::time::timeout(Duration::from_millis(200), gate.acquire()).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn rate_limit_widens_then_resets() {
        let gate = VenueGate::new(Venue::Polymarket, 4, 6_000);
        assert_eq!(gate.extra_gap_ms(), 0);

        gate.report_rate_limited();
        assert_eq!(gate.extra_gap_ms(), 200);
        gate.report_rate_limited();
        assert_eq!(gate.extra_gap_ms(), 400);
        gate.report_rate_limited();
        assert_eq!(gate.extra_gap_ms(), 800);

        // Force the window into the past; next acquire resets the gap.
        *gate.cooloff_until.lock().unwrap() = Some(Instant::now() - Duration::from_secs(1));
        let _ = gate.acquire().await;
        assert_eq!(gate.extra_gap_ms(), 0);
    }

    #[test]
    fn widening_caps() {
        let gate = VenueGate::new(Venue::Kalshi, 1, 60);
        for _ in 0..20 {
            gate.report_rate_limited();
        }
        assert_eq!(gate.extra_gap_ms(), COOLOFF_MAX_GAP_MS);
    }
}
