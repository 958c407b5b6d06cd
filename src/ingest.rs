//! Ingestion orchestrator.
//!
//! Owns adapter lifecycles and the event fan-in. Three jobs:
//!
//! 1. Full sync: all venues concurrently, a failing venue never blocks the
//!    others; markets missing from enough successive syncs are closed and
//!    their matches marked stale.
//! 2. Targeted refresh: re-fetch order books for exactly the markets that a
//!    CONFIRMED match references.
//! 3. Fan-in: drain the adapters' latest-wins buffer, validate, write through
//!    to cache and store, and notify the push bus.
//!
//! Per `(venue, external_id)` updates apply in source-timestamp order; older
//! updates are dropped and counted. While a venue is OFFLINE no event with
//! its tag is published.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::{stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::config::AppConfig;
use crate::events::{EventBuffer, EventSink, MarketEvent, PushBus, PushEvent};
use crate::metrics::Metrics;
use crate::store::Store;
use crate::types::{MarketStatus, OrderBook, Quote, Venue};
use crate::venue::{HealthStatus, VenueAdapter, VenueError};

/// Concurrent orderbook fetches per refresh tick, across all venues (the
/// per-venue gate still applies underneath).
const REFRESH_CONCURRENCY: usize = 16;
/// Event buffer capacity; overflow drops oldest (counted).
const EVENT_BUFFER_CAPACITY: usize = 1_024;
/// Cache sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    adapters: Vec<Arc<dyn VenueAdapter>>,
    cache: Arc<TtlCache>,
    store: Store,
    bus: Arc<dyn PushBus>,
    metrics: Metrics,
    cfg: Arc<AppConfig>,
    buffer: Arc<EventBuffer>,
    /// Last applied source timestamp per market, for ordering.
    applied_ts: DashMap<(Venue, String), chrono::DateTime<Utc>>,
}

impl Orchestrator {
    pub fn new(
        adapters: Vec<Arc<dyn VenueAdapter>>,
        cache: Arc<TtlCache>,
        store: Store,
        bus: Arc<dyn PushBus>,
        metrics: Metrics,
        cfg: Arc<AppConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapters,
            cache,
            store,
            bus,
            metrics,
            cfg,
            buffer: EventBuffer::new(EVENT_BUFFER_CAPACITY),
            applied_ts: DashMap::new(),
        })
    }

    /// Sink handed to adapters' push transports.
    pub fn sink(&self) -> EventSink {
        EventSink::new(self.buffer.clone())
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn events_dropped(&self) -> u64 {
        self.buffer.dropped()
    }

    /// Spawn the long-lived loops. Each observes the shutdown flag between
    /// iterations.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Full sync loop (runs immediately, then every 5 minutes).
        {
            let orch = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_millis(orch.cfg.full_sync_interval_ms));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            orch.full_sync_once().await;
                            orch.start_push_for_confirmed().await;
                        }
                        _ = shutdown.changed() => break,
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }));
        }

        // Targeted refresh loop.
        {
            let orch = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_millis(orch.cfg.ingestion_interval_ms));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => { orch.refresh_confirmed_once().await; }
                        _ = shutdown.changed() => break,
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }));
        }

        // Event fan-in loop.
        {
            let orch = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = orch.buffer.recv() => { orch.handle_event(event).await; }
                        _ = shutdown.changed() => break,
                    }
                }
                // Stop push transports immediately on shutdown.
                for adapter in &orch.adapters {
                    adapter.stop_push().await;
                }
            }));
        }

        // Cache sweep loop.
        {
            let orch = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = interval.tick() => { orch.cache.sweep(); }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        handles
    }

    /// One full sync pass: every enabled venue in parallel, settled
    /// semantics. Failures are recorded and skipped.
    pub async fn full_sync_once(&self) {
        let started = Utc::now();
        let results = futures_util::future::join_all(
            self.adapters
                .iter()
                .map(|adapter| async move { (adapter.venue(), adapter.fetch_active_markets().await) }),
        )
        .await;

        for (venue, result) in results {
            match result {
                Ok(fetched) => {
                    let count = fetched.value.len();
                    let mut seen: HashSet<String> = HashSet::with_capacity(count);
                    for mut market in fetched.value {
                        market.fetch_latency_ms = fetched.latency_ms;
                        seen.insert(market.external_id.clone());
                        if let Err(e) = self.store.upsert_market(&market).await {
                            self.metrics.errors_count.inc();
                            warn!(venue = %venue, error = %e, "market upsert failed");
                            continue;
                        }
                        self.metrics.markets_ingested.inc();
                    }
                    self.retire_missing_markets(venue, &seen).await;
                    info!(venue = %venue, markets = count, latency_ms = fetched.latency_ms, "full sync venue done");
                }
                Err(e) => {
                    self.metrics.errors_count.inc();
                    warn!(venue = %venue, error = %e, "full sync venue failed");
                }
            }
        }

        if let Ok(active) = self.store.active_markets().await {
            self.metrics.active_markets.set(active.len() as i64);
        }
        self.metrics.mark_full_sync(started);
    }

    /// Markets that stopped appearing in active listings accumulate missed
    /// syncs; after the configured number they are closed and their matches
    /// go stale.
    async fn retire_missing_markets(&self, venue: Venue, seen: &HashSet<String>) {
        let known = match self.store.active_market_ids(venue).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(venue = %venue, error = %e, "failed to list active markets");
                return;
            }
        };

        for external_id in known {
            if seen.contains(&external_id) {
                continue;
            }
            match self.store.record_missed_sync(venue, &external_id).await {
                Ok(missed) if missed >= self.cfg.closed_after_missed_syncs => {
                    self.close_market(venue, &external_id).await;
                }
                Ok(missed) => {
                    debug!(venue = %venue, market = %external_id, missed, "market missing from sync");
                }
                Err(e) => warn!(venue = %venue, error = %e, "missed-sync bump failed"),
            }
        }
    }

    /// One targeted refresh pass over every market referenced by a CONFIRMED
    /// match.
    pub async fn refresh_confirmed_once(&self) {
        let matches = match self.store.confirmed_matches().await {
            Ok(matches) => matches,
            Err(e) => {
                warn!(error = %e, "failed to load confirmed matches");
                return;
            }
        };

        let mut targets: HashSet<(Venue, String)> = HashSet::new();
        for m in &matches {
            targets.insert((m.source_venue, m.source_id.clone()));
            targets.insert((m.target_venue, m.target_id.clone()));
        }
        if targets.is_empty() {
            return;
        }

        stream::iter(targets)
            .for_each_concurrent(REFRESH_CONCURRENCY, |(venue, external_id)| async move {
                let Some(adapter) = self.adapter_for(venue) else {
                    return;
                };
                match adapter.fetch_order_book(&external_id).await {
                    Ok(fetched) => {
                        if let Some(book) = fetched.value {
                            self.apply_orderbook(book).await;
                        }
                    }
                    Err(VenueError::Closed { external_id }) => {
                        self.close_market(venue, &external_id).await;
                    }
                    Err(VenueError::RateLimited { .. }) => {
                        // The gate has widened pacing; next tick retries.
                    }
                    Err(e) => {
                        self.metrics.errors_count.inc();
                        debug!(venue = %venue, market = %external_id, error = %e, "orderbook refresh failed");
                    }
                }
            })
            .await;
    }

    /// Start push transports subscribed to the confirmed-match markets.
    ///
    /// TODO: resubscribe when the confirmed set changes; today a changed set
    /// is only picked up by restarting the transport.
    pub async fn start_push_for_confirmed(&self) {
        let matches = match self.store.confirmed_matches().await {
            Ok(matches) => matches,
            Err(_) => return,
        };
        if matches.is_empty() {
            return;
        }

        for adapter in &self.adapters {
            let venue = adapter.venue();
            let ids: Vec<String> = matches
                .iter()
                .flat_map(|m| {
                    [
                        (m.source_venue, m.source_id.clone()),
                        (m.target_venue, m.target_id.clone()),
                    ]
                })
                .filter(|(v, _)| *v == venue)
                .map(|(_, id)| id)
                .collect();
            if ids.is_empty() {
                continue;
            }
            match adapter.start_push(ids, self.sink()).await {
                Ok(()) => {}
                Err(VenueError::Unsupported(_)) => {
                    // Polling via the targeted refresh loop covers it.
                }
                Err(e) => {
                    self.metrics.errors_count.inc();
                    warn!(venue = %venue, error = %e, "push transport start failed");
                }
            }
        }
    }

    /// Apply one event from the fan-in buffer.
    pub async fn handle_event(&self, event: MarketEvent) {
        match event {
            MarketEvent::OrderBook(book) => self.apply_orderbook(book).await,
            MarketEvent::Quote(quote) => self.apply_quote(quote).await,
            MarketEvent::MarketClosed { venue, external_id } => {
                self.close_market(venue, &external_id).await;
            }
        }
    }

    /// Validate, order, write through, notify.
    pub async fn apply_orderbook(&self, book: OrderBook) {
        // Emission invariant: no crossed top-of-book. The constructors
        // enforce it; a violation here means a bug upstream, so drop.
        if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
            if bid >= ask {
                self.metrics.integrity_drops.inc();
                warn!(venue = %book.venue, market = %book.external_id, "crossed book dropped");
                return;
            }
        }

        if !self.accept_timestamp(book.venue, &book.external_id, book.timestamp) {
            self.metrics.stale_updates_dropped.inc();
            return;
        }

        self.cache.put_orderbook(
            &book,
            Duration::from_secs(self.cfg.orderbook_cache_ttl_secs),
        );
        self.metrics.orderbooks_updated.inc();

        if let Err(e) = self
            .store
            .update_market_quote(
                book.venue,
                &book.external_id,
                book.best_bid(),
                book.best_ask(),
                book.midpoint(),
                book.spread(),
                book.timestamp,
                book.latency_ms,
            )
            .await
        {
            self.metrics.errors_count.inc();
            warn!(error = %e, "quote column update failed");
        }
        if let Err(e) = self
            .store
            .append_price_snapshot(
                book.venue,
                &book.external_id,
                book.best_bid(),
                book.best_ask(),
                book.midpoint(),
                book.timestamp,
                self.cfg.snapshot_trail_len,
            )
            .await
        {
            self.metrics.errors_count.inc();
            warn!(error = %e, "snapshot append failed");
        }

        if self.venue_online(book.venue) {
            self.bus.publish(PushEvent::Orderbook {
                venue: book.venue,
                market_id: book.external_id.clone(),
                timestamp: book.timestamp,
            });
        }
    }

    pub async fn apply_quote(&self, quote: Quote) {
        if !self.accept_timestamp(quote.venue, &quote.external_id, quote.timestamp) {
            self.metrics.stale_updates_dropped.inc();
            return;
        }

        self.cache.put_quote(
            &quote,
            Duration::from_secs(self.cfg.orderbook_cache_ttl_secs),
        );
        self.metrics.quotes_updated.inc();

        let midpoint = quote.midpoint();
        let spread = match (quote.best_bid, quote.best_ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        };
        if let Err(e) = self
            .store
            .update_market_quote(
                quote.venue,
                &quote.external_id,
                quote.best_bid,
                quote.best_ask,
                midpoint,
                spread,
                quote.timestamp,
                quote.latency_ms,
            )
            .await
        {
            self.metrics.errors_count.inc();
            warn!(error = %e, "quote column update failed");
        }

        if self.venue_online(quote.venue) {
            if let Some(price) = quote.last_price.or(midpoint) {
                self.bus.publish(PushEvent::Price {
                    venue: quote.venue,
                    market_id: quote.external_id.clone(),
                    price,
                    timestamp: quote.timestamp,
                });
            }
        }
    }

    async fn close_market(&self, venue: Venue, external_id: &str) {
        info!(venue = %venue, market = %external_id, "market closed");
        if let Err(e) = self
            .store
            .set_market_status(venue, external_id, MarketStatus::Closed)
            .await
        {
            warn!(error = %e, "close-market status update failed");
        }
        match self.store.mark_matches_stale(venue, external_id).await {
            Ok(affected) if affected > 0 => {
                info!(venue = %venue, market = %external_id, affected, "matches marked stale");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "stale-marking failed"),
        }
        self.cache
            .remove(&TtlCache::orderbook_key(venue, external_id));
        self.cache.remove(&TtlCache::quote_key(venue, external_id));
    }

    /// Accept only updates at or after the last applied source timestamp.
    fn accept_timestamp(
        &self,
        venue: Venue,
        external_id: &str,
        ts: chrono::DateTime<Utc>,
    ) -> bool {
        let key = (venue, external_id.to_string());
        let mut accepted = true;
        self.applied_ts
            .entry(key)
            .and_modify(|current| {
                if ts < *current {
                    accepted = false;
                } else {
                    *current = ts;
                }
            })
            .or_insert(ts);
        accepted
    }

    fn adapter_for(&self, venue: Venue) -> Option<&Arc<dyn VenueAdapter>> {
        self.adapters.iter().find(|a| a.venue() == venue)
    }

    fn venue_online(&self, venue: Venue) -> bool {
        match self.adapter_for(venue) {
            Some(adapter) => adapter.health().status != HealthStatus::Offline,
            // No adapter (disabled venue): nothing should be published.
            None => false,
        }
    }
}
