//! Typed event plumbing between adapters, the orchestrator and the push bus.
//!
//! Adapters never talk to a global bus; they write typed `MarketEvent`s into
//! a bounded, latest-wins buffer owned by the orchestrator. Downstream
//! notifications to the external API collaborator go out as `PushEvent`s on
//! a broadcast channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};

use crate::types::{OrderBook, Quote, Venue};

/// Everything an adapter can report about one market.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    OrderBook(OrderBook),
    Quote(Quote),
    /// Venue reports the market no longer exists.
    MarketClosed { venue: Venue, external_id: String },
}

impl MarketEvent {
    /// Per-market key used for latest-wins replacement in the buffer.
    pub fn key(&self) -> (Venue, &str) {
        match self {
            MarketEvent::OrderBook(book) => (book.venue, book.external_id.as_str()),
            MarketEvent::Quote(quote) => (quote.venue, quote.external_id.as_str()),
            MarketEvent::MarketClosed { venue, external_id } => (*venue, external_id.as_str()),
        }
    }

    fn same_kind(&self, other: &MarketEvent) -> bool {
        matches!(
            (self, other),
            (MarketEvent::OrderBook(_), MarketEvent::OrderBook(_))
                | (MarketEvent::Quote(_), MarketEvent::Quote(_))
                | (MarketEvent::MarketClosed { .. }, MarketEvent::MarketClosed { .. })
        )
    }
}

/// Bounded fan-in buffer with latest-wins semantics.
///
/// A newer event for the same `(venue, external_id)` and kind replaces the
/// queued one in place. On overflow the oldest entry is dropped and counted;
/// producers never block.
pub struct EventBuffer {
    queue: Mutex<VecDeque<MarketEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn push(&self, event: MarketEvent) {
        {
            let mut queue = self.queue.lock().unwrap();
            let key = event.key();
            let key = (key.0, key.1.to_string());
            if let Some(slot) = queue
                .iter_mut()
                .find(|e| e.same_kind(&event) && e.key() == (key.0, key.1.as_str()))
            {
                *slot = event;
            } else {
                if queue.len() >= self.capacity {
                    queue.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_back(event);
            }
        }
        self.notify.notify_one();
    }

    pub fn try_recv(&self) -> Option<MarketEvent> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Wait for the next event; never returns a spurious value.
    pub async fn recv(&self) -> MarketEvent {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Cloneable producer handle handed to adapters and push workers.
#[derive(Clone)]
pub struct EventSink {
    buffer: Arc<EventBuffer>,
}

impl EventSink {
    pub fn new(buffer: Arc<EventBuffer>) -> Self {
        Self { buffer }
    }

    pub fn send(&self, event: MarketEvent) {
        self.buffer.push(event);
    }
}

/// Notifications for the external API collaborator's event bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum PushEvent {
    #[serde(rename = "newOpportunity", rename_all = "camelCase")]
    NewOpportunity {
        id: String,
        match_id: String,
        roi: Decimal,
        net_profit: Decimal,
        confidence: f64,
        source_market: String,
        target_market: String,
    },
    #[serde(rename = "price", rename_all = "camelCase")]
    Price {
        venue: Venue,
        market_id: String,
        price: Decimal,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "orderbook", rename_all = "camelCase")]
    Orderbook {
        venue: Venue,
        market_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// Outbound notification bus. The API collaborator subscribes; the core only
/// publishes and never blocks on slow consumers.
pub trait PushBus: Send + Sync {
    fn publish(&self, event: PushEvent);
}

/// Broadcast-channel bus; slow subscribers lag and lose messages rather than
/// applying backpressure to the hot path.
pub struct BroadcastBus {
    tx: broadcast::Sender<PushEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.tx.subscribe()
    }
}

impl PushBus for BroadcastBus {
    fn publish(&self, event: PushEvent) {
        // Send fails only when there are no subscribers; that is fine.
        let _ = self.tx.send(event);
    }
}
