//! Short-TTL keyed cache.
//!
//! The single authoritative source of "latest order book" for the detector.
//! Values are serialized JSON under string keys (`orderbook:<VENUE>:<id>`,
//! `quote:<VENUE>:<id>`, plus a generic response-cache surface). Reads are
//! single-operation and non-blocking; writes are last-writer-wins. Expired
//! entries read as absent and are lazily evicted, with a periodic sweep for
//! keys nobody reads again.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tracing::trace;

use crate::types::{OrderBook, Quote, Venue};

/// Default TTL for order books and quotes.
pub const BOOK_TTL: Duration = Duration::from_secs(10);

struct Entry {
    expires_at: Instant,
    payload: String,
}

/// Concurrent TTL store. Cheap to clone behind an `Arc`; single-key reads and
/// writes are safe from any worker.
pub struct TtlCache {
    entries: DashMap<String, Entry>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn orderbook_key(venue: Venue, external_id: &str) -> String {
        format!("orderbook:{}:{}", venue.as_str(), external_id)
    }

    pub fn quote_key(venue: Venue, external_id: &str) -> String {
        format!("quote:{}:{}", venue.as_str(), external_id)
    }

    /// Serialize and store `value` under `key` for `ttl`.
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(payload) => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        expires_at: Instant::now() + ttl,
                        payload,
                    },
                );
            }
            Err(e) => {
                // Serialization of our own types only fails on a bug; log and
                // keep the previous entry rather than poisoning the key.
                tracing::warn!(key, error = %e, "cache serialize failed");
            }
        }
    }

    /// Read and deserialize `key`; expired or absent entries return `None`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if entry.expires_at > now {
                match serde_json::from_str(&entry.payload) {
                    Ok(value) => return Some(value),
                    Err(e) => {
                        tracing::warn!(key, error = %e, "cache deserialize failed");
                        return None;
                    }
                }
            }
        }
        // Expired; evict lazily.
        trace!(key, "cache entry expired");
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    pub fn put_orderbook(&self, book: &OrderBook, ttl: Duration) {
        self.put_json(&Self::orderbook_key(book.venue, &book.external_id), book, ttl);
    }

    pub fn get_orderbook(&self, venue: Venue, external_id: &str) -> Option<OrderBook> {
        self.get_json(&Self::orderbook_key(venue, external_id))
    }

    pub fn put_quote(&self, quote: &Quote, ttl: Duration) {
        self.put_json(&Self::quote_key(quote.venue, &quote.external_id), quote, ttl);
    }

    pub fn get_quote(&self, venue: Venue, external_id: &str) -> Option<Quote> {
        self.get_json(&Self::quote_key(venue, external_id))
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Run periodically so keys that are never read
    /// again do not accumulate.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    use crate::types::PriceLevel;

    fn sample_book() -> OrderBook {
        let (book, _) = OrderBook::from_raw(
            Venue::Kalshi,
            "MKT-1",
            vec![PriceLevel::new(dec!(0.40), dec!(100))],
            vec![PriceLevel::new(dec!(0.45), dec!(100))],
            Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap(),
            8,
        );
        book
    }

    #[test]
    fn round_trip_orderbook() {
        let cache = TtlCache::new();
        let book = sample_book();
        cache.put_orderbook(&book, BOOK_TTL);

        let read = cache.get_orderbook(Venue::Kalshi, "MKT-1").unwrap();
        assert_eq!(read.best_bid(), Some(dec!(0.40)));
        assert_eq!(read.best_ask(), Some(dec!(0.45)));
        assert_eq!(read.timestamp, book.timestamp);
    }

    #[test]
    fn expired_entry_reads_as_absent() {
        let cache = TtlCache::new();
        let book = sample_book();
        cache.put_orderbook(&book, Duration::from_millis(0));
        assert!(cache.get_orderbook(Venue::Kalshi, "MKT-1").is_none());
        // Lazy eviction removed it.
        assert!(cache.is_empty());
    }

    #[test]
    fn last_writer_wins() {
        let cache = TtlCache::new();
        cache.put_json("k", &1u32, BOOK_TTL);
        cache.put_json("k", &2u32, BOOK_TTL);
        assert_eq!(cache.get_json::<u32>("k"), Some(2));
    }

    #[test]
    fn sweep_evicts_only_expired() {
        let cache = TtlCache::new();
        cache.put_json("gone", &1u32, Duration::from_millis(0));
        cache.put_json("kept", &2u32, Duration::from_secs(60));
        let evicted = cache.sweep();
        assert_eq!(evicted, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_json::<u32>("kept"), Some(2));
    }

    #[test]
    fn key_schema() {
        assert_eq!(
            TtlCache::orderbook_key(Venue::Polymarket, "0xabc"),
            "orderbook:POLYMARKET:0xabc"
        );
        assert_eq!(
            TtlCache::quote_key(Venue::Kalshi, "MKT-1"),
            "quote:KALSHI:MKT-1"
        );
    }
}
