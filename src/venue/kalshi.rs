//! Kalshi adapter.
//!
//! REST for market listings, order books and quotes; WebSocket push for
//! orderbook snapshots/deltas and ticker updates. Kalshi prices arrive in
//! cents (0-100) and are normalized to `[0, 1]`. Kalshi publishes an
//! explicit NO side: resting NO bids at price `p` are re-expressed as YES
//! asks at `1 - p`, so no blind complement reconstruction is needed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::{KALSHI_API_BASE, KALSHI_WS_URL};
use crate::events::{EventSink, MarketEvent};
use crate::gate::VenueGate;
use crate::retry::{retry_transient, RetryPolicy};
use crate::types::{Market, MarketStatus, OrderBook, PriceLevel, Quote, Venue};
use crate::venue::push::{run_push_worker, PushProtocol};
use crate::venue::{Fetched, HealthTracker, VenueAdapter, VenueError, VenueHealth};

const PAGE_LIMIT: u32 = 200;
const BOOK_DEPTH: u32 = 10;

struct PushTask {
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

pub struct KalshiAdapter {
    client: reqwest::Client,
    base_url: String,
    ws_url: String,
    gate: Arc<VenueGate>,
    health: Arc<HealthTracker>,
    retry: RetryPolicy,
    api_token: RwLock<Option<String>>,
    push_task: Mutex<Option<PushTask>>,
    schema_drops: Arc<AtomicU64>,
}

impl KalshiAdapter {
    pub fn new(gate: Arc<VenueGate>, http_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .user_agent("arb-scout/0.1")
            .build()?;
        Ok(Self {
            client,
            base_url: KALSHI_API_BASE.to_string(),
            ws_url: KALSHI_WS_URL.to_string(),
            gate,
            health: Arc::new(HealthTracker::new(Venue::Kalshi)),
            retry: RetryPolicy::from_env(),
            api_token: RwLock::new(std::env::var("KALSHI_API_TOKEN").ok()),
            push_task: Mutex::new(None),
            schema_drops: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn health_tracker(&self) -> Arc<HealthTracker> {
        self.health.clone()
    }

    /// One GET with gating, auth header, and a single re-auth on 401.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path_and_query: &str,
    ) -> Result<T, VenueError> {
        let mut reauthed = false;
        loop {
            let _permit = self.gate.acquire().await;
            let url = format!("{}{}", self.base_url, path_and_query);
            let mut request = self.client.get(&url);
            if let Some(token) = self.api_token.read().unwrap().as_deref() {
                request = request.bearer_auth(token);
            }

            let response = request.send().await.map_err(VenueError::from_reqwest)?;
            let status = response.status().as_u16();
            match status {
                200 => {
                    return response
                        .json::<T>()
                        .await
                        .map_err(|e| VenueError::Schema(e.to_string()));
                }
                401 | 403 if !reauthed => {
                    // Re-authenticate once, then retry the call.
                    reauthed = true;
                    let refreshed = std::env::var("KALSHI_API_TOKEN").ok();
                    warn!(venue = "KALSHI", "auth rejected; re-reading credentials");
                    *self.api_token.write().unwrap() = refreshed;
                    continue;
                }
                429 => {
                    self.gate.report_rate_limited();
                    let retry_after_secs = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok());
                    return Err(VenueError::RateLimited { retry_after_secs });
                }
                _ => {
                    return Err(VenueError::from_status(
                        status,
                        format!("HTTP {} GET {}", status, url),
                    ))
                }
            }
        }
    }

    /// Market-scoped GET: a 404 means the market is gone, not a bad payload.
    async fn get_json_for_market<T: serde::de::DeserializeOwned>(
        &self,
        path_and_query: &str,
        external_id: &str,
    ) -> Result<T, VenueError> {
        match self.get_json(path_and_query).await {
            Err(VenueError::Schema(msg)) if msg.starts_with("HTTP 404") => {
                Err(VenueError::Closed {
                    external_id: external_id.to_string(),
                })
            }
            other => other,
        }
    }
}

#[async_trait]
impl VenueAdapter for KalshiAdapter {
    fn venue(&self) -> Venue {
        Venue::Kalshi
    }

    async fn fetch_active_markets(&self) -> Result<Fetched<Vec<Market>>, VenueError> {
        let start = Instant::now();
        let mut markets = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let path = match &cursor {
                Some(c) => format!("/markets?status=open&limit={}&cursor={}", PAGE_LIMIT, c),
                None => format!("/markets?status=open&limit={}", PAGE_LIMIT),
            };
            let page: MarketsPage = retry_transient(&self.retry, "kalshi_markets", || {
                self.get_json(&path)
            })
            .await
            .inspect_err(|_| self.health.record_error())?;

            for dto in page.markets {
                match normalize_market(dto) {
                    Some(market) => markets.push(market),
                    None => {
                        self.schema_drops.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            match page.cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        self.health.record_success(latency_ms);
        self.health.set_market_count(markets.len() as u64);
        Ok(Fetched {
            value: markets,
            latency_ms,
        })
    }

    async fn fetch_order_book(
        &self,
        external_id: &str,
    ) -> Result<Fetched<Option<OrderBook>>, VenueError> {
        let start = Instant::now();
        let path = format!("/markets/{}/orderbook?depth={}", external_id, BOOK_DEPTH);
        let response: Result<OrderbookResponse, VenueError> =
            retry_transient(&self.retry, "kalshi_orderbook", || {
                self.get_json_for_market(&path, external_id)
            })
            .await;

        let latency_ms = start.elapsed().as_millis() as u64;
        match response {
            Ok(body) => {
                self.health.record_success(latency_ms);
                let book = body.orderbook.map(|raw| {
                    let (book, dropped) =
                        orderbook_from_sides(external_id, raw, Utc::now(), latency_ms);
                    if dropped > 0 {
                        self.schema_drops.fetch_add(dropped as u64, Ordering::Relaxed);
                        warn!(market = external_id, dropped, "dropped invalid kalshi book rows");
                    }
                    book
                });
                Ok(Fetched {
                    value: book,
                    latency_ms,
                })
            }
            Err(err @ VenueError::Closed { .. }) => {
                // Market gone is a venue answer, not a venue failure.
                self.health.record_success(latency_ms);
                Err(err)
            }
            Err(e) => {
                self.health.record_error();
                Err(e)
            }
        }
    }

    async fn fetch_quote(&self, external_id: &str) -> Result<Fetched<Option<Quote>>, VenueError> {
        let start = Instant::now();
        let path = format!("/markets/{}", external_id);
        let response: Result<SingleMarketResponse, VenueError> =
            retry_transient(&self.retry, "kalshi_quote", || {
                self.get_json_for_market(&path, external_id)
            })
            .await;

        let latency_ms = start.elapsed().as_millis() as u64;
        match response {
            Ok(body) => {
                self.health.record_success(latency_ms);
                let quote = body.market.map(|dto| Quote {
                    venue: Venue::Kalshi,
                    external_id: external_id.to_string(),
                    best_bid: dto.yes_bid.map(cents_to_price),
                    best_ask: dto.yes_ask.map(cents_to_price),
                    last_price: dto.last_price.map(cents_to_price),
                    volume_24h: dto.volume_24h.map(Decimal::from),
                    timestamp: Utc::now(),
                    latency_ms,
                });
                Ok(Fetched {
                    value: quote,
                    latency_ms,
                })
            }
            Err(err @ VenueError::Closed { .. }) => {
                self.health.record_success(latency_ms);
                Err(err)
            }
            Err(e) => {
                self.health.record_error();
                Err(e)
            }
        }
    }

    async fn start_push(
        &self,
        subscribed_ids: Vec<String>,
        sink: EventSink,
    ) -> Result<(), VenueError> {
        let mut slot = self.push_task.lock().unwrap();
        if slot.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let protocol = Arc::new(KalshiPushProtocol {
            ws_url: self.ws_url.clone(),
            books: Mutex::new(FxHashMap::default()),
            schema_drops: self.schema_drops.clone(),
        });
        let handle = tokio::spawn(run_push_worker(
            protocol,
            subscribed_ids,
            sink,
            self.health.clone(),
            stop_rx,
        ));
        *slot = Some(PushTask {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    async fn stop_push(&self) {
        let task = self.push_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.stop.send(true);
            task.handle.abort();
        }
    }

    fn health(&self) -> VenueHealth {
        self.health.snapshot()
    }
}

// === REST payloads ===

#[derive(Debug, Deserialize)]
struct MarketsPage {
    markets: Vec<KalshiMarketDto>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SingleMarketResponse {
    market: Option<KalshiMarketDto>,
}

#[derive(Debug, Deserialize)]
struct KalshiMarketDto {
    ticker: String,
    title: Option<String>,
    subtitle: Option<String>,
    category: Option<String>,
    close_time: Option<String>,
    status: Option<String>,
    yes_bid: Option<i64>,
    yes_ask: Option<i64>,
    last_price: Option<i64>,
    volume_24h: Option<i64>,
    liquidity: Option<i64>,
    rules_primary: Option<String>,
    settlement_sources: Option<Vec<SettlementSource>>,
}

#[derive(Debug, Deserialize)]
struct SettlementSource {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderbookResponse {
    orderbook: Option<RawBookSides>,
}

/// Kalshi book sides as `[price_cents, contracts]` pairs. `yes` holds resting
/// YES bids; `no` holds resting NO bids.
#[derive(Debug, Deserialize)]
struct RawBookSides {
    yes: Option<Vec<[i64; 2]>>,
    no: Option<Vec<[i64; 2]>>,
}

fn cents_to_price(cents: i64) -> Decimal {
    Decimal::from(cents) / dec!(100)
}

fn normalize_market(dto: KalshiMarketDto) -> Option<Market> {
    if dto.status.as_deref() != Some("active") && dto.status.as_deref() != Some("open") {
        return None;
    }
    let question = match (&dto.title, &dto.subtitle) {
        (Some(title), Some(subtitle)) if !subtitle.is_empty() => {
            format!("{} {}", title, subtitle)
        }
        (Some(title), _) => title.clone(),
        (None, _) => return None,
    };
    let end_date = dto
        .close_time
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|d| d.with_timezone(&Utc));

    let yes_bid = dto.yes_bid.map(cents_to_price);
    let yes_ask = dto.yes_ask.map(cents_to_price);
    let (midpoint, spread) = match (yes_bid, yes_ask) {
        (Some(bid), Some(ask)) => (Some((bid + ask) / dec!(2)), Some(ask - bid)),
        _ => (None, None),
    };

    let resolution_source = dto
        .settlement_sources
        .as_ref()
        .and_then(|sources| sources.first())
        .and_then(|s| s.name.clone());

    Some(Market {
        venue: Venue::Kalshi,
        external_id: dto.ticker.clone(),
        question,
        description: None,
        category: dto.category,
        outcomes: vec!["YES".to_string(), "NO".to_string()],
        end_date,
        resolution_source,
        resolution_rules: dto.rules_primary,
        tick_size: dec!(0.01),
        min_order_size: dec!(1),
        fee_rate: dec!(0.02),
        url: format!("https://kalshi.com/markets/{}", dto.ticker),
        status: MarketStatus::Active,
        yes_bid,
        yes_ask,
        midpoint,
        spread,
        liquidity: dto.liquidity.map(|cents| Decimal::from(cents) / dec!(100)),
        last_fetched_at: Some(Utc::now()),
        fetch_latency_ms: 0,
    })
}

/// Build a YES-denominated book: the `yes` side becomes bids, the explicit
/// `no` side becomes asks at the complement price.
fn orderbook_from_sides(
    external_id: &str,
    raw: RawBookSides,
    timestamp: DateTime<Utc>,
    latency_ms: u64,
) -> (OrderBook, u32) {
    let bids = raw
        .yes
        .unwrap_or_default()
        .into_iter()
        .map(|[price, count]| PriceLevel::new(cents_to_price(price), Decimal::from(count)))
        .collect();
    let asks = raw
        .no
        .unwrap_or_default()
        .into_iter()
        .map(|[price, count]| {
            PriceLevel::new(Decimal::ONE - cents_to_price(price), Decimal::from(count))
        })
        .collect();
    OrderBook::from_raw(Venue::Kalshi, external_id, bids, asks, timestamp, latency_ms)
}

// === push transport ===

#[derive(Default)]
struct BookState {
    yes: FxHashMap<i64, i64>,
    no: FxHashMap<i64, i64>,
}

struct KalshiPushProtocol {
    ws_url: String,
    books: Mutex<FxHashMap<String, BookState>>,
    schema_drops: Arc<AtomicU64>,
}

#[derive(Debug, Deserialize)]
struct WsFrame {
    #[serde(rename = "type")]
    kind: String,
    msg: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WsSnapshot {
    market_ticker: String,
    yes: Option<Vec<[i64; 2]>>,
    no: Option<Vec<[i64; 2]>>,
}

#[derive(Debug, Deserialize)]
struct WsDelta {
    market_ticker: String,
    price: i64,
    delta: i64,
    side: String,
}

#[derive(Debug, Deserialize)]
struct WsTicker {
    market_ticker: String,
    price: Option<i64>,
    yes_bid: Option<i64>,
    yes_ask: Option<i64>,
}

impl KalshiPushProtocol {
    fn rebuild_book(&self, ticker: &str) -> Option<OrderBook> {
        let books = self.books.lock().unwrap();
        let state = books.get(ticker)?;
        let bids = state
            .yes
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(&price, &count)| PriceLevel::new(cents_to_price(price), Decimal::from(count)))
            .collect();
        let asks = state
            .no
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(&price, &count)| {
                PriceLevel::new(Decimal::ONE - cents_to_price(price), Decimal::from(count))
            })
            .collect();
        let (book, _) = OrderBook::from_raw(Venue::Kalshi, ticker, bids, asks, Utc::now(), 0);
        Some(book)
    }
}

impl PushProtocol for KalshiPushProtocol {
    fn venue(&self) -> Venue {
        Venue::Kalshi
    }

    fn ws_url(&self) -> String {
        self.ws_url.clone()
    }

    fn subscribe_frames(&self, ids: &[String]) -> Vec<String> {
        vec![serde_json::json!({
            "id": 1,
            "cmd": "subscribe",
            "params": {
                "channels": ["orderbook_delta", "ticker_v2"],
                "market_tickers": ids,
            }
        })
        .to_string()]
    }

    fn parse(&self, text: &str) -> Vec<MarketEvent> {
        let frame: WsFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) => {
                self.schema_drops.fetch_add(1, Ordering::Relaxed);
                return vec![];
            }
        };
        let Some(msg) = frame.msg else {
            return vec![];
        };

        match frame.kind.as_str() {
            "orderbook_snapshot" => {
                let Ok(snapshot) = serde_json::from_value::<WsSnapshot>(msg) else {
                    self.schema_drops.fetch_add(1, Ordering::Relaxed);
                    return vec![];
                };
                let mut state = BookState::default();
                for [price, count] in snapshot.yes.unwrap_or_default() {
                    state.yes.insert(price, count);
                }
                for [price, count] in snapshot.no.unwrap_or_default() {
                    state.no.insert(price, count);
                }
                self.books
                    .lock()
                    .unwrap()
                    .insert(snapshot.market_ticker.clone(), state);
                self.rebuild_book(&snapshot.market_ticker)
                    .map(MarketEvent::OrderBook)
                    .into_iter()
                    .collect()
            }
            "orderbook_delta" => {
                let Ok(delta) = serde_json::from_value::<WsDelta>(msg) else {
                    self.schema_drops.fetch_add(1, Ordering::Relaxed);
                    return vec![];
                };
                {
                    let mut books = self.books.lock().unwrap();
                    let state = books.entry(delta.market_ticker.clone()).or_default();
                    let side = if delta.side == "yes" {
                        &mut state.yes
                    } else {
                        &mut state.no
                    };
                    let count = side.entry(delta.price).or_insert(0);
                    *count += delta.delta;
                    if *count <= 0 {
                        side.remove(&delta.price);
                    }
                }
                self.rebuild_book(&delta.market_ticker)
                    .map(MarketEvent::OrderBook)
                    .into_iter()
                    .collect()
            }
            "ticker" | "ticker_v2" => {
                let Ok(ticker) = serde_json::from_value::<WsTicker>(msg) else {
                    self.schema_drops.fetch_add(1, Ordering::Relaxed);
                    return vec![];
                };
                vec![MarketEvent::Quote(Quote {
                    venue: Venue::Kalshi,
                    external_id: ticker.market_ticker,
                    best_bid: ticker.yes_bid.map(cents_to_price),
                    best_ask: ticker.yes_ask.map(cents_to_price),
                    last_price: ticker.price.map(cents_to_price),
                    volume_24h: None,
                    timestamp: Utc::now(),
                    latency_ms: 0,
                })]
            }
            other => {
                debug!(kind = other, "ignoring kalshi ws frame");
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cents_normalize_to_unit_interval() {
        assert_eq!(cents_to_price(40), dec!(0.40));
        assert_eq!(cents_to_price(100), dec!(1));
        assert_eq!(cents_to_price(0), dec!(0));
    }

    #[test]
    fn market_dto_normalizes() {
        let dto: KalshiMarketDto = serde_json::from_str(
            r#"{
                "ticker": "PRES-2024-DJT",
                "title": "Will the Republican win the 2024 presidential election?",
                "category": "Politics",
                "close_time": "2024-11-05T23:59:00Z",
                "status": "active",
                "yes_bid": 40,
                "yes_ask": 42,
                "last_price": 41,
                "volume_24h": 125000,
                "liquidity": 2500000,
                "rules_primary": "Resolves YES if the Republican nominee wins."
            }"#,
        )
        .unwrap();

        let market = normalize_market(dto).unwrap();
        assert_eq!(market.venue, Venue::Kalshi);
        assert_eq!(market.external_id, "PRES-2024-DJT");
        assert_eq!(market.yes_bid, Some(dec!(0.40)));
        assert_eq!(market.yes_ask, Some(dec!(0.42)));
        assert_eq!(market.midpoint, Some(dec!(0.41)));
        assert_eq!(market.spread, Some(dec!(0.02)));
        assert_eq!(market.liquidity, Some(dec!(25000)));
        assert!(market.is_binary());
        assert_eq!(market.end_date.unwrap().to_rfc3339(), "2024-11-05T23:59:00+00:00");
    }

    #[test]
    fn inactive_market_is_skipped() {
        let dto: KalshiMarketDto = serde_json::from_str(
            r#"{"ticker": "X", "title": "t", "status": "settled"}"#,
        )
        .unwrap();
        assert!(normalize_market(dto).is_none());
    }

    #[test]
    fn no_side_becomes_yes_asks() {
        let raw: RawBookSides = serde_json::from_str(
            r#"{"yes": [[40, 100], [39, 200]], "no": [[55, 50], [57, 80]]}"#,
        )
        .unwrap();
        let (book, dropped) = orderbook_from_sides("T", raw, Utc::now(), 7);
        assert_eq!(dropped, 0);

        // YES bids straight through.
        assert_eq!(book.best_bid(), Some(dec!(0.40)));
        // NO bid at 0.57 -> YES ask at 0.43 (best), NO 0.55 -> ask 0.45.
        assert_eq!(book.best_ask(), Some(dec!(0.43)));
        assert_eq!(book.asks.len(), 2);
        assert_eq!(book.asks[1].price, dec!(0.45));
    }

    #[test]
    fn push_snapshot_then_delta() {
        let protocol = KalshiPushProtocol {
            ws_url: String::new(),
            books: Mutex::new(FxHashMap::default()),
            schema_drops: Arc::new(AtomicU64::new(0)),
        };

        let events = protocol.parse(
            r#"{"type": "orderbook_snapshot", "msg": {"market_ticker": "T", "yes": [[40, 100]], "no": [[55, 60]]}}"#,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            MarketEvent::OrderBook(book) => {
                assert_eq!(book.best_bid(), Some(dec!(0.40)));
                assert_eq!(book.best_ask(), Some(dec!(0.45)));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Delta removes the whole yes level.
        let events = protocol.parse(
            r#"{"type": "orderbook_delta", "msg": {"market_ticker": "T", "price": 40, "delta": -100, "side": "yes"}}"#,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            MarketEvent::OrderBook(book) => {
                assert_eq!(book.best_bid(), None);
                assert_eq!(book.best_ask(), Some(dec!(0.45)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn ticker_frame_becomes_quote() {
        let protocol = KalshiPushProtocol {
            ws_url: String::new(),
            books: Mutex::new(FxHashMap::default()),
            schema_drops: Arc::new(AtomicU64::new(0)),
        };
        let events = protocol.parse(
            r#"{"type": "ticker_v2", "msg": {"market_ticker": "T", "price": 41, "yes_bid": 40, "yes_ask": 42}}"#,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            MarketEvent::Quote(quote) => {
                assert_eq!(quote.best_bid, Some(dec!(0.40)));
                assert_eq!(quote.last_price, Some(dec!(0.41)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn garbage_frame_counts_schema_drop() {
        let drops = Arc::new(AtomicU64::new(0));
        let protocol = KalshiPushProtocol {
            ws_url: String::new(),
            books: Mutex::new(FxHashMap::default()),
            schema_drops: drops.clone(),
        };
        assert!(protocol.parse("not json").is_empty());
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
