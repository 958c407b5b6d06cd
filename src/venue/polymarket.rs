//! Polymarket adapter.
//!
//! Market metadata comes from the Gamma API, depth from the CLOB REST API,
//! and push updates from the CLOB market WebSocket channel. Polymarket
//! already quotes in decimal dollars on `[0, 1]`; numeric fields arrive as
//! JSON numbers or decimal strings and are parsed without a float detour.
//!
//! A market's `external_id` is its YES outcome token id, which is what the
//! CLOB book and WS channel are keyed by.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::{CLOB_API_BASE, GAMMA_API_BASE, POLYMARKET_WS_URL};
use crate::events::{EventSink, MarketEvent};
use crate::gate::VenueGate;
use crate::retry::{retry_transient, RetryPolicy};
use crate::types::{Market, MarketStatus, OrderBook, PriceLevel, Quote, Venue};
use crate::venue::push::{run_push_worker, PushProtocol};
use crate::venue::{Fetched, HealthTracker, VenueAdapter, VenueError, VenueHealth};

const PAGE_LIMIT: u32 = 100;
const MAX_PAGES: u32 = 50;

struct PushTask {
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

pub struct PolymarketAdapter {
    client: reqwest::Client,
    gamma_base: String,
    clob_base: String,
    ws_url: String,
    gate: Arc<VenueGate>,
    health: Arc<HealthTracker>,
    retry: RetryPolicy,
    push_task: Mutex<Option<PushTask>>,
    schema_drops: Arc<AtomicU64>,
}

impl PolymarketAdapter {
    pub fn new(gate: Arc<VenueGate>, http_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .user_agent("arb-scout/0.1")
            .build()?;
        Ok(Self {
            client,
            gamma_base: GAMMA_API_BASE.to_string(),
            clob_base: CLOB_API_BASE.to_string(),
            ws_url: POLYMARKET_WS_URL.to_string(),
            gate,
            health: Arc::new(HealthTracker::new(Venue::Polymarket)),
            retry: RetryPolicy::from_env(),
            push_task: Mutex::new(None),
            schema_drops: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn health_tracker(&self) -> Arc<HealthTracker> {
        self.health.clone()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T, VenueError> {
        let _permit = self.gate.acquire().await;
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(VenueError::from_reqwest)?;
        let status = response.status().as_u16();
        match status {
            200 => response
                .json::<T>()
                .await
                .map_err(|e| VenueError::Schema(e.to_string())),
            429 => {
                self.gate.report_rate_limited();
                let retry_after_secs = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                Err(VenueError::RateLimited { retry_after_secs })
            }
            _ => Err(VenueError::from_status(
                status,
                format!("HTTP {} GET {}", status, url),
            )),
        }
    }
}

#[async_trait]
impl VenueAdapter for PolymarketAdapter {
    fn venue(&self) -> Venue {
        Venue::Polymarket
    }

    async fn fetch_active_markets(&self) -> Result<Fetched<Vec<Market>>, VenueError> {
        let start = Instant::now();
        let mut markets = Vec::new();

        for page in 0..MAX_PAGES {
            let url = format!(
                "{}/markets?active=true&closed=false&limit={}&offset={}",
                self.gamma_base,
                PAGE_LIMIT,
                page * PAGE_LIMIT
            );
            let batch: Vec<GammaMarketDto> =
                retry_transient(&self.retry, "polymarket_markets", || {
                    self.get_json(url.clone())
                })
                .await
                .inspect_err(|_| self.health.record_error())?;

            let done = batch.len() < PAGE_LIMIT as usize;
            for dto in batch {
                match normalize_market(dto) {
                    Some(market) => markets.push(market),
                    None => {
                        self.schema_drops.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            if done {
                break;
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
        let url = format!("{}/book?token_id={}", self.clob_base, external_id);
        let response: Result<ClobBookDto, VenueError> =
            retry_transient(&self.retry, "polymarket_book", || self.get_json(url.clone())).await;

        let latency_ms = start.elapsed().as_millis() as u64;
        match response {
            Ok(dto) => {
                self.health.record_success(latency_ms);
                let (book, dropped) = book_from_dto(external_id, dto, latency_ms);
                if dropped > 0 {
                    self.schema_drops.fetch_add(dropped as u64, Ordering::Relaxed);
                    warn!(market = external_id, dropped, "dropped invalid polymarket book rows");
                }
                Ok(Fetched {
                    value: Some(book),
                    latency_ms,
                })
            }
            Err(VenueError::Schema(msg)) if msg.starts_with("HTTP 404") => {
                self.health.record_success(latency_ms);
                Err(VenueError::Closed {
                    external_id: external_id.to_string(),
                })
            }
            Err(e) => {
                self.health.record_error();
                Err(e)
            }
        }
    }

    async fn fetch_quote(&self, external_id: &str) -> Result<Fetched<Option<Quote>>, VenueError> {
        let start = Instant::now();
        let url = format!(
            "{}/markets?clob_token_ids={}",
            self.gamma_base, external_id
        );
        let response: Result<Vec<GammaMarketDto>, VenueError> =
            retry_transient(&self.retry, "polymarket_quote", || self.get_json(url.clone())).await;

        let latency_ms = start.elapsed().as_millis() as u64;
        match response {
            Ok(batch) => {
                self.health.record_success(latency_ms);
                let quote = batch.into_iter().next().map(|dto| Quote {
                    venue: Venue::Polymarket,
                    external_id: external_id.to_string(),
                    best_bid: dto.best_bid.as_ref().and_then(number_to_decimal),
                    best_ask: dto.best_ask.as_ref().and_then(number_to_decimal),
                    last_price: dto.last_trade_price.as_ref().and_then(number_to_decimal),
                    volume_24h: dto.volume_24hr.as_ref().and_then(number_to_decimal),
                    timestamp: Utc::now(),
                    latency_ms,
                });
                Ok(Fetched {
                    value: quote,
                    latency_ms,
                })
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
        let protocol = Arc::new(PolymarketPushProtocol {
            ws_url: self.ws_url.clone(),
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

// === Gamma payloads ===

/// Gamma market row. Several list-valued fields arrive as JSON-encoded
/// strings (`"[\"Yes\", \"No\"]"`) and are decoded in a second step.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarketDto {
    question: Option<String>,
    description: Option<String>,
    category: Option<String>,
    slug: Option<String>,
    end_date: Option<String>,
    outcomes: Option<String>,
    clob_token_ids: Option<String>,
    best_bid: Option<serde_json::Number>,
    best_ask: Option<serde_json::Number>,
    last_trade_price: Option<serde_json::Number>,
    volume_24hr: Option<serde_json::Number>,
    liquidity_num: Option<serde_json::Number>,
    order_price_min_tick_size: Option<serde_json::Number>,
    order_min_size: Option<serde_json::Number>,
    resolution_source: Option<String>,
    active: Option<bool>,
    closed: Option<bool>,
}

fn number_to_decimal(n: &serde_json::Number) -> Option<Decimal> {
    n.to_string().parse().ok()
}

fn parse_string_list(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
}

fn normalize_market(dto: GammaMarketDto) -> Option<Market> {
    if dto.active == Some(false) || dto.closed == Some(true) {
        return None;
    }
    let question = dto.question.clone()?;
    let outcomes = parse_string_list(&dto.outcomes);
    let token_ids = parse_string_list(&dto.clob_token_ids);
    // The YES token id keys both the CLOB book and the WS channel.
    let external_id = token_ids.first()?.clone();

    let end_date = dto
        .end_date
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|d| d.with_timezone(&Utc));

    let yes_bid = dto.best_bid.as_ref().and_then(number_to_decimal);
    let yes_ask = dto.best_ask.as_ref().and_then(number_to_decimal);
    let (midpoint, spread) = match (yes_bid, yes_ask) {
        (Some(bid), Some(ask)) => (Some((bid + ask) / dec!(2)), Some(ask - bid)),
        _ => (None, None),
    };

    let outcomes = if outcomes.is_empty() {
        vec!["YES".to_string(), "NO".to_string()]
    } else {
        outcomes.iter().map(|o| o.to_uppercase()).collect()
    };

    Some(Market {
        venue: Venue::Polymarket,
        external_id,
        question,
        description: dto.description.clone(),
        category: dto.category.clone(),
        outcomes,
        end_date,
        resolution_source: dto.resolution_source.clone(),
        // Gamma publishes resolution criteria inside the description.
        resolution_rules: dto.description,
        tick_size: dto
            .order_price_min_tick_size
            .as_ref()
            .and_then(number_to_decimal)
            .unwrap_or(dec!(0.01)),
        min_order_size: dto
            .order_min_size
            .as_ref()
            .and_then(number_to_decimal)
            .unwrap_or(dec!(1)),
        fee_rate: dec!(0.01),
        url: dto
            .slug
            .map(|slug| format!("https://polymarket.com/event/{}", slug))
            .unwrap_or_else(|| "https://polymarket.com".to_string()),
        status: MarketStatus::Active,
        yes_bid,
        yes_ask,
        midpoint,
        spread,
        liquidity: dto.liquidity_num.as_ref().and_then(number_to_decimal),
        last_fetched_at: Some(Utc::now()),
        fetch_latency_ms: 0,
    })
}

// === CLOB payloads ===

#[derive(Debug, Deserialize)]
struct ClobLevelDto {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct ClobBookDto {
    bids: Option<Vec<ClobLevelDto>>,
    asks: Option<Vec<ClobLevelDto>>,
    /// Milliseconds since epoch, as a string.
    timestamp: Option<String>,
}

fn parse_levels(levels: Option<Vec<ClobLevelDto>>, dropped: &mut u32) -> Vec<PriceLevel> {
    levels
        .unwrap_or_default()
        .into_iter()
        .filter_map(|level| {
            match (level.price.parse::<Decimal>(), level.size.parse::<Decimal>()) {
                (Ok(price), Ok(size)) => Some(PriceLevel::new(price, size)),
                _ => {
                    *dropped += 1;
                    None
                }
            }
        })
        .collect()
}

fn book_from_dto(external_id: &str, dto: ClobBookDto, latency_ms: u64) -> (OrderBook, u32) {
    let mut parse_drops = 0u32;
    let bids = parse_levels(dto.bids, &mut parse_drops);
    let asks = parse_levels(dto.asks, &mut parse_drops);
    let timestamp = dto
        .timestamp
        .as_deref()
        .and_then(|raw| raw.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    let (book, invalid_drops) = OrderBook::from_raw(
        Venue::Polymarket,
        external_id,
        bids,
        asks,
        timestamp,
        latency_ms,
    );
    (book, parse_drops + invalid_drops)
}

// === push transport ===

struct PolymarketPushProtocol {
    ws_url: String,
    schema_drops: Arc<AtomicU64>,
}

#[derive(Debug, Deserialize)]
struct WsBookFrame {
    event_type: String,
    asset_id: Option<String>,
    bids: Option<Vec<ClobLevelDto>>,
    asks: Option<Vec<ClobLevelDto>>,
    price: Option<String>,
    timestamp: Option<String>,
}

impl PolymarketPushProtocol {
    fn frame_to_event(&self, frame: WsBookFrame) -> Option<MarketEvent> {
        let asset_id = frame.asset_id?;
        match frame.event_type.as_str() {
            "book" => {
                let dto = ClobBookDto {
                    bids: frame.bids,
                    asks: frame.asks,
                    timestamp: frame.timestamp,
                };
                let (book, dropped) = book_from_dto(&asset_id, dto, 0);
                if dropped > 0 {
                    self.schema_drops.fetch_add(dropped as u64, Ordering::Relaxed);
                }
                Some(MarketEvent::OrderBook(book))
            }
            "last_trade_price" => {
                let last_price = frame.price.as_deref().and_then(|p| p.parse().ok());
                Some(MarketEvent::Quote(Quote {
                    venue: Venue::Polymarket,
                    external_id: asset_id,
                    best_bid: None,
                    best_ask: None,
                    last_price,
                    volume_24h: None,
                    timestamp: Utc::now(),
                    latency_ms: 0,
                }))
            }
            // Incremental price_change frames are superseded by the next
            // book frame or targeted refresh; nothing to emit.
            "price_change" => None,
            other => {
                debug!(kind = other, "ignoring polymarket ws frame");
                None
            }
        }
    }
}

impl PushProtocol for PolymarketPushProtocol {
    fn venue(&self) -> Venue {
        Venue::Polymarket
    }

    fn ws_url(&self) -> String {
        self.ws_url.clone()
    }

    fn subscribe_frames(&self, ids: &[String]) -> Vec<String> {
        vec![serde_json::json!({
            "type": "market",
            "assets_ids": ids,
        })
        .to_string()]
    }

    fn parse(&self, text: &str) -> Vec<MarketEvent> {
        // The market channel delivers either a single frame or a batch.
        if let Ok(frames) = serde_json::from_str::<Vec<WsBookFrame>>(text) {
            return frames
                .into_iter()
                .filter_map(|frame| self.frame_to_event(frame))
                .collect();
        }
        match serde_json::from_str::<WsBookFrame>(text) {
            Ok(frame) => self.frame_to_event(frame).into_iter().collect(),
            Err(_) => {
                self.schema_drops.fetch_add(1, Ordering::Relaxed);
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gamma_json() -> &'static str {
        r#"{
            "question": "Will Bitcoin reach $100k by December 31, 2024?",
            "description": "Resolves YES if BTC/USD trades at or above 100000 on any major exchange before the deadline.",
            "category": "Crypto",
            "slug": "bitcoin-100k-2024",
            "endDate": "2024-12-31T23:59:00Z",
            "outcomes": "[\"Yes\", \"No\"]",
            "clobTokenIds": "[\"7131853\", \"7131854\"]",
            "bestBid": 0.31,
            "bestAsk": 0.33,
            "lastTradePrice": 0.32,
            "volume24hr": 51234.5,
            "liquidityNum": 120000.0,
            "orderPriceMinTickSize": 0.01,
            "orderMinSize": 5,
            "active": true,
            "closed": false
        }"#
    }

    #[test]
    fn gamma_market_normalizes() {
        let dto: GammaMarketDto = serde_json::from_str(gamma_json()).unwrap();
        let market = normalize_market(dto).unwrap();

        assert_eq!(market.venue, Venue::Polymarket);
        assert_eq!(market.external_id, "7131853");
        assert_eq!(market.outcomes, vec!["YES", "NO"]);
        assert!(market.is_binary());
        assert_eq!(market.yes_bid, Some(dec!(0.31)));
        assert_eq!(market.yes_ask, Some(dec!(0.33)));
        assert_eq!(market.midpoint, Some(dec!(0.32)));
        assert_eq!(market.tick_size, dec!(0.01));
        assert_eq!(market.min_order_size, dec!(5));
        assert_eq!(market.url, "https://polymarket.com/event/bitcoin-100k-2024");
    }

    #[test]
    fn closed_market_is_skipped() {
        let dto: GammaMarketDto = serde_json::from_str(
            r#"{"question": "q", "clobTokenIds": "[\"1\"]", "closed": true}"#,
        )
        .unwrap();
        assert!(normalize_market(dto).is_none());
    }

    #[test]
    fn clob_book_parses_decimal_strings() {
        let dto: ClobBookDto = serde_json::from_str(
            r#"{
                "bids": [{"price": "0.31", "size": "150.5"}, {"price": "0.30", "size": "900"}],
                "asks": [{"price": "0.33", "size": "200"}],
                "timestamp": "1730000000000"
            }"#,
        )
        .unwrap();
        let (book, dropped) = book_from_dto("7131853", dto, 12);
        assert_eq!(dropped, 0);
        assert_eq!(book.best_bid(), Some(dec!(0.31)));
        assert_eq!(book.best_ask(), Some(dec!(0.33)));
        assert_eq!(book.bids[0].size, dec!(150.5));
        assert_eq!(book.timestamp.timestamp_millis(), 1_730_000_000_000);
    }

    #[test]
    fn malformed_level_is_dropped_and_counted() {
        let dto: ClobBookDto = serde_json::from_str(
            r#"{"bids": [{"price": "oops", "size": "10"}], "asks": [], "timestamp": null}"#,
        )
        .unwrap();
        let (book, dropped) = book_from_dto("x", dto, 0);
        assert_eq!(dropped, 1);
        assert!(book.bids.is_empty());
    }

    #[test]
    fn ws_book_frame_becomes_orderbook() {
        let protocol = PolymarketPushProtocol {
            ws_url: String::new(),
            schema_drops: Arc::new(AtomicU64::new(0)),
        };
        let events = protocol.parse(
            r#"{
                "event_type": "book",
                "asset_id": "7131853",
                "bids": [{"price": "0.31", "size": "100"}],
                "asks": [{"price": "0.33", "size": "80"}],
                "timestamp": "1730000000000"
            }"#,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            MarketEvent::OrderBook(book) => {
                assert_eq!(book.venue, Venue::Polymarket);
                assert_eq!(book.best_ask(), Some(dec!(0.33)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn ws_batch_and_trade_price() {
        let protocol = PolymarketPushProtocol {
            ws_url: String::new(),
            schema_drops: Arc::new(AtomicU64::new(0)),
        };
        let events = protocol.parse(
            r#"[
                {"event_type": "last_trade_price", "asset_id": "7131853", "price": "0.32"},
                {"event_type": "price_change", "asset_id": "7131853"}
            ]"#,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            MarketEvent::Quote(quote) => assert_eq!(quote.last_price, Some(dec!(0.32))),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
