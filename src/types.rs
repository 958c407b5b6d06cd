//! Core domain types shared across ingestion, matching and detection.
//!
//! All price, size and money values are `rust_decimal::Decimal` so that fee
//! and profit arithmetic stays exact on the venues' 0.01 tick grid.
//! Confidence and matcher scores are plain `f64` in `[0, 1]`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported venues. The rest of the system is n-venue: everything downstream
/// of the adapters works over `&[Arc<dyn VenueAdapter>]`, so adding a venue
/// means one new enum variant and one new adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Venue {
    Kalshi,
    Polymarket,
}

impl Venue {
    /// Tag used in cache keys and event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Kalshi => "KALSHI",
            Venue::Polymarket => "POLYMARKET",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Venue::Kalshi => "Kalshi",
            Venue::Polymarket => "Polymarket",
        }
    }

    pub fn all() -> &'static [Venue] {
        &[Venue::Kalshi, Venue::Polymarket]
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Venue {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "KALSHI" => Ok(Venue::Kalshi),
            "POLYMARKET" => Ok(Venue::Polymarket),
            other => anyhow::bail!("unknown venue tag: {}", other),
        }
    }
}

/// Market lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketStatus {
    Active,
    Closed,
    Resolved,
    Cancelled,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Active => "ACTIVE",
            MarketStatus::Closed => "CLOSED",
            MarketStatus::Resolved => "RESOLVED",
            MarketStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::str::FromStr for MarketStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(MarketStatus::Active),
            "CLOSED" => Ok(MarketStatus::Closed),
            "RESOLVED" => Ok(MarketStatus::Resolved),
            "CANCELLED" => Ok(MarketStatus::Cancelled),
            other => anyhow::bail!("unknown market status: {}", other),
        }
    }
}

/// A binary market as seen by one venue, normalized to the common shape.
///
/// Identified by `(venue, external_id)`; prices normalized to `[0, 1]`.
/// `yes_bid + no ask` is not required to sum to 1 (venue vig is allowed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub venue: Venue,
    pub external_id: String,
    pub question: String,
    pub description: Option<String>,
    pub category: Option<String>,
    /// Ordered outcome labels; strictly binary markets carry `["YES", "NO"]`.
    pub outcomes: Vec<String>,
    pub end_date: Option<DateTime<Utc>>,
    pub resolution_source: Option<String>,
    pub resolution_rules: Option<String>,
    pub tick_size: Decimal,
    pub min_order_size: Decimal,
    /// Effective taker fee rate on this venue (per-market when published).
    pub fee_rate: Decimal,
    pub url: String,
    pub status: MarketStatus,
    /// Denormalized top-of-book for the YES outcome.
    pub yes_bid: Option<Decimal>,
    pub yes_ask: Option<Decimal>,
    pub midpoint: Option<Decimal>,
    pub spread: Option<Decimal>,
    /// Rough tradeable-depth hint in USD, when the venue reports one.
    pub liquidity: Option<Decimal>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub fetch_latency_ms: u64,
}

impl Market {
    /// A market is strictly binary when it has exactly the YES/NO outcomes.
    pub fn is_binary(&self) -> bool {
        self.outcomes.len() == 2
            && self.outcomes[0].eq_ignore_ascii_case("yes")
            && self.outcomes[1].eq_ignore_ascii_case("no")
    }
}

/// One price level of an order book, `price ∈ [0, 1]`, `size ≥ 0` (USD).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Snapshot of both sides of a market's book at a moment in time.
///
/// Bids are sorted descending, asks ascending; the constructor enforces the
/// emission invariants (no crossed top-of-book, monotone levels, prices in
/// `[0, 1]`, non-negative sizes) by dropping offending rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub venue: Venue,
    pub external_id: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: u64,
}

impl OrderBook {
    /// Build a normalized book from raw venue levels.
    ///
    /// Returns the book plus the number of rows dropped for violating the
    /// ingress invariants (out-of-range price, negative or zero size, or a
    /// bid crossing the best ask). Dropped rows are counted by the caller.
    pub fn from_raw(
        venue: Venue,
        external_id: impl Into<String>,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        timestamp: DateTime<Utc>,
        latency_ms: u64,
    ) -> (Self, u32) {
        let mut dropped = 0u32;

        let mut clean = |levels: Vec<PriceLevel>| -> Vec<PriceLevel> {
            let mut kept: Vec<PriceLevel> = Vec::with_capacity(levels.len());
            for level in levels {
                let in_range = level.price >= Decimal::ZERO && level.price <= Decimal::ONE;
                if !in_range || level.size <= Decimal::ZERO {
                    dropped += 1;
                    continue;
                }
                kept.push(level);
            }
            kept
        };

        let mut bids = clean(bids);
        let mut asks = clean(asks);

        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));

        // Merge duplicate price levels so both sides stay strictly monotone.
        bids = merge_adjacent(bids);
        asks = merge_adjacent(asks);

        // Drop bids that cross the best ask; keeps best_bid < best_ask.
        if let Some(best_ask) = asks.first().map(|l| l.price) {
            let before = bids.len();
            bids.retain(|l| l.price < best_ask);
            dropped += (before - bids.len()) as u32;
        }

        (
            Self {
                venue,
                external_id: external_id.into(),
                bids,
                asks,
                timestamp,
                latency_ms,
            },
            dropped,
        )
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    pub fn midpoint(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / dec!(2)),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Age of this snapshot relative to `now`, saturating at zero.
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.timestamp).num_milliseconds().max(0) as u64
    }

    /// Cumulative size of the top `n` levels on one side.
    pub fn depth(&self, side: BookSide, n: usize) -> Decimal {
        let levels = match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        };
        levels.iter().take(n).map(|l| l.size).sum()
    }
}

fn merge_adjacent(levels: Vec<PriceLevel>) -> Vec<PriceLevel> {
    let mut merged: Vec<PriceLevel> = Vec::with_capacity(levels.len());
    for level in levels {
        match merged.last_mut() {
            Some(last) if last.price == level.price => last.size += level.size,
            _ => merged.push(level),
        }
    }
    merged
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

/// Lightweight top-of-book variant, used when a venue's quote endpoint is
/// cheaper than its depth endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub venue: Venue,
    pub external_id: String,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub last_price: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: u64,
}

impl Quote {
    pub fn midpoint(&self) -> Option<Decimal> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / dec!(2)),
            _ => None,
        }
    }
}

/// Review status of a proposed cross-venue pair. Only the external review
/// collaborator promotes/demotes between PendingReview, Confirmed and
/// Rejected; the core itself only sets Stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    PendingReview,
    Confirmed,
    Rejected,
    Stale,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::PendingReview => "PENDING_REVIEW",
            MatchStatus::Confirmed => "CONFIRMED",
            MatchStatus::Rejected => "REJECTED",
            MatchStatus::Stale => "STALE",
        }
    }
}

impl std::str::FromStr for MatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING_REVIEW" => Ok(MatchStatus::PendingReview),
            "CONFIRMED" => Ok(MatchStatus::Confirmed),
            "REJECTED" => Ok(MatchStatus::Rejected),
            "STALE" => Ok(MatchStatus::Stale),
            other => anyhow::bail!("unknown match status: {}", other),
        }
    }
}

/// Sub-scores of a proposed pair, all in `[0, 1]`.
///
/// `overall` is always the weighted sum of the four components so that a
/// persisted match can be re-verified by recomputation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatchScores {
    pub semantic: f64,
    pub date: f64,
    pub category: f64,
    pub resolution: f64,
    pub overall: f64,
}

impl MatchScores {
    pub const W_SEMANTIC: f64 = 0.45;
    pub const W_DATE: f64 = 0.20;
    pub const W_CATEGORY: f64 = 0.10;
    pub const W_RESOLUTION: f64 = 0.25;

    pub fn from_parts(semantic: f64, date: f64, category: f64, resolution: f64) -> Self {
        let overall = Self::W_SEMANTIC * semantic
            + Self::W_DATE * date
            + Self::W_CATEGORY * category
            + Self::W_RESOLUTION * resolution;
        Self {
            semantic,
            date,
            category,
            resolution,
            overall,
        }
    }

    /// Recompute `overall` from the stored components.
    pub fn recompute_overall(&self) -> f64 {
        Self::W_SEMANTIC * self.semantic
            + Self::W_DATE * self.date
            + Self::W_CATEGORY * self.category
            + Self::W_RESOLUTION * self.resolution
    }
}

/// A proposed (or reviewed) cross-venue equivalence between two markets.
///
/// The pair is directional for storage purposes only; `source.venue` always
/// differs from `target.venue` and the key `(source, target)` is stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMatch {
    pub source_venue: Venue,
    pub source_id: String,
    pub target_venue: Venue,
    pub target_id: String,
    pub scores: MatchScores,
    /// Up to a handful of stemmed terms shared by both questions.
    pub matched_terms: Vec<String>,
    /// Human-readable warning when the resolution rules diverge.
    pub resolution_diff: Option<String>,
    pub match_reason: String,
    pub status: MatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MarketMatch {
    /// Natural key, used for upserts.
    pub fn key(&self) -> (Venue, &str, Venue, &str) {
        (
            self.source_venue,
            self.source_id.as_str(),
            self.target_venue,
            self.target_id.as_str(),
        )
    }

    pub fn references(&self, venue: Venue, external_id: &str) -> bool {
        (self.source_venue == venue && self.source_id == external_id)
            || (self.target_venue == venue && self.target_id == external_id)
    }
}

/// The four directional actions a strategy can take across the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyAction {
    BuyYesSellYes,
    BuyNoSellNo,
    BuyYesSellNo,
    BuyNoSellYes,
}

impl StrategyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyAction::BuyYesSellYes => "BUY_YES_SELL_YES",
            StrategyAction::BuyNoSellNo => "BUY_NO_SELL_NO",
            StrategyAction::BuyYesSellNo => "BUY_YES_SELL_NO",
            StrategyAction::BuyNoSellYes => "BUY_NO_SELL_YES",
        }
    }
}

/// Directional strategy for one opportunity: buy on one venue, sell on the
/// other, same economic outcome on both legs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub action: StrategyAction,
    pub buy_venue: Venue,
    pub buy_market_id: String,
    pub buy_price: Decimal,
    pub buy_size: Decimal,
    pub sell_venue: Venue,
    pub sell_market_id: String,
    pub sell_price: Decimal,
    pub sell_size: Decimal,
}

/// Money breakdown of one opportunity, per share and in total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitAnalysis {
    /// `sell_bid - buy_ask` per share, before fees.
    pub gross_spread: Decimal,
    /// Sum of per-share taker fees on both legs.
    pub total_fees: Decimal,
    /// Combined per-share slippage estimate from the fill simulation.
    pub estimated_slippage: Decimal,
    pub net_profit: Decimal,
    pub roi: Decimal,
    pub annualized_roi: Decimal,
    pub max_executable_size: Decimal,
}

/// Confidence record; every component in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confidence {
    pub overall: f64,
    pub freshness: f64,
    pub liquidity: f64,
    pub match_quality: f64,
    pub source_data_age_ms: u64,
    pub target_data_age_ms: u64,
}

impl Confidence {
    pub const W_FRESHNESS: f64 = 0.35;
    pub const W_LIQUIDITY: f64 = 0.30;
    pub const W_MATCH: f64 = 0.35;

    pub fn recompute_overall(&self) -> f64 {
        Self::W_FRESHNESS * self.freshness
            + Self::W_LIQUIDITY * self.liquidity
            + Self::W_MATCH * self.match_quality
    }
}

/// One step of the execution plan handed to a human (or a downstream bot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step: u8,
    pub venue: Venue,
    pub market_id: String,
    pub side: String,
    pub expected_price: Decimal,
    pub size: Decimal,
    pub expected_slippage: Decimal,
    pub expected_fee: Decimal,
    pub net_cost: Decimal,
    pub instruction: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpportunityStatus {
    Active,
    Expired,
    Executed,
    Missed,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityStatus::Active => "ACTIVE",
            OpportunityStatus::Expired => "EXPIRED",
            OpportunityStatus::Executed => "EXECUTED",
            OpportunityStatus::Missed => "MISSED",
        }
    }
}

impl std::str::FromStr for OpportunityStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(OpportunityStatus::Active),
            "EXPIRED" => Ok(OpportunityStatus::Expired),
            "EXECUTED" => Ok(OpportunityStatus::Executed),
            "MISSED" => Ok(OpportunityStatus::Missed),
            other => anyhow::bail!("unknown opportunity status: {}", other),
        }
    }
}

/// A detected arbitrage instance for a specific match at a specific moment.
/// Append-only; re-detections produce new rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub id: Uuid,
    pub source_venue: Venue,
    pub source_id: String,
    pub target_venue: Venue,
    pub target_id: String,
    pub strategy: Strategy,
    pub profit: ProfitAnalysis,
    pub confidence: Confidence,
    pub plan: Vec<ExecutionStep>,
    pub status: OpportunityStatus,
    pub detected_at: DateTime<Utc>,
}

/// Risk band of a partial-fill scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskBand {
    Low,
    Medium,
    High,
}

/// Derived what-if row for a partially filled opportunity. Never stored;
/// computed on demand from the parent opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialFillScenario {
    pub fill_pct: u8,
    pub filled_qty: Decimal,
    pub adjusted_profit: Decimal,
    pub risk: RiskBand,
    pub recommendation: String,
}

impl ArbitrageOpportunity {
    /// Partial-fill what-if table for 25/50/75/100 percent fills.
    pub fn partial_fill_scenarios(&self) -> Vec<PartialFillScenario> {
        [25u8, 50, 75, 100]
            .iter()
            .map(|&pct| {
                let factor = Decimal::from(pct) / dec!(100);
                let risk = if pct >= 75 {
                    RiskBand::Low
                } else if pct >= 50 {
                    RiskBand::Medium
                } else {
                    RiskBand::High
                };
                let recommendation = match risk {
                    RiskBand::Low => {
                        "Fill depth supports near-complete execution; proceed at plan size."
                    }
                    RiskBand::Medium => {
                        "Partial fill likely; consider splitting the order or reducing size."
                    }
                    RiskBand::High => {
                        "Thin fill expected; only execute if the residual leg can be unwound."
                    }
                };
                PartialFillScenario {
                    fill_pct: pct,
                    filled_qty: self.profit.max_executable_size * factor,
                    adjusted_profit: self.profit.net_profit * factor,
                    risk,
                    recommendation: recommendation.to_string(),
                }
            })
            .collect()
    }
}
