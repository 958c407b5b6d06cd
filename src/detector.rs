//! Arbitrage detector.
//!
//! Every tick: pull both cached books for each CONFIRMED match, gate on
//! freshness, evaluate the two buy/sell directions on the YES leg, simulate
//! fills inside a 5% price band, and emit the better direction as an
//! opportunity when it clears the spread, size and confidence floors.
//!
//! All money math is `Decimal`; the detector reads only the cache and never
//! blocks on ingestion.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::config::AppConfig;
use crate::events::{PushBus, PushEvent};
use crate::fees::FeeTable;
use crate::metrics::Metrics;
use crate::store::Store;
use crate::types::{
    ArbitrageOpportunity, BookSide, Confidence, ExecutionStep, Market, MarketMatch,
    OpportunityStatus, OrderBook, ProfitAnalysis, Strategy, StrategyAction, Venue,
};

/// Levels beyond this multiple of the top price are not admitted to a fill.
const FILL_BAND: Decimal = dec!(0.05);
/// Hard cap on executable size (USD).
const MAX_EXECUTABLE_SIZE: Decimal = dec!(10000);
/// Depth levels contributing to the liquidity confidence component.
const LIQUIDITY_DEPTH_LEVELS: usize = 5;
/// Depth (USD) at which the liquidity component saturates.
const LIQUIDITY_SATURATION: Decimal = dec!(1000);
/// ACTIVE opportunities older than this are expired by the scan loop.
const OPPORTUNITY_MAX_AGE_SECS: i64 = 60;

/// Detection thresholds, lifted out of `AppConfig` so evaluation stays pure.
#[derive(Debug, Clone)]
pub struct DetectorParams {
    pub stale_threshold_ms: u64,
    pub min_spread_pct: Decimal,
    pub min_confidence: f64,
    pub min_executable_size: Decimal,
}

impl DetectorParams {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            stale_threshold_ms: cfg.orderbook_stale_threshold_ms,
            min_spread_pct: cfg.min_arbitrage_spread_pct,
            min_confidence: cfg.min_confidence_score,
            min_executable_size: cfg.min_executable_size_usd,
        }
    }
}

/// Everything evaluation needs about one confirmed pair at one instant.
pub struct PairSnapshot<'a> {
    pub market_match: &'a MarketMatch,
    pub source_book: &'a OrderBook,
    pub target_book: &'a OrderBook,
    pub source_market: Option<&'a Market>,
    pub target_market: Option<&'a Market>,
    pub now: DateTime<Utc>,
}

pub struct Detector {
    store: Store,
    cache: Arc<TtlCache>,
    bus: Arc<dyn PushBus>,
    fees: FeeTable,
    metrics: Metrics,
    params: DetectorParams,
}

impl Detector {
    pub fn new(
        store: Store,
        cache: Arc<TtlCache>,
        bus: Arc<dyn PushBus>,
        fees: FeeTable,
        metrics: Metrics,
        params: DetectorParams,
    ) -> Self {
        Self {
            store,
            cache,
            bus,
            fees,
            metrics,
            params,
        }
    }

    /// Tight scan loop; each iteration is independent.
    pub fn spawn(self, interval_ms: u64, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.scan_once().await {
                            warn!(error = %e, "detector scan failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
            }
        })
    }

    /// One scan over every CONFIRMED match. Returns opportunities emitted.
    pub async fn scan_once(&self) -> Result<u64> {
        let now = Utc::now();
        let matches = self.store.confirmed_matches().await?;
        let mut emitted = 0u64;

        for market_match in &matches {
            let Some(source_book) = self
                .cache
                .get_orderbook(market_match.source_venue, &market_match.source_id)
            else {
                self.metrics.stale_books_skipped.inc();
                continue;
            };
            let Some(target_book) = self
                .cache
                .get_orderbook(market_match.target_venue, &market_match.target_id)
            else {
                self.metrics.stale_books_skipped.inc();
                continue;
            };

            if source_book.age_ms(now) >= self.params.stale_threshold_ms
                || target_book.age_ms(now) >= self.params.stale_threshold_ms
            {
                // Stale data is a gating condition, not an error.
                self.metrics.stale_books_skipped.inc();
                continue;
            }

            let source_market = self
                .store
                .get_market(market_match.source_venue, &market_match.source_id)
                .await?;
            let target_market = self
                .store
                .get_market(market_match.target_venue, &market_match.target_id)
                .await?;

            let snapshot = PairSnapshot {
                market_match,
                source_book: &source_book,
                target_book: &target_book,
                source_market: source_market.as_ref(),
                target_market: target_market.as_ref(),
                now,
            };

            if let Some(opportunity) = evaluate(&self.params, &self.fees, &snapshot) {
                self.store.insert_opportunity(&opportunity).await?;
                self.metrics.opportunities_detected.inc();
                emitted += 1;

                self.bus.publish(PushEvent::NewOpportunity {
                    id: opportunity.id.to_string(),
                    match_id: format!(
                        "{}:{}~{}:{}",
                        opportunity.source_venue,
                        opportunity.source_id,
                        opportunity.target_venue,
                        opportunity.target_id
                    ),
                    roi: opportunity.profit.roi,
                    net_profit: opportunity.profit.net_profit,
                    confidence: opportunity.confidence.overall,
                    source_market: opportunity.source_id.clone(),
                    target_market: opportunity.target_id.clone(),
                });
                info!(
                    id = %opportunity.id,
                    net_profit = %opportunity.profit.net_profit,
                    size = %opportunity.profit.max_executable_size,
                    confidence = opportunity.confidence.overall,
                    "opportunity detected"
                );
            }
        }

        self.store
            .expire_opportunities_before(now - chrono::Duration::seconds(OPPORTUNITY_MAX_AGE_SECS))
            .await?;
        self.metrics.scans_completed.inc();
        Ok(emitted)
    }
}

/// Fill simulation result for one side of one book.
#[derive(Debug, Clone, PartialEq)]
pub struct FillSimulation {
    pub avg_fill_price: Decimal,
    pub total_fillable: Decimal,
    pub per_share_slippage: Decimal,
}

/// Walk the ask side from the top, admitting levels within the band above
/// the best ask.
pub fn simulate_buy_fill(book: &OrderBook) -> Option<FillSimulation> {
    let best = book.best_ask()?;
    let limit = best * (Decimal::ONE + FILL_BAND);
    let admitted = book.asks.iter().take_while(|l| l.price <= limit);
    aggregate_fill(admitted, best)
}

/// Walk the bid side from the top, admitting levels within the band below
/// the best bid.
pub fn simulate_sell_fill(book: &OrderBook) -> Option<FillSimulation> {
    let best = book.best_bid()?;
    let limit = best * (Decimal::ONE - FILL_BAND);
    let admitted = book.bids.iter().take_while(|l| l.price >= limit);
    aggregate_fill(admitted, best)
}

fn aggregate_fill<'a>(
    levels: impl Iterator<Item = &'a crate::types::PriceLevel>,
    top_price: Decimal,
) -> Option<FillSimulation> {
    let mut notional = Decimal::ZERO;
    let mut size = Decimal::ZERO;
    for level in levels {
        notional += level.price * level.size;
        size += level.size;
    }
    if size <= Decimal::ZERO {
        return None;
    }
    let avg = notional / size;
    Some(FillSimulation {
        avg_fill_price: avg,
        total_fillable: size,
        per_share_slippage: (avg - top_price).abs(),
    })
}

struct DirectionResult {
    strategy: Strategy,
    profit: ProfitAnalysis,
    confidence: Confidence,
    plan: Vec<ExecutionStep>,
}

/// Evaluate both directions for the YES leg and return the better one as an
/// opportunity, or `None` when nothing clears the gates.
pub fn evaluate(
    params: &DetectorParams,
    fees: &FeeTable,
    snapshot: &PairSnapshot<'_>,
) -> Option<ArbitrageOpportunity> {
    let forward = evaluate_direction(
        params,
        fees,
        snapshot,
        snapshot.source_book,
        snapshot.source_market,
        snapshot.target_book,
        snapshot.target_market,
    );
    let backward = evaluate_direction(
        params,
        fees,
        snapshot,
        snapshot.target_book,
        snapshot.target_market,
        snapshot.source_book,
        snapshot.source_market,
    );

    let best = match (forward, backward) {
        (Some(f), Some(b)) => {
            if f.profit.net_profit >= b.profit.net_profit {
                Some(f)
            } else {
                Some(b)
            }
        }
        (f, b) => f.or(b),
    }?;

    let m = snapshot.market_match;
    Some(ArbitrageOpportunity {
        id: Uuid::new_v4(),
        source_venue: m.source_venue,
        source_id: m.source_id.clone(),
        target_venue: m.target_venue,
        target_id: m.target_id.clone(),
        strategy: best.strategy,
        profit: best.profit,
        confidence: best.confidence,
        plan: best.plan,
        status: OpportunityStatus::Active,
        detected_at: snapshot.now,
    })
}

#[allow(clippy::too_many_arguments)]
fn evaluate_direction(
    params: &DetectorParams,
    fees: &FeeTable,
    snapshot: &PairSnapshot<'_>,
    buy_book: &OrderBook,
    buy_market: Option<&Market>,
    sell_book: &OrderBook,
    sell_market: Option<&Market>,
) -> Option<DirectionResult> {
    let ask = buy_book.best_ask()?;
    let bid = sell_book.best_bid()?;

    let gross_spread = bid - ask;
    if gross_spread <= Decimal::ZERO {
        return None;
    }

    let buy_fee = fees.schedule(buy_book.venue).taker_fee_per_share(ask);
    let sell_fee = fees.schedule(sell_book.venue).taker_fee_per_share(bid);
    let net_spread = gross_spread - buy_fee - sell_fee;
    if net_spread <= Decimal::ZERO {
        return None;
    }
    if (net_spread / ask) * dec!(100) < params.min_spread_pct {
        return None;
    }

    let buy_fill = simulate_buy_fill(buy_book)?;
    let sell_fill = simulate_sell_fill(sell_book)?;

    let max_executable = buy_fill
        .total_fillable
        .min(sell_fill.total_fillable)
        .min(MAX_EXECUTABLE_SIZE);
    if max_executable < params.min_executable_size {
        return None;
    }

    let combined_slippage =
        (buy_fill.per_share_slippage + sell_fill.per_share_slippage) / dec!(2);
    let net_profit = (net_spread - combined_slippage) * max_executable;
    if net_profit <= Decimal::ZERO {
        return None;
    }

    let capital = ask * max_executable * (Decimal::ONE + fees.taker(buy_book.venue));
    let roi = net_profit / capital;
    let days_to_expiry = buy_market
        .and_then(|m| m.end_date)
        .or_else(|| sell_market.and_then(|m| m.end_date))
        .map(|end| (end - snapshot.now).num_days().max(1))
        .unwrap_or(1);
    let annualized_roi = roi * dec!(365) / Decimal::from(days_to_expiry);

    let buy_age = buy_book.age_ms(snapshot.now);
    let sell_age = sell_book.age_ms(snapshot.now);
    let confidence = build_confidence(
        params,
        snapshot.market_match.scores.overall,
        buy_book,
        sell_book,
        buy_age,
        sell_age,
    );
    if confidence.overall < params.min_confidence {
        debug!(
            overall = confidence.overall,
            floor = params.min_confidence,
            "direction below confidence floor"
        );
        return None;
    }

    let strategy = Strategy {
        action: StrategyAction::BuyYesSellYes,
        buy_venue: buy_book.venue,
        buy_market_id: buy_book.external_id.clone(),
        buy_price: ask,
        buy_size: max_executable,
        sell_venue: sell_book.venue,
        sell_market_id: sell_book.external_id.clone(),
        sell_price: bid,
        sell_size: max_executable,
    };

    let profit = ProfitAnalysis {
        gross_spread,
        total_fees: buy_fee + sell_fee,
        estimated_slippage: combined_slippage,
        net_profit,
        roi,
        annualized_roi,
        max_executable_size: max_executable,
    };

    let plan = build_plan(
        &strategy,
        &buy_fill,
        &sell_fill,
        buy_fee,
        sell_fee,
        buy_market,
        sell_market,
    );

    Some(DirectionResult {
        strategy,
        profit,
        confidence,
        plan,
    })
}

fn build_confidence(
    params: &DetectorParams,
    match_quality: f64,
    buy_book: &OrderBook,
    sell_book: &OrderBook,
    buy_age_ms: u64,
    sell_age_ms: u64,
) -> Confidence {
    let worst_age = buy_age_ms.max(sell_age_ms) as f64;
    let freshness = (1.0 - worst_age / params.stale_threshold_ms as f64).max(0.0);

    let min_depth = [
        buy_book.depth(BookSide::Bid, LIQUIDITY_DEPTH_LEVELS),
        buy_book.depth(BookSide::Ask, LIQUIDITY_DEPTH_LEVELS),
        sell_book.depth(BookSide::Bid, LIQUIDITY_DEPTH_LEVELS),
        sell_book.depth(BookSide::Ask, LIQUIDITY_DEPTH_LEVELS),
    ]
    .into_iter()
    .min()
    .unwrap_or(Decimal::ZERO);
    let liquidity = (min_depth / LIQUIDITY_SATURATION)
        .to_f64()
        .unwrap_or(0.0)
        .min(1.0);

    let overall = Confidence::W_FRESHNESS * freshness
        + Confidence::W_LIQUIDITY * liquidity
        + Confidence::W_MATCH * match_quality;

    Confidence {
        overall,
        freshness,
        liquidity,
        match_quality,
        source_data_age_ms: buy_age_ms,
        target_data_age_ms: sell_age_ms,
    }
}

fn build_plan(
    strategy: &Strategy,
    buy_fill: &FillSimulation,
    sell_fill: &FillSimulation,
    buy_fee_per_share: Decimal,
    sell_fee_per_share: Decimal,
    buy_market: Option<&Market>,
    sell_market: Option<&Market>,
) -> Vec<ExecutionStep> {
    let size = strategy.buy_size;
    let buy_fee_total = buy_fee_per_share * size;
    let sell_fee_total = sell_fee_per_share * size;

    vec![
        ExecutionStep {
            step: 1,
            venue: strategy.buy_venue,
            market_id: strategy.buy_market_id.clone(),
            side: "BUY".to_string(),
            expected_price: strategy.buy_price,
            size,
            expected_slippage: buy_fill.per_share_slippage,
            expected_fee: buy_fee_total,
            net_cost: (strategy.buy_price + buy_fill.per_share_slippage) * size + buy_fee_total,
            instruction: format!(
                "Buy {} YES @ {} on {} ({})",
                size,
                strategy.buy_price,
                strategy.buy_venue.display_name(),
                strategy.buy_market_id
            ),
            url: buy_market.map(|m| m.url.clone()).unwrap_or_default(),
        },
        ExecutionStep {
            step: 2,
            venue: strategy.sell_venue,
            market_id: strategy.sell_market_id.clone(),
            side: "SELL".to_string(),
            expected_price: strategy.sell_price,
            size,
            expected_slippage: sell_fill.per_share_slippage,
            expected_fee: sell_fee_total,
            // Proceeds, signed as negative cost.
            net_cost: -((strategy.sell_price - sell_fill.per_share_slippage) * size
                - sell_fee_total),
            instruction: format!(
                "Sell {} YES @ {} on {} ({})",
                size,
                strategy.sell_price,
                strategy.sell_venue.display_name(),
                strategy.sell_market_id
            ),
            url: sell_market.map(|m| m.url.clone()).unwrap_or_default(),
        },
    ]
}
