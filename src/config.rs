//! Runtime configuration.
//!
//! One validated record, built from the environment exactly once at startup.
//! Every knob has a safe default; invalid values log a warning and fall back
//! rather than aborting. Only a missing/bad `DATABASE_URL` shape is fatal,
//! and that is surfaced by the store at connect time.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::warn;

use crate::types::Venue;

/// Kalshi REST API base URL
pub const KALSHI_API_BASE: &str = "https://api.elections.kalshi.com/trade-api/v2";

/// Kalshi WebSocket URL
pub const KALSHI_WS_URL: &str = "wss://api.elections.kalshi.com/trade-api/ws/v2";

/// Polymarket Gamma API base URL (market metadata)
pub const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";

/// Polymarket CLOB API base URL (order books)
pub const CLOB_API_BASE: &str = "https://clob.polymarket.com";

/// Polymarket market-channel WebSocket URL
pub const POLYMARKET_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

/// Application-wide configuration, assembled once in `main`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Quote freshness cutoff (ms).
    pub price_stale_threshold_ms: u64,
    /// Orderbook freshness cutoff used by the detector (ms).
    pub orderbook_stale_threshold_ms: u64,
    /// Minimum accepted net spread, percent of the buy price.
    pub min_arbitrage_spread_pct: Decimal,
    /// Minimum accepted overall confidence.
    pub min_confidence_score: f64,
    /// Minimum accepted executable size (USD).
    pub min_executable_size_usd: Decimal,
    /// Targeted refresh cadence (ms).
    pub ingestion_interval_ms: u64,
    /// Detector cadence (ms).
    pub arbitrage_scan_interval_ms: u64,
    /// Matcher cadence (ms).
    pub matching_interval_ms: u64,
    /// Full sync cadence (ms).
    pub full_sync_interval_ms: u64,
    /// Venue enable flags.
    pub enable_kalshi: bool,
    pub enable_polymarket: bool,
    /// Per-venue request quotas (per minute).
    pub kalshi_rate_limit_per_min: u32,
    pub polymarket_rate_limit_per_min: u32,
    /// Orderbook cache TTL (s).
    pub orderbook_cache_ttl_secs: u64,
    /// Outbound HTTP timeout (s).
    pub http_timeout_secs: u64,
    /// Full syncs a market may miss before it is considered closed.
    pub closed_after_missed_syncs: u32,
    /// Price snapshots retained per market.
    pub snapshot_trail_len: u32,
    /// Grace period for in-flight work at shutdown (s).
    pub shutdown_grace_secs: u64,
    /// SQLite database URL.
    pub database_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            price_stale_threshold_ms: 5_000,
            orderbook_stale_threshold_ms: 3_000,
            min_arbitrage_spread_pct: dec!(0.5),
            min_confidence_score: 0.6,
            min_executable_size_usd: dec!(10),
            ingestion_interval_ms: 2_000,
            arbitrage_scan_interval_ms: 1_000,
            matching_interval_ms: 60_000,
            full_sync_interval_ms: 300_000,
            enable_kalshi: true,
            enable_polymarket: true,
            kalshi_rate_limit_per_min: 120,
            polymarket_rate_limit_per_min: 600,
            orderbook_cache_ttl_secs: 10,
            http_timeout_secs: 10,
            closed_after_missed_syncs: 3,
            snapshot_trail_len: 50,
            shutdown_grace_secs: 30,
            database_url: "sqlite://arb_scout.db?mode=rwc".to_string(),
        }
    }
}

impl AppConfig {
    /// Build the config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            price_stale_threshold_ms: env_u64(
                "PRICE_STALE_THRESHOLD_MS",
                defaults.price_stale_threshold_ms,
            ),
            orderbook_stale_threshold_ms: env_u64(
                "ORDERBOOK_STALE_THRESHOLD_MS",
                defaults.orderbook_stale_threshold_ms,
            ),
            min_arbitrage_spread_pct: env_decimal(
                "MIN_ARBITRAGE_SPREAD_PCT",
                defaults.min_arbitrage_spread_pct,
            ),
            min_confidence_score: env_f64("MIN_CONFIDENCE_SCORE", defaults.min_confidence_score),
            min_executable_size_usd: env_decimal(
                "MIN_EXECUTABLE_SIZE_USD",
                defaults.min_executable_size_usd,
            ),
            ingestion_interval_ms: env_u64("INGESTION_INTERVAL_MS", defaults.ingestion_interval_ms),
            arbitrage_scan_interval_ms: env_u64(
                "ARBITRAGE_SCAN_INTERVAL_MS",
                defaults.arbitrage_scan_interval_ms,
            ),
            matching_interval_ms: env_u64("MATCHING_INTERVAL_MS", defaults.matching_interval_ms),
            full_sync_interval_ms: env_u64("FULL_SYNC_INTERVAL_MS", defaults.full_sync_interval_ms),
            enable_kalshi: env_bool("ENABLE_KALSHI", defaults.enable_kalshi),
            enable_polymarket: env_bool("ENABLE_POLYMARKET", defaults.enable_polymarket),
            kalshi_rate_limit_per_min: env_u32(
                "KALSHI_RATE_LIMIT_PER_MIN",
                defaults.kalshi_rate_limit_per_min,
            ),
            polymarket_rate_limit_per_min: env_u32(
                "POLYMARKET_RATE_LIMIT_PER_MIN",
                defaults.polymarket_rate_limit_per_min,
            ),
            orderbook_cache_ttl_secs: env_u64(
                "ORDERBOOK_CACHE_TTL_SECS",
                defaults.orderbook_cache_ttl_secs,
            ),
            http_timeout_secs: env_u64("HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            closed_after_missed_syncs: env_u32(
                "CLOSED_AFTER_MISSED_SYNCS",
                defaults.closed_after_missed_syncs,
            ),
            snapshot_trail_len: env_u32("SNAPSHOT_TRAIL_LEN", defaults.snapshot_trail_len),
            shutdown_grace_secs: env_u64("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace_secs),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.database_url),
        }
    }

    /// Sanity-check cross-field constraints; returns the validated config.
    pub fn validate(self) -> anyhow::Result<Self> {
        anyhow::ensure!(
            self.arbitrage_scan_interval_ms > 0,
            "ARBITRAGE_SCAN_INTERVAL_MS must be positive"
        );
        anyhow::ensure!(
            self.ingestion_interval_ms > 0,
            "INGESTION_INTERVAL_MS must be positive"
        );
        anyhow::ensure!(
            self.matching_interval_ms > 0,
            "MATCHING_INTERVAL_MS must be positive"
        );
        anyhow::ensure!(
            self.full_sync_interval_ms > 0,
            "FULL_SYNC_INTERVAL_MS must be positive"
        );
        anyhow::ensure!(
            self.orderbook_stale_threshold_ms > 0,
            "ORDERBOOK_STALE_THRESHOLD_MS must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.min_confidence_score),
            "MIN_CONFIDENCE_SCORE must be in [0, 1]"
        );
        anyhow::ensure!(
            self.min_executable_size_usd >= Decimal::ZERO,
            "MIN_EXECUTABLE_SIZE_USD must be non-negative"
        );
        anyhow::ensure!(
            self.enable_kalshi || self.enable_polymarket,
            "at least one venue must be enabled"
        );
        Ok(self)
    }

    pub fn venue_enabled(&self, venue: Venue) -> bool {
        match venue {
            Venue::Kalshi => self.enable_kalshi,
            Venue::Polymarket => self.enable_polymarket,
        }
    }

    pub fn rate_limit_per_min(&self, venue: Venue) -> u32 {
        match venue {
            Venue::Kalshi => self.kalshi_rate_limit_per_min,
            Venue::Polymarket => self.polymarket_rate_limit_per_min,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Failed to parse {}='{}', using default {}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Failed to parse {}='{}', using default {}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Failed to parse {}='{}', using default {}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Failed to parse {}='{}', using default {}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}
