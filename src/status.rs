//! Status and health snapshot for the API collaborator.
//!
//! Assembles adapter healths, ingestion stats, match counts and open
//! opportunities into one serializable record. The API layer serves it
//! verbatim; `healthy()` backs its 200/503 decision.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::metrics::Metrics;
use crate::store::Store;
use crate::venue::{HealthStatus, VenueAdapter};

const TOP_OPPORTUNITIES: u32 = 5;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStatus {
    pub status: HealthStatus,
    pub market_count: u64,
    pub last_fetch: Option<DateTime<Utc>>,
    pub avg_latency_ms: u64,
    pub consecutive_errors: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionStatus {
    pub markets_ingested: u64,
    pub orderbooks_updated: u64,
    pub quotes_updated: u64,
    pub errors_count: u64,
    pub last_full_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingStatus {
    pub confirmed_matches: u64,
    pub pending_review: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopOpportunity {
    pub id: String,
    pub spread: Decimal,
    pub confidence: f64,
    pub max_size: Decimal,
    pub age_seconds: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbitrageStatus {
    pub active_count: u64,
    pub top_opportunities: Vec<TopOpportunity>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub uptime: u64,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub platforms: BTreeMap<String, PlatformStatus>,
    pub ingestion: IngestionStatus,
    pub matching: MatchingStatus,
    pub arbitrage: ArbitrageStatus,
    pub system: SystemStatus,
}

pub struct StatusReporter {
    adapters: Vec<Arc<dyn VenueAdapter>>,
    store: Store,
    metrics: Metrics,
    started_at: Instant,
}

impl StatusReporter {
    pub fn new(adapters: Vec<Arc<dyn VenueAdapter>>, store: Store, metrics: Metrics) -> Self {
        Self {
            adapters,
            store,
            metrics,
            started_at: Instant::now(),
        }
    }

    /// True when every adapter is HEALTHY and the store answers.
    pub async fn healthy(&self) -> bool {
        let adapters_ok = self
            .adapters
            .iter()
            .all(|a| a.health().status == HealthStatus::Healthy);
        adapters_ok && self.store.match_counts().await.is_ok()
    }

    pub async fn snapshot(&self) -> Result<StatusSnapshot> {
        let now = Utc::now();

        let mut platforms = BTreeMap::new();
        for adapter in &self.adapters {
            let health = adapter.health();
            platforms.insert(
                adapter.venue().as_str().to_string(),
                PlatformStatus {
                    status: health.status,
                    market_count: health.market_count,
                    last_fetch: health.last_fetch,
                    avg_latency_ms: health.avg_latency_ms,
                    consecutive_errors: health.consecutive_errors,
                },
            );
        }

        let (confirmed_matches, pending_review) = self.store.match_counts().await?;
        let active_count = self.store.count_active_opportunities().await?;
        let top_opportunities = self
            .store
            .active_opportunities(TOP_OPPORTUNITIES)
            .await?
            .into_iter()
            .map(|opp| TopOpportunity {
                id: opp.id.to_string(),
                spread: opp.profit.gross_spread,
                confidence: opp.confidence.overall,
                max_size: opp.profit.max_executable_size,
                age_seconds: (now - opp.detected_at).num_seconds().max(0),
            })
            .collect();

        Ok(StatusSnapshot {
            platforms,
            ingestion: IngestionStatus {
                markets_ingested: self.metrics.markets_ingested.get(),
                orderbooks_updated: self.metrics.orderbooks_updated.get(),
                quotes_updated: self.metrics.quotes_updated.get(),
                errors_count: self.metrics.errors_count.get(),
                last_full_sync_at: self.metrics.last_full_sync_at(),
            },
            matching: MatchingStatus {
                confirmed_matches,
                pending_review,
            },
            arbitrage: ArbitrageStatus {
                active_count,
                top_opportunities,
            },
            system: SystemStatus {
                uptime: self.started_at.elapsed().as_secs(),
                memory_mb: resident_memory_mb(),
                timestamp: now,
            },
        })
    }
}

/// Resident set size in MB from procfs; 0 where unavailable.
fn resident_memory_mb() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|contents| {
            contents.lines().find_map(|line| {
                let rest = line.strip_prefix("VmRSS:")?;
                rest.split_whitespace()
                    .next()
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb / 1024)
            })
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_shape_is_camel_case() {
        let store = Store::in_memory().await.unwrap();
        let metrics = Metrics::new();
        metrics.markets_ingested.add(7);
        let reporter = StatusReporter::new(vec![], store, metrics);

        let snapshot = reporter.snapshot().await.unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(json["ingestion"]["marketsIngested"], 7);
        assert!(json["ingestion"]["lastFullSyncAt"].is_null());
        assert_eq!(json["matching"]["confirmedMatches"], 0);
        assert_eq!(json["arbitrage"]["activeCount"], 0);
        assert!(json["arbitrage"]["topOpportunities"].is_array());
        assert!(json["system"]["memoryMB"].is_number());
    }

    #[tokio::test]
    async fn healthy_with_no_adapters_and_live_store() {
        let store = Store::in_memory().await.unwrap();
        let reporter = StatusReporter::new(vec![], store, Metrics::new());
        assert!(reporter.healthy().await);
    }
}
