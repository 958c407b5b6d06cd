//! Process entry point: configuration, bootstrap, workers, shutdown.
//!
//! Bootstrap failures (config, store) exit non-zero. After bootstrap,
//! individual venue degradation never kills the process; a shutdown signal
//! flips one flag that every loop observes between iterations, with a global
//! drain deadline for in-flight work.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, info_span, warn};

use arb_scout::cache::TtlCache;
use arb_scout::config::AppConfig;
use arb_scout::detector::{Detector, DetectorParams};
use arb_scout::events::{BroadcastBus, PushBus};
use arb_scout::fees::FeeTable;
use arb_scout::gate::VenueGate;
use arb_scout::ingest::Orchestrator;
use arb_scout::logging;
use arb_scout::matcher::Matcher;
use arb_scout::metrics::Metrics;
use arb_scout::status::StatusReporter;
use arb_scout::store::Store;
use arb_scout::types::Venue;
use arb_scout::venue::kalshi::KalshiAdapter;
use arb_scout::venue::polymarket::PolymarketAdapter;
use arb_scout::venue::VenueAdapter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = logging::init();
    let run_id = logging::run_id();

    let cfg = Arc::new(AppConfig::from_env().validate()?);

    let root_span = info_span!("arb_scout", run_id = %run_id);
    let _enter = root_span.enter();

    info!(
        kalshi = cfg.enable_kalshi,
        polymarket = cfg.enable_polymarket,
        scan_ms = cfg.arbitrage_scan_interval_ms,
        refresh_ms = cfg.ingestion_interval_ms,
        matching_ms = cfg.matching_interval_ms,
        "arb-scout starting"
    );

    // Bootstrap failures are fatal; everything after this degrades gracefully.
    let store = Store::connect(&cfg.database_url)
        .await
        .context("store bootstrap failed")?;
    let cache = Arc::new(TtlCache::new());
    let bus: Arc<dyn PushBus> = Arc::new(BroadcastBus::new(256));
    let metrics = Metrics::new();
    let fees = FeeTable::from_env();
    let http_timeout = Duration::from_secs(cfg.http_timeout_secs);

    let mut adapters: Vec<Arc<dyn VenueAdapter>> = Vec::new();
    if cfg.enable_kalshi {
        let gate = Arc::new(VenueGate::default_for(
            Venue::Kalshi,
            cfg.rate_limit_per_min(Venue::Kalshi),
        ));
        adapters.push(Arc::new(KalshiAdapter::new(gate, http_timeout)?));
        info!("kalshi adapter enabled");
    }
    if cfg.enable_polymarket {
        let gate = Arc::new(VenueGate::default_for(
            Venue::Polymarket,
            cfg.rate_limit_per_min(Venue::Polymarket),
        ));
        adapters.push(Arc::new(PolymarketAdapter::new(gate, http_timeout)?));
        info!("polymarket adapter enabled");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator = Orchestrator::new(
        adapters.clone(),
        cache.clone(),
        store.clone(),
        bus.clone(),
        metrics.clone(),
        cfg.clone(),
    );
    let mut handles = orchestrator.spawn(shutdown_rx.clone());

    handles.push(
        Matcher::new(store.clone(), metrics.clone(), shutdown_rx.clone())
            .spawn(cfg.matching_interval_ms),
    );

    handles.push(
        Detector::new(
            store.clone(),
            cache.clone(),
            bus.clone(),
            fees,
            metrics.clone(),
            DetectorParams::from_config(&cfg),
        )
        .spawn(cfg.arbitrage_scan_interval_ms, shutdown_rx.clone()),
    );

    // Periodic status heartbeat for the logs; the API collaborator reads the
    // same snapshot through the library surface.
    {
        let reporter = StatusReporter::new(adapters.clone(), store.clone(), metrics.clone());
        let mut shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => match reporter.snapshot().await {
                        Ok(snapshot) => {
                            let healthy = reporter.healthy().await;
                            info!(
                                markets = snapshot.ingestion.markets_ingested,
                                orderbooks = snapshot.ingestion.orderbooks_updated,
                                confirmed = snapshot.matching.confirmed_matches,
                                active_opps = snapshot.arbitrage.active_count,
                                healthy = healthy,
                                "status heartbeat"
                            )
                        }
                        Err(e) => warn!(error = %e, "status snapshot failed"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received; draining");
    let _ = shutdown_tx.send(true);

    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(cfg.shutdown_grace_secs), drain)
        .await
        .is_err()
    {
        error!(
            grace_secs = cfg.shutdown_grace_secs,
            "drain deadline exceeded; exiting non-zero"
        );
        std::process::exit(1);
    }

    info!("shutdown complete");
    Ok(())
}
