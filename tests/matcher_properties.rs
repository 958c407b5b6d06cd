//! Matcher behavior through the real store: proposal thresholds, the
//! end-date prefilter, idempotence, and stale transitions.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal_macros::dec;
use tokio::sync::watch;

use arb_scout::matcher::{Matcher, MIN_OVERALL_SCORE};
use arb_scout::metrics::Metrics;
use arb_scout::store::Store;
use arb_scout::types::{Market, MarketStatus, MatchStatus, Venue};

fn market(venue: Venue, id: &str, question: &str, category: &str, rules: &str) -> Market {
    Market {
        venue,
        external_id: id.to_string(),
        question: question.to_string(),
        description: None,
        category: Some(category.to_string()),
        outcomes: vec!["YES".into(), "NO".into()],
        end_date: Some(Utc.with_ymd_and_hms(2024, 11, 5, 0, 0, 0).unwrap()),
        resolution_source: None,
        resolution_rules: Some(rules.to_string()),
        tick_size: dec!(0.01),
        min_order_size: dec!(1),
        fee_rate: dec!(0.02),
        url: String::new(),
        status: MarketStatus::Active,
        yes_bid: None,
        yes_ask: None,
        midpoint: None,
        spread: None,
        liquidity: None,
        last_fetched_at: None,
        fetch_latency_ms: 0,
    }
}

fn matcher_for(store: &Store) -> Matcher {
    let (_tx, rx) = watch::channel(false);
    Matcher::new(store.clone(), Metrics::new(), rx)
}

const RULES: &str =
    "Resolves YES if the Republican nominee wins the 2024 US presidential election.";

#[tokio::test]
async fn equivalent_pair_is_proposed() {
    let store = Store::in_memory().await.unwrap();
    store
        .upsert_market(&market(
            Venue::Kalshi,
            "K-1",
            "Will the Republican win the 2024 presidential election?",
            "politics",
            RULES,
        ))
        .await
        .unwrap();
    store
        .upsert_market(&market(
            Venue::Polymarket,
            "P-1",
            "Republican wins the 2024 presidential election?",
            "politics",
            RULES,
        ))
        .await
        .unwrap();

    let summary = matcher_for(&store).run_once().await.unwrap();
    assert_eq!(summary.pairs_considered, 1);
    assert_eq!(summary.proposals_written, 1);

    let m = store
        .get_match(Venue::Kalshi, "K-1", Venue::Polymarket, "P-1")
        .await
        .unwrap()
        .expect("proposal persisted");
    assert_eq!(m.status, MatchStatus::PendingReview);
    assert!(m.scores.overall >= MIN_OVERALL_SCORE);
    assert!(!m.matched_terms.is_empty());
    assert!(!m.match_reason.is_empty());

    // Weighted-sum property survives the store round trip.
    let recomputed = m.scores.recompute_overall();
    assert_eq!(recomputed.to_bits(), m.scores.overall.to_bits());
}

#[tokio::test]
async fn same_venue_pairs_are_never_scored() {
    let store = Store::in_memory().await.unwrap();
    store
        .upsert_market(&market(Venue::Kalshi, "K-1", "Will X happen?", "politics", RULES))
        .await
        .unwrap();
    store
        .upsert_market(&market(Venue::Kalshi, "K-2", "Will X happen?", "politics", RULES))
        .await
        .unwrap();

    let summary = matcher_for(&store).run_once().await.unwrap();
    assert_eq!(summary.pairs_considered, 0);
    assert_eq!(summary.proposals_written, 0);
}

/// S5: end dates more than 30 days apart are never scored.
#[tokio::test]
async fn s5_end_date_prefilter() {
    let store = Store::in_memory().await.unwrap();
    let mut a = market(
        Venue::Kalshi,
        "K-1",
        "Will the Republican win the 2024 presidential election?",
        "politics",
        RULES,
    );
    a.end_date = Some(Utc.with_ymd_and_hms(2024, 11, 5, 0, 0, 0).unwrap());
    let mut b = market(
        Venue::Polymarket,
        "P-1",
        "Republican wins the 2024 presidential election?",
        "politics",
        RULES,
    );
    b.end_date = Some(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());

    store.upsert_market(&a).await.unwrap();
    store.upsert_market(&b).await.unwrap();

    let summary = matcher_for(&store).run_once().await.unwrap();
    assert_eq!(summary.pairs_prefiltered, 1);
    assert_eq!(summary.proposals_written, 0);
    assert!(store
        .get_match(Venue::Kalshi, "K-1", Venue::Polymarket, "P-1")
        .await
        .unwrap()
        .is_none());
}

/// Property: re-running the matcher over unchanged markets yields
/// byte-identical scores.
#[tokio::test]
async fn matcher_is_idempotent() {
    let store = Store::in_memory().await.unwrap();
    store
        .upsert_market(&market(
            Venue::Kalshi,
            "K-1",
            "Will Bitcoin reach $100k by December 31, 2024?",
            "crypto",
            "Resolves YES if BTC trades at or above 100000 before the deadline.",
        ))
        .await
        .unwrap();
    store
        .upsert_market(&market(
            Venue::Polymarket,
            "P-1",
            "Bitcoin above $100k by December 31, 2024?",
            "crypto",
            "Resolves YES if BTC trades at or above 100000 before the deadline.",
        ))
        .await
        .unwrap();

    let matcher = matcher_for(&store);
    matcher.run_once().await.unwrap();
    let first = store
        .get_match(Venue::Kalshi, "K-1", Venue::Polymarket, "P-1")
        .await
        .unwrap()
        .expect("first run proposal");

    matcher.run_once().await.unwrap();
    let second = store
        .get_match(Venue::Kalshi, "K-1", Venue::Polymarket, "P-1")
        .await
        .unwrap()
        .expect("second run proposal");

    assert_eq!(
        first.scores.semantic.to_bits(),
        second.scores.semantic.to_bits()
    );
    assert_eq!(first.scores.date.to_bits(), second.scores.date.to_bits());
    assert_eq!(
        first.scores.category.to_bits(),
        second.scores.category.to_bits()
    );
    assert_eq!(
        first.scores.resolution.to_bits(),
        second.scores.resolution.to_bits()
    );
    assert_eq!(
        first.scores.overall.to_bits(),
        second.scores.overall.to_bits()
    );
    assert_eq!(first.match_reason, second.match_reason);
    // created_at is preserved by the upsert.
    assert_eq!(first.created_at, second.created_at);
}

/// The matcher never demotes a reviewed status; re-scoring a confirmed pair
/// keeps it confirmed.
#[tokio::test]
async fn rescoring_preserves_confirmed_status() {
    let store = Store::in_memory().await.unwrap();
    store
        .upsert_market(&market(
            Venue::Kalshi,
            "K-1",
            "Will the Republican win the 2024 presidential election?",
            "politics",
            RULES,
        ))
        .await
        .unwrap();
    store
        .upsert_market(&market(
            Venue::Polymarket,
            "P-1",
            "Republican wins the 2024 presidential election?",
            "politics",
            RULES,
        ))
        .await
        .unwrap();

    let matcher = matcher_for(&store);
    matcher.run_once().await.unwrap();

    // External reviewer confirms the proposal.
    store
        .set_match_status(
            Venue::Kalshi,
            "K-1",
            Venue::Polymarket,
            "P-1",
            MatchStatus::Confirmed,
        )
        .await
        .unwrap();

    matcher.run_once().await.unwrap();
    let m = store
        .get_match(Venue::Kalshi, "K-1", Venue::Polymarket, "P-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(m.status, MatchStatus::Confirmed);
}

/// A closed market drags its matches to STALE, and the matcher no longer
/// scores it.
#[tokio::test]
async fn closed_market_stales_matches() {
    let store = Store::in_memory().await.unwrap();
    store
        .upsert_market(&market(
            Venue::Kalshi,
            "K-1",
            "Will the Republican win the 2024 presidential election?",
            "politics",
            RULES,
        ))
        .await
        .unwrap();
    store
        .upsert_market(&market(
            Venue::Polymarket,
            "P-1",
            "Republican wins the 2024 presidential election?",
            "politics",
            RULES,
        ))
        .await
        .unwrap();

    let matcher = matcher_for(&store);
    matcher.run_once().await.unwrap();

    store
        .set_market_status(Venue::Kalshi, "K-1", MarketStatus::Closed)
        .await
        .unwrap();
    store.mark_matches_stale(Venue::Kalshi, "K-1").await.unwrap();

    let m = store
        .get_match(Venue::Kalshi, "K-1", Venue::Polymarket, "P-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(m.status, MatchStatus::Stale);

    // The closed market is out of the active set entirely.
    let summary = matcher.run_once().await.unwrap();
    assert_eq!(summary.pairs_considered, 0);

    // Updated-at moves with the stale transition.
    assert!(m.updated_at >= m.created_at - ChronoDuration::seconds(1));
}
