//! Cross-venue market matcher.
//!
//! On its own cadence, reads every ACTIVE market, scores every unordered
//! cross-venue pair (after a hard end-date prefilter), and upserts proposals
//! whose overall score clears the threshold. Scoring is pure and
//! deterministic: re-running the matcher over unchanged markets produces
//! byte-identical scores.

pub mod dates;
pub mod text;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::store::Store;
use crate::types::{Market, MarketMatch, MatchScores, MatchStatus};

use text::IdfModel;

/// Proposals below this overall score are not persisted.
pub const MIN_OVERALL_SCORE: f64 = 0.65;
/// Pairs whose end dates differ by more than this never get scored.
pub const MAX_END_DATE_DIFF_DAYS: i64 = 30;
/// Matched stems quoted in the reason string.
const MAX_REASON_TERMS: usize = 5;

/// Negation/exclusion/modal terms whose count should agree between the two
/// resolution texts.
const DANGER_TERMS: &[&str] = &["not", "except", "only", "void", "cancel", "must", "exclude"];

const CATEGORY_CLUSTERS: &[(&str, &[&str])] = &[
    (
        "politics",
        &[
            "politics", "political", "us-politics", "election", "elections", "geopolitics",
            "world", "government",
        ],
    ),
    (
        "crypto",
        &[
            "crypto", "cryptocurrency", "bitcoin", "ethereum", "digital-assets", "web3",
        ],
    ),
    (
        "sports",
        &[
            "sports", "sport", "nfl", "nba", "mlb", "nhl", "soccer", "football", "basketball",
            "baseball", "hockey", "epl",
        ],
    ),
    (
        "economy",
        &[
            "economics", "economy", "macro", "finance", "financials", "fed", "rates",
            "inflation", "business",
        ],
    ),
    (
        "entertainment",
        &[
            "entertainment", "culture", "movies", "music", "awards", "tv", "celebrity",
        ],
    ),
];

/// Result of scoring one candidate pair.
#[derive(Debug, Clone)]
pub struct PairScore {
    pub scores: MatchScores,
    pub matched_terms: Vec<String>,
    pub resolution_diff: Option<String>,
    pub match_reason: String,
}

/// Outcome counts of one matcher pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchRunSummary {
    pub pairs_considered: u64,
    pub pairs_prefiltered: u64,
    pub proposals_written: u64,
}

pub struct Matcher {
    store: Store,
    metrics: Metrics,
    shutdown: watch::Receiver<bool>,
}

impl Matcher {
    pub fn new(store: Store, metrics: Metrics, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            store,
            metrics,
            shutdown,
        }
    }

    /// Run the matcher on a fixed cadence until shutdown.
    pub fn spawn(self, interval_ms: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            let mut shutdown = self.shutdown.clone();
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.run_once().await {
                            Ok(summary) => debug!(
                                considered = summary.pairs_considered,
                                prefiltered = summary.pairs_prefiltered,
                                proposed = summary.proposals_written,
                                "matcher pass complete"
                            ),
                            Err(e) => warn!(error = %e, "matcher pass failed"),
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

    /// One full pass over all ACTIVE cross-venue pairs.
    pub async fn run_once(&self) -> Result<MatchRunSummary> {
        let markets = self.store.active_markets().await?;
        let tokens: Vec<Vec<String>> = markets
            .iter()
            .map(|m| text::tokenize(&m.question))
            .collect();
        let idf = IdfModel::build(&tokens);

        let mut summary = MatchRunSummary::default();

        'outer: for i in 0..markets.len() {
            for j in (i + 1)..markets.len() {
                // Interruptible between pairs.
                if *self.shutdown.borrow() {
                    break 'outer;
                }

                let (a, b) = (&markets[i], &markets[j]);
                if a.venue == b.venue {
                    continue;
                }
                summary.pairs_considered += 1;

                if prefiltered_by_end_date(a, b) {
                    summary.pairs_prefiltered += 1;
                    self.metrics.pairs_prefiltered.inc();
                    continue;
                }

                let scored = score_pair(&idf, a, &tokens[i], b, &tokens[j]);
                if scored.scores.overall < MIN_OVERALL_SCORE {
                    continue;
                }

                // Stable direction: order the pair by (venue tag, id).
                let (source, target) = if (a.venue.as_str(), a.external_id.as_str())
                    <= (b.venue.as_str(), b.external_id.as_str())
                {
                    (a, b)
                } else {
                    (b, a)
                };

                let now = Utc::now();
                let proposal = MarketMatch {
                    source_venue: source.venue,
                    source_id: source.external_id.clone(),
                    target_venue: target.venue,
                    target_id: target.external_id.clone(),
                    scores: scored.scores,
                    matched_terms: scored.matched_terms,
                    resolution_diff: scored.resolution_diff,
                    match_reason: scored.match_reason,
                    status: MatchStatus::PendingReview,
                    created_at: now,
                    updated_at: now,
                };
                self.store.upsert_match(&proposal).await?;
                summary.proposals_written += 1;
                self.metrics.matches_proposed.inc();
                info!(
                    source = %format!("{}:{}", proposal.source_venue, proposal.source_id),
                    target = %format!("{}:{}", proposal.target_venue, proposal.target_id),
                    overall = proposal.scores.overall,
                    "match proposed"
                );
            }
        }

        Ok(summary)
    }
}

/// Hard prefilter: both end dates known and more than 30 days apart.
pub fn prefiltered_by_end_date(a: &Market, b: &Market) -> bool {
    match (a.end_date, b.end_date) {
        (Some(da), Some(db)) => (da - db).num_days().abs() > MAX_END_DATE_DIFF_DAYS,
        _ => false,
    }
}

/// Score one cross-venue pair. Pure; symmetric in its arguments.
pub fn score_pair(
    idf: &IdfModel,
    a: &Market,
    a_tokens: &[String],
    b: &Market,
    b_tokens: &[String],
) -> PairScore {
    let semantic = text::semantic_score(idf, a_tokens, b_tokens);

    let a_dates = dates::extract_date_artifacts(&a.question);
    let b_dates = dates::extract_date_artifacts(&b.question);
    let date = dates::date_score(&a_dates, &b_dates);

    let category = category_score(a.category.as_deref(), b.category.as_deref());
    let (resolution, resolution_diff) =
        resolution_score(a.resolution_rules.as_deref(), b.resolution_rules.as_deref());

    let scores = MatchScores::from_parts(semantic, date, category, resolution);

    let mut matched_terms = text::shared_terms(a_tokens, b_tokens);
    matched_terms.truncate(MAX_REASON_TERMS);

    let match_reason = build_reason(&scores, &matched_terms, resolution_diff.as_deref());

    PairScore {
        scores,
        matched_terms,
        resolution_diff,
        match_reason,
    }
}

/// Category sub-score: exact 1.0, same cluster 0.8, unknown 0.5, else 0.3.
pub fn category_score(a: Option<&str>, b: Option<&str>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return 0.5;
    };
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return 0.5;
    }
    if a == b {
        return 1.0;
    }

    let cluster_of = |cat: &str| {
        CATEGORY_CLUSTERS
            .iter()
            .find(|(_, members)| members.contains(&cat))
            .map(|(name, _)| *name)
    };
    match (cluster_of(&a), cluster_of(&b)) {
        (Some(ca), Some(cb)) if ca == cb => 0.8,
        (None, _) | (_, None) => 0.5,
        _ => 0.3,
    }
}

/// Resolution sub-score over the rule texts, with divergence warnings.
pub fn resolution_score(a: Option<&str>, b: Option<&str>) -> (f64, Option<String>) {
    let (Some(a), Some(b)) = (a, b) else {
        return (
            0.4,
            Some("resolution rules missing on one side".to_string()),
        );
    };

    let a_tokens = text::tokenize(a);
    let b_tokens = text::tokenize(b);
    let shared = text::shared_terms(&a_tokens, &b_tokens);
    let a_unique: std::collections::BTreeSet<&str> =
        a_tokens.iter().map(|s| s.as_str()).collect();
    let b_unique: std::collections::BTreeSet<&str> =
        b_tokens.iter().map(|s| s.as_str()).collect();
    let denominator = a_unique.len().max(b_unique.len());
    let overlap_ratio = if denominator == 0 {
        0.0
    } else {
        shared.len() as f64 / denominator as f64
    };
    let score = overlap_ratio.max(0.2);

    let danger_count = |t: &str| {
        t.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| DANGER_TERMS.contains(word))
            .count()
    };
    let (da, db) = (danger_count(a), danger_count(b));
    let warning = if da != db {
        Some(format!(
            "negation/exclusion term counts differ ({} vs {})",
            da, db
        ))
    } else {
        None
    };

    (score, warning)
}

/// Boilerplate reason string keyed on sub-score bands.
fn build_reason(
    scores: &MatchScores,
    matched_terms: &[String],
    resolution_diff: Option<&str>,
) -> String {
    let mut clauses: Vec<String> = Vec::with_capacity(5);

    clauses.push(
        if scores.semantic >= 0.85 {
            "near-identical question wording"
        } else if scores.semantic >= 0.65 {
            "strong question overlap"
        } else if scores.semantic >= 0.45 {
            "moderate question overlap"
        } else {
            "weak question overlap"
        }
        .to_string(),
    );

    clauses.push(
        if scores.date >= 0.8 {
            "date references align"
        } else if scores.date > 0.5 {
            "partial date overlap"
        } else if scores.date >= 0.45 {
            "no explicit dates on either side"
        } else if scores.date >= 0.25 {
            "dates present on only one side"
        } else {
            "date references disagree"
        }
        .to_string(),
    );

    clauses.push(
        if scores.category >= 1.0 {
            "same category"
        } else if scores.category >= 0.75 {
            "related categories"
        } else if scores.category >= 0.45 {
            "category unknown on a side"
        } else {
            "different categories"
        }
        .to_string(),
    );

    match resolution_diff {
        Some(diff) => clauses.push(format!("resolution warning: {}", diff)),
        None => clauses.push(
            if scores.resolution >= 0.6 {
                "resolution criteria largely agree"
            } else {
                "limited resolution-rule overlap"
            }
            .to_string(),
        ),
    }

    if !matched_terms.is_empty() {
        clauses.push(format!("shared terms: {}", matched_terms.join(", ")));
    }

    clauses.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use crate::types::{MarketStatus, Venue};

    fn market(venue: Venue, id: &str, question: &str, end_day: Option<u32>) -> Market {
        Market {
            venue,
            external_id: id.to_string(),
            question: question.to_string(),
            description: None,
            category: Some("politics".into()),
            outcomes: vec!["YES".into(), "NO".into()],
            end_date: end_day
                .map(|d| chrono::Utc.with_ymd_and_hms(2024, 11, d, 0, 0, 0).unwrap()),
            resolution_source: None,
            resolution_rules: Some(
                "Resolves YES if the Republican nominee wins the 2024 presidential election."
                    .into(),
            ),
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

    #[test]
    fn prefilter_on_far_end_dates() {
        let a = market(Venue::Kalshi, "a", "q", Some(5));
        let mut b = market(Venue::Polymarket, "b", "q", None);
        b.end_date = Some(chrono::Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
        assert!(prefiltered_by_end_date(&a, &b));

        let c = market(Venue::Polymarket, "c", "q", Some(20));
        assert!(!prefiltered_by_end_date(&a, &c));

        // Missing end date on one side never prefilters.
        let d = market(Venue::Polymarket, "d", "q", None);
        assert!(!prefiltered_by_end_date(&a, &d));
    }

    #[test]
    fn category_bands() {
        assert_eq!(category_score(Some("Politics"), Some("politics")), 1.0);
        assert_eq!(category_score(Some("elections"), Some("geopolitics")), 0.8);
        assert_eq!(category_score(None, Some("politics")), 0.5);
        assert_eq!(category_score(Some("quantum"), Some("politics")), 0.5);
        assert_eq!(category_score(Some("nba"), Some("bitcoin")), 0.3);
    }

    #[test]
    fn resolution_missing_side_forces_score() {
        let (score, warning) = resolution_score(Some("some rules"), None);
        assert_eq!(score, 0.4);
        assert!(warning.is_some());
    }

    #[test]
    fn resolution_floor_applies() {
        let (score, _) = resolution_score(
            Some("Resolves YES if the sky is green."),
            Some("Settlement follows official exchange data."),
        );
        assert!(score >= 0.2);
    }

    #[test]
    fn resolution_danger_terms_warn() {
        let (_, warning) = resolution_score(
            Some("Resolves YES unless cancelled; must not include postponed games."),
            Some("Resolves YES based on the final score."),
        );
        assert!(warning.is_some());
        assert!(warning.unwrap().contains("differ"));
    }

    #[test]
    fn score_pair_high_for_equivalent_markets() {
        let a = market(
            Venue::Kalshi,
            "K-1",
            "Will the Republican win the 2024 presidential election?",
            Some(5),
        );
        let b = market(
            Venue::Polymarket,
            "P-1",
            "Republican wins 2024 presidential election?",
            Some(6),
        );
        let ta = text::tokenize(&a.question);
        let tb = text::tokenize(&b.question);
        let idf = IdfModel::build([&ta, &tb]);

        let scored = score_pair(&idf, &a, &ta, &b, &tb);
        assert!(
            scored.scores.overall >= MIN_OVERALL_SCORE,
            "overall {} below threshold",
            scored.scores.overall
        );
        assert!(!scored.matched_terms.is_empty());
        assert!(scored.matched_terms.len() <= MAX_REASON_TERMS);
        assert!(scored.match_reason.contains("shared terms"));

        // Property: overall equals the documented weighted sum.
        let expected = 0.45 * scored.scores.semantic
            + 0.20 * scored.scores.date
            + 0.10 * scored.scores.category
            + 0.25 * scored.scores.resolution;
        assert!((scored.scores.overall - expected).abs() < 1e-12);
    }

    #[test]
    fn score_pair_is_symmetric_and_deterministic() {
        let a = market(Venue::Kalshi, "K-1", "Will Bitcoin reach $100k in 2024?", Some(5));
        let b = market(Venue::Polymarket, "P-1", "Bitcoin to hit 100k by end of 2024", Some(6));
        let ta = text::tokenize(&a.question);
        let tb = text::tokenize(&b.question);
        let idf = IdfModel::build([&ta, &tb]);

        let forward = score_pair(&idf, &a, &ta, &b, &tb);
        let reverse = score_pair(&idf, &b, &tb, &a, &ta);
        assert_eq!(
            forward.scores.overall.to_bits(),
            reverse.scores.overall.to_bits()
        );

        let again = score_pair(&idf, &a, &ta, &b, &tb);
        assert_eq!(
            forward.scores.overall.to_bits(),
            again.scores.overall.to_bits()
        );
    }
}
