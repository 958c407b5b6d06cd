//! SQLite persistence for the entities the core owns.
//!
//! The store never sits on the detector's hot path; it holds the durable
//! market registry, the rolling price-snapshot trail, match proposals and
//! append-only opportunities. Writers converge through upsert-by-natural-key
//! (`(venue, external_id)` for markets, the pair key for matches), so no
//! application-level locking is needed.
//!
//! Decimals are stored as TEXT to stay exact; timestamps as RFC 3339 TEXT.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

use crate::types::{
    ArbitrageOpportunity, Market, MarketMatch, MarketStatus, MatchScores, MatchStatus,
    OpportunityStatus, Venue,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS markets (
    venue TEXT NOT NULL,
    external_id TEXT NOT NULL,
    question TEXT NOT NULL,
    description TEXT,
    category TEXT,
    outcomes TEXT NOT NULL,
    end_date TEXT,
    resolution_source TEXT,
    resolution_rules TEXT,
    tick_size TEXT NOT NULL,
    min_order_size TEXT NOT NULL,
    fee_rate TEXT NOT NULL,
    url TEXT NOT NULL,
    status TEXT NOT NULL,
    yes_bid TEXT,
    yes_ask TEXT,
    midpoint TEXT,
    spread TEXT,
    liquidity TEXT,
    last_fetched_at TEXT,
    fetch_latency_ms INTEGER NOT NULL DEFAULT 0,
    missed_syncs INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (venue, external_id)
);

CREATE TABLE IF NOT EXISTS price_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    venue TEXT NOT NULL,
    external_id TEXT NOT NULL,
    best_bid TEXT,
    best_ask TEXT,
    midpoint TEXT,
    captured_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_market
    ON price_snapshots (venue, external_id, id);

CREATE TABLE IF NOT EXISTS market_matches (
    source_venue TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_venue TEXT NOT NULL,
    target_id TEXT NOT NULL,
    semantic_score REAL NOT NULL,
    date_score REAL NOT NULL,
    category_score REAL NOT NULL,
    resolution_score REAL NOT NULL,
    overall_score REAL NOT NULL,
    matched_terms TEXT NOT NULL,
    resolution_diff TEXT,
    match_reason TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (source_venue, source_id, target_venue, target_id)
);

CREATE TABLE IF NOT EXISTS opportunities (
    id TEXT PRIMARY KEY,
    source_venue TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_venue TEXT NOT NULL,
    target_id TEXT NOT NULL,
    strategy TEXT NOT NULL,
    profit TEXT NOT NULL,
    confidence TEXT NOT NULL,
    plan TEXT NOT NULL,
    status TEXT NOT NULL,
    net_profit TEXT NOT NULL,
    detected_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_opportunities_status
    ON opportunities (status, detected_at);
"#;

/// Handle to the SQLite-backed store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        // SQLite in-memory databases are per-connection; a single connection
        // keeps them coherent and is plenty for a file DB off the hot path.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .with_context(|| format!("failed to open database {}", database_url))?;

        let store = Self { pool };
        store.migrate().await?;
        info!(database_url, "store ready");
        Ok(store)
    }

    /// Fresh in-memory store, for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to run schema migration")?;
        Ok(())
    }

    // === markets ===

    /// Insert or update a market by its natural key. A market seen by a sync
    /// has, by definition, not been missing from it.
    pub async fn upsert_market(&self, market: &Market) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO markets (
                venue, external_id, question, description, category, outcomes,
                end_date, resolution_source, resolution_rules, tick_size,
                min_order_size, fee_rate, url, status, yes_bid, yes_ask,
                midpoint, spread, liquidity, last_fetched_at, fetch_latency_ms,
                missed_syncs
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT (venue, external_id) DO UPDATE SET
                question = excluded.question,
                description = excluded.description,
                category = excluded.category,
                outcomes = excluded.outcomes,
                end_date = excluded.end_date,
                resolution_source = excluded.resolution_source,
                resolution_rules = excluded.resolution_rules,
                tick_size = excluded.tick_size,
                min_order_size = excluded.min_order_size,
                fee_rate = excluded.fee_rate,
                url = excluded.url,
                status = excluded.status,
                yes_bid = excluded.yes_bid,
                yes_ask = excluded.yes_ask,
                midpoint = excluded.midpoint,
                spread = excluded.spread,
                liquidity = excluded.liquidity,
                last_fetched_at = excluded.last_fetched_at,
                fetch_latency_ms = excluded.fetch_latency_ms,
                missed_syncs = 0
            "#,
        )
        .bind(market.venue.as_str())
        .bind(&market.external_id)
        .bind(&market.question)
        .bind(&market.description)
        .bind(&market.category)
        .bind(serde_json::to_string(&market.outcomes)?)
        .bind(market.end_date.map(|d| d.to_rfc3339()))
        .bind(&market.resolution_source)
        .bind(&market.resolution_rules)
        .bind(market.tick_size.to_string())
        .bind(market.min_order_size.to_string())
        .bind(market.fee_rate.to_string())
        .bind(&market.url)
        .bind(market.status.as_str())
        .bind(market.yes_bid.map(|d| d.to_string()))
        .bind(market.yes_ask.map(|d| d.to_string()))
        .bind(market.midpoint.map(|d| d.to_string()))
        .bind(market.spread.map(|d| d.to_string()))
        .bind(market.liquidity.map(|d| d.to_string()))
        .bind(market.last_fetched_at.map(|d| d.to_rfc3339()))
        .bind(market.fetch_latency_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh the denormalized top-of-book columns after an orderbook or
    /// quote update.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_market_quote(
        &self,
        venue: Venue,
        external_id: &str,
        yes_bid: Option<Decimal>,
        yes_ask: Option<Decimal>,
        midpoint: Option<Decimal>,
        spread: Option<Decimal>,
        fetched_at: DateTime<Utc>,
        latency_ms: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE markets SET
                yes_bid = ?, yes_ask = ?, midpoint = ?, spread = ?,
                last_fetched_at = ?, fetch_latency_ms = ?
            WHERE venue = ? AND external_id = ?
            "#,
        )
        .bind(yes_bid.map(|d| d.to_string()))
        .bind(yes_ask.map(|d| d.to_string()))
        .bind(midpoint.map(|d| d.to_string()))
        .bind(spread.map(|d| d.to_string()))
        .bind(fetched_at.to_rfc3339())
        .bind(latency_ms as i64)
        .bind(venue.as_str())
        .bind(external_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_market_status(
        &self,
        venue: Venue,
        external_id: &str,
        status: MarketStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE markets SET status = ? WHERE venue = ? AND external_id = ?")
            .bind(status.as_str())
            .bind(venue.as_str())
            .bind(external_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Increment the missed-full-sync counter, returning the new count.
    pub async fn record_missed_sync(&self, venue: Venue, external_id: &str) -> Result<u32> {
        sqlx::query(
            "UPDATE markets SET missed_syncs = missed_syncs + 1 \
             WHERE venue = ? AND external_id = ?",
        )
        .bind(venue.as_str())
        .bind(external_id)
        .execute(&self.pool)
        .await?;

        let row =
            sqlx::query("SELECT missed_syncs FROM markets WHERE venue = ? AND external_id = ?")
                .bind(venue.as_str())
                .bind(external_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.get::<i64, _>("missed_syncs") as u32)
    }

    pub async fn active_markets(&self) -> Result<Vec<Market>> {
        let rows = sqlx::query("SELECT * FROM markets WHERE status = 'ACTIVE'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(market_from_row).collect()
    }

    pub async fn active_market_ids(&self, venue: Venue) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT external_id FROM markets WHERE venue = ? AND status = 'ACTIVE'")
                .bind(venue.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(|r| r.get("external_id")).collect())
    }

    pub async fn get_market(&self, venue: Venue, external_id: &str) -> Result<Option<Market>> {
        let row = sqlx::query("SELECT * FROM markets WHERE venue = ? AND external_id = ?")
            .bind(venue.as_str())
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(market_from_row).transpose()
    }

    // === price snapshots ===

    /// Append one snapshot row and trim the trail to the most recent
    /// `trail_len` rows for this market.
    pub async fn append_price_snapshot(
        &self,
        venue: Venue,
        external_id: &str,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
        midpoint: Option<Decimal>,
        captured_at: DateTime<Utc>,
        trail_len: u32,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO price_snapshots (venue, external_id, best_bid, best_ask, midpoint, captured_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(venue.as_str())
        .bind(external_id)
        .bind(best_bid.map(|d| d.to_string()))
        .bind(best_ask.map(|d| d.to_string()))
        .bind(midpoint.map(|d| d.to_string()))
        .bind(captured_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM price_snapshots
            WHERE venue = ? AND external_id = ? AND id NOT IN (
                SELECT id FROM price_snapshots
                WHERE venue = ? AND external_id = ?
                ORDER BY id DESC LIMIT ?
            )
            "#,
        )
        .bind(venue.as_str())
        .bind(external_id)
        .bind(venue.as_str())
        .bind(external_id)
        .bind(trail_len as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn snapshot_count(&self, venue: Venue, external_id: &str) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM price_snapshots WHERE venue = ? AND external_id = ?",
        )
        .bind(venue.as_str())
        .bind(external_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as u32)
    }

    // === market matches ===

    /// Upsert a match proposal by its pair key. Scores, terms and reason
    /// update in place; `status` and `created_at` are never touched by the
    /// matcher (status transitions belong to the review collaborator).
    pub async fn upsert_match(&self, m: &MarketMatch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO market_matches (
                source_venue, source_id, target_venue, target_id,
                semantic_score, date_score, category_score, resolution_score,
                overall_score, matched_terms, resolution_diff, match_reason,
                status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (source_venue, source_id, target_venue, target_id) DO UPDATE SET
                semantic_score = excluded.semantic_score,
                date_score = excluded.date_score,
                category_score = excluded.category_score,
                resolution_score = excluded.resolution_score,
                overall_score = excluded.overall_score,
                matched_terms = excluded.matched_terms,
                resolution_diff = excluded.resolution_diff,
                match_reason = excluded.match_reason,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(m.source_venue.as_str())
        .bind(&m.source_id)
        .bind(m.target_venue.as_str())
        .bind(&m.target_id)
        .bind(m.scores.semantic)
        .bind(m.scores.date)
        .bind(m.scores.category)
        .bind(m.scores.resolution)
        .bind(m.scores.overall)
        .bind(serde_json::to_string(&m.matched_terms)?)
        .bind(&m.resolution_diff)
        .bind(&m.match_reason)
        .bind(m.status.as_str())
        .bind(m.created_at.to_rfc3339())
        .bind(m.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_match_status(
        &self,
        source_venue: Venue,
        source_id: &str,
        target_venue: Venue,
        target_id: &str,
        status: MatchStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE market_matches SET status = ?, updated_at = ? \
             WHERE source_venue = ? AND source_id = ? AND target_venue = ? AND target_id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(source_venue.as_str())
        .bind(source_id)
        .bind(target_venue.as_str())
        .bind(target_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark every non-rejected match touching this market as stale.
    pub async fn mark_matches_stale(&self, venue: Venue, external_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE market_matches SET status = 'STALE', updated_at = ?
            WHERE status IN ('PENDING_REVIEW', 'CONFIRMED')
              AND ((source_venue = ? AND source_id = ?)
                   OR (target_venue = ? AND target_id = ?))
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(venue.as_str())
        .bind(external_id)
        .bind(venue.as_str())
        .bind(external_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn confirmed_matches(&self) -> Result<Vec<MarketMatch>> {
        let rows = sqlx::query("SELECT * FROM market_matches WHERE status = 'CONFIRMED'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(match_from_row).collect()
    }

    pub async fn get_match(
        &self,
        source_venue: Venue,
        source_id: &str,
        target_venue: Venue,
        target_id: &str,
    ) -> Result<Option<MarketMatch>> {
        let row = sqlx::query(
            "SELECT * FROM market_matches \
             WHERE source_venue = ? AND source_id = ? AND target_venue = ? AND target_id = ?",
        )
        .bind(source_venue.as_str())
        .bind(source_id)
        .bind(target_venue.as_str())
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(match_from_row).transpose()
    }

    /// `(confirmed, pending_review)` counts for the status endpoint.
    pub async fn match_counts(&self) -> Result<(u64, u64)> {
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN status = 'CONFIRMED' THEN 1 ELSE 0 END) AS confirmed,
                SUM(CASE WHEN status = 'PENDING_REVIEW' THEN 1 ELSE 0 END) AS pending
            FROM market_matches
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let confirmed: Option<i64> = row.get("confirmed");
        let pending: Option<i64> = row.get("pending");
        Ok((
            confirmed.unwrap_or(0) as u64,
            pending.unwrap_or(0) as u64,
        ))
    }

    // === opportunities ===

    pub async fn insert_opportunity(&self, opp: &ArbitrageOpportunity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO opportunities (
                id, source_venue, source_id, target_venue, target_id,
                strategy, profit, confidence, plan, status, net_profit,
                detected_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(opp.id.to_string())
        .bind(opp.source_venue.as_str())
        .bind(&opp.source_id)
        .bind(opp.target_venue.as_str())
        .bind(&opp.target_id)
        .bind(serde_json::to_string(&opp.strategy)?)
        .bind(serde_json::to_string(&opp.profit)?)
        .bind(serde_json::to_string(&opp.confidence)?)
        .bind(serde_json::to_string(&opp.plan)?)
        .bind(opp.status.as_str())
        .bind(opp.profit.net_profit.to_string())
        .bind(opp.detected_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn active_opportunities(&self, limit: u32) -> Result<Vec<ArbitrageOpportunity>> {
        let rows = sqlx::query(
            "SELECT * FROM opportunities WHERE status = 'ACTIVE' \
             ORDER BY detected_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(opportunity_from_row).collect()
    }

    pub async fn count_active_opportunities(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM opportunities WHERE status = 'ACTIVE'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Expire active opportunities older than `cutoff`.
    pub async fn expire_opportunities_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE opportunities SET status = 'EXPIRED' \
             WHERE status = 'ACTIVE' AND detected_at < ?",
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// === row mapping ===

fn parse_decimal_opt(raw: Option<String>) -> Result<Option<Decimal>> {
    raw.map(|s| s.parse::<Decimal>().context("bad decimal column"))
        .transpose()
}

fn parse_datetime_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .context("bad timestamp column")
    })
    .transpose()
}

fn market_from_row(row: &SqliteRow) -> Result<Market> {
    let venue = Venue::from_str(row.get::<String, _>("venue").as_str())?;
    let status = MarketStatus::from_str(row.get::<String, _>("status").as_str())?;
    Ok(Market {
        venue,
        external_id: row.get("external_id"),
        question: row.get("question"),
        description: row.get("description"),
        category: row.get("category"),
        outcomes: serde_json::from_str(row.get::<String, _>("outcomes").as_str())?,
        end_date: parse_datetime_opt(row.get("end_date"))?,
        resolution_source: row.get("resolution_source"),
        resolution_rules: row.get("resolution_rules"),
        tick_size: row.get::<String, _>("tick_size").parse()?,
        min_order_size: row.get::<String, _>("min_order_size").parse()?,
        fee_rate: row.get::<String, _>("fee_rate").parse()?,
        url: row.get("url"),
        status,
        yes_bid: parse_decimal_opt(row.get("yes_bid"))?,
        yes_ask: parse_decimal_opt(row.get("yes_ask"))?,
        midpoint: parse_decimal_opt(row.get("midpoint"))?,
        spread: parse_decimal_opt(row.get("spread"))?,
        liquidity: parse_decimal_opt(row.get("liquidity"))?,
        last_fetched_at: parse_datetime_opt(row.get("last_fetched_at"))?,
        fetch_latency_ms: row.get::<i64, _>("fetch_latency_ms") as u64,
    })
}

fn match_from_row(row: &SqliteRow) -> Result<MarketMatch> {
    let scores = MatchScores {
        semantic: row.get("semantic_score"),
        date: row.get("date_score"),
        category: row.get("category_score"),
        resolution: row.get("resolution_score"),
        overall: row.get("overall_score"),
    };
    Ok(MarketMatch {
        source_venue: Venue::from_str(row.get::<String, _>("source_venue").as_str())?,
        source_id: row.get("source_id"),
        target_venue: Venue::from_str(row.get::<String, _>("target_venue").as_str())?,
        target_id: row.get("target_id"),
        scores,
        matched_terms: serde_json::from_str(row.get::<String, _>("matched_terms").as_str())?,
        resolution_diff: row.get("resolution_diff"),
        match_reason: row.get("match_reason"),
        status: MatchStatus::from_str(row.get::<String, _>("status").as_str())?,
        created_at: parse_datetime_opt(row.get("created_at"))?
            .context("created_at missing")?,
        updated_at: parse_datetime_opt(row.get("updated_at"))?
            .context("updated_at missing")?,
    })
}

fn opportunity_from_row(row: &SqliteRow) -> Result<ArbitrageOpportunity> {
    Ok(ArbitrageOpportunity {
        id: row.get::<String, _>("id").parse()?,
        source_venue: Venue::from_str(row.get::<String, _>("source_venue").as_str())?,
        source_id: row.get("source_id"),
        target_venue: Venue::from_str(row.get::<String, _>("target_venue").as_str())?,
        target_id: row.get("target_id"),
        strategy: serde_json::from_str(row.get::<String, _>("strategy").as_str())?,
        profit: serde_json::from_str(row.get::<String, _>("profit").as_str())?,
        confidence: serde_json::from_str(row.get::<String, _>("confidence").as_str())?,
        plan: serde_json::from_str(row.get::<String, _>("plan").as_str())?,
        status: OpportunityStatus::from_str(row.get::<String, _>("status").as_str())?,
        detected_at: parse_datetime_opt(row.get("detected_at"))?
            .context("detected_at missing")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn market(venue: Venue, id: &str, question: &str) -> Market {
        Market {
            venue,
            external_id: id.to_string(),
            question: question.to_string(),
            description: None,
            category: Some("politics".into()),
            outcomes: vec!["YES".into(), "NO".into()],
            end_date: Some(Utc.with_ymd_and_hms(2024, 11, 5, 0, 0, 0).unwrap()),
            resolution_source: None,
            resolution_rules: Some("Resolves YES if the event occurs.".into()),
            tick_size: dec!(0.01),
            min_order_size: dec!(1),
            fee_rate: dec!(0.02),
            url: format!("https://example.com/{}", id),
            status: MarketStatus::Active,
            yes_bid: Some(dec!(0.40)),
            yes_ask: Some(dec!(0.42)),
            midpoint: Some(dec!(0.41)),
            spread: Some(dec!(0.02)),
            liquidity: None,
            last_fetched_at: None,
            fetch_latency_ms: 0,
        }
    }

    fn sample_match(status: MatchStatus) -> MarketMatch {
        MarketMatch {
            source_venue: Venue::Kalshi,
            source_id: "K-1".into(),
            target_venue: Venue::Polymarket,
            target_id: "P-1".into(),
            scores: MatchScores::from_parts(0.9, 0.5, 1.0, 0.7),
            matched_terms: vec!["elect".into(), "2024".into()],
            resolution_diff: None,
            match_reason: "strong textual overlap".into(),
            status,
            created_at: Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn market_upsert_round_trip() {
        let store = Store::in_memory().await.unwrap();
        let m = market(Venue::Kalshi, "K-1", "Will X win the 2024 election?");
        store.upsert_market(&m).await.unwrap();

        // Second upsert updates in place.
        let mut updated = m.clone();
        updated.question = "Will X win the 2024 presidential election?".into();
        store.upsert_market(&updated).await.unwrap();

        let active = store.active_markets().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(
            active[0].question,
            "Will X win the 2024 presidential election?"
        );
        assert_eq!(active[0].yes_bid, Some(dec!(0.40)));
        assert_eq!(active[0].tick_size, dec!(0.01));
    }

    #[tokio::test]
    async fn file_backed_store_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("arb.db").display());

        let store = Store::connect(&url).await.unwrap();
        store
            .upsert_market(&market(Venue::Kalshi, "K-1", "q"))
            .await
            .unwrap();
        drop(store);

        let reopened = Store::connect(&url).await.unwrap();
        assert_eq!(reopened.active_markets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missed_sync_counter_and_close() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_market(&market(Venue::Kalshi, "K-1", "q"))
            .await
            .unwrap();

        assert_eq!(store.record_missed_sync(Venue::Kalshi, "K-1").await.unwrap(), 1);
        assert_eq!(store.record_missed_sync(Venue::Kalshi, "K-1").await.unwrap(), 2);

        // A fresh upsert resets the counter.
        store
            .upsert_market(&market(Venue::Kalshi, "K-1", "q"))
            .await
            .unwrap();
        assert_eq!(store.record_missed_sync(Venue::Kalshi, "K-1").await.unwrap(), 1);

        store
            .set_market_status(Venue::Kalshi, "K-1", MarketStatus::Closed)
            .await
            .unwrap();
        assert!(store.active_markets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_trail_is_trimmed() {
        let store = Store::in_memory().await.unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap();
        for i in 0..10 {
            store
                .append_price_snapshot(
                    Venue::Polymarket,
                    "P-1",
                    Some(dec!(0.40)),
                    Some(dec!(0.42)),
                    Some(dec!(0.41)),
                    t0 + chrono::Duration::seconds(i),
                    5,
                )
                .await
                .unwrap();
        }
        assert_eq!(store.snapshot_count(Venue::Polymarket, "P-1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn match_upsert_preserves_status() {
        let store = Store::in_memory().await.unwrap();
        let proposal = sample_match(MatchStatus::PendingReview);
        store.upsert_match(&proposal).await.unwrap();

        // External reviewer confirms.
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

        // Matcher re-runs with fresh scores; status must survive.
        let mut rescored = sample_match(MatchStatus::PendingReview);
        rescored.scores = MatchScores::from_parts(0.95, 0.5, 1.0, 0.7);
        store.upsert_match(&rescored).await.unwrap();

        let confirmed = store.confirmed_matches().await.unwrap();
        assert_eq!(confirmed.len(), 1);
        assert!((confirmed[0].scores.semantic - 0.95).abs() < 1e-12);

        let (n_confirmed, n_pending) = store.match_counts().await.unwrap();
        assert_eq!((n_confirmed, n_pending), (1, 0));
    }

    #[tokio::test]
    async fn stale_marking_touches_both_sides() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_match(&sample_match(MatchStatus::PendingReview))
            .await
            .unwrap();

        let affected = store.mark_matches_stale(Venue::Polymarket, "P-1").await.unwrap();
        assert_eq!(affected, 1);
        let m = store
            .get_match(Venue::Kalshi, "K-1", Venue::Polymarket, "P-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.status, MatchStatus::Stale);
    }

    #[tokio::test]
    async fn opportunity_round_trip() {
        use crate::types::{
            Confidence, OpportunityStatus, ProfitAnalysis, Strategy, StrategyAction,
        };
        let store = Store::in_memory().await.unwrap();
        let opp = ArbitrageOpportunity {
            id: uuid::Uuid::new_v4(),
            source_venue: Venue::Kalshi,
            source_id: "K-1".into(),
            target_venue: Venue::Polymarket,
            target_id: "P-1".into(),
            strategy: Strategy {
                action: StrategyAction::BuyYesSellYes,
                buy_venue: Venue::Kalshi,
                buy_market_id: "K-1".into(),
                buy_price: dec!(0.40),
                buy_size: dec!(500),
                sell_venue: Venue::Polymarket,
                sell_market_id: "P-1".into(),
                sell_price: dec!(0.46),
                sell_size: dec!(500),
            },
            profit: ProfitAnalysis {
                gross_spread: dec!(0.06),
                total_fees: dec!(0.0126),
                estimated_slippage: Decimal::ZERO,
                net_profit: dec!(23.70),
                roi: dec!(0.116),
                annualized_roi: dec!(1.21),
                max_executable_size: dec!(500),
            },
            confidence: Confidence {
                overall: 0.7566,
                freshness: 0.8333,
                liquidity: 0.5,
                match_quality: 0.9,
                source_data_age_ms: 500,
                target_data_age_ms: 500,
            },
            plan: vec![],
            status: OpportunityStatus::Active,
            detected_at: Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap(),
        };

        store.insert_opportunity(&opp).await.unwrap();
        assert_eq!(store.count_active_opportunities().await.unwrap(), 1);

        let read = store.active_opportunities(10).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].profit.net_profit, dec!(23.70));
        assert_eq!(read[0].strategy.action, StrategyAction::BuyYesSellYes);

        let expired = store
            .expire_opportunities_before(Utc.with_ymd_and_hms(2024, 10, 2, 0, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(expired, 1);
        assert_eq!(store.count_active_opportunities().await.unwrap(), 0);
    }
}
