//! Static per-venue fee schedules.
//!
//! Every venue carries a taker/maker/win/withdrawal schedule. Defaults are
//! conservative allowances rather than the venues' marketing numbers, so the
//! detector never under-counts cost when a venue's published fee metadata is
//! unavailable. Overridable per venue via `<VENUE>_TAKER_FEE`.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::Venue;

/// Fee schedule for one venue, all rates as fractions of notional.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub taker_fee: Decimal,
    pub maker_fee: Decimal,
    /// Fee charged on the winning side at settlement, where applicable.
    pub win_fee: Decimal,
    pub withdrawal_fee: Decimal,
}

impl FeeSchedule {
    /// Per-share taker fee for a fill at `price`.
    pub fn taker_fee_per_share(&self, price: Decimal) -> Decimal {
        price * self.taker_fee
    }
}

/// Fee table covering every supported venue.
#[derive(Debug, Clone)]
pub struct FeeTable {
    kalshi: FeeSchedule,
    polymarket: FeeSchedule,
}

impl Default for FeeTable {
    fn default() -> Self {
        Self {
            // Conservative allowance; Kalshi's effective taker cost varies
            // with price but stays under 2% of notional on the 0.01 grid.
            kalshi: FeeSchedule {
                taker_fee: dec!(0.02),
                maker_fee: dec!(0.00),
                win_fee: dec!(0.00),
                withdrawal_fee: dec!(0.00),
            },
            // Polymarket headline taker fee is zero; 1% covers gas/relayer
            // overhead so detection never assumes a free leg.
            polymarket: FeeSchedule {
                taker_fee: dec!(0.01),
                maker_fee: dec!(0.00),
                win_fee: dec!(0.02),
                withdrawal_fee: dec!(0.00),
            },
        }
    }
}

impl FeeTable {
    /// Build the table, applying `KALSHI_TAKER_FEE` / `POLYMARKET_TAKER_FEE`
    /// overrides when set. Invalid values warn and keep the default.
    pub fn from_env() -> Self {
        let mut table = Self::default();
        if let Some(fee) = parse_override("KALSHI_TAKER_FEE") {
            table.kalshi.taker_fee = fee;
        }
        if let Some(fee) = parse_override("POLYMARKET_TAKER_FEE") {
            table.polymarket.taker_fee = fee;
        }
        table
    }

    pub fn schedule(&self, venue: Venue) -> &FeeSchedule {
        match venue {
            Venue::Kalshi => &self.kalshi,
            Venue::Polymarket => &self.polymarket,
        }
    }

    pub fn taker(&self, venue: Venue) -> Decimal {
        self.schedule(venue).taker_fee
    }
}

fn parse_override(key: &str) -> Option<Decimal> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<Decimal>() {
        Ok(fee) if fee >= Decimal::ZERO && fee < Decimal::ONE => Some(fee),
        Ok(fee) => {
            warn!("Invalid {}={} (must be in [0, 1)), using default", key, fee);
            None
        }
        Err(_) => {
            warn!("Failed to parse {}='{}', using default", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_taker_rates() {
        let table = FeeTable::default();
        assert_eq!(table.taker(Venue::Kalshi), dec!(0.02));
        assert_eq!(table.taker(Venue::Polymarket), dec!(0.01));
    }

    #[test]
    fn per_share_fee_scales_with_price() {
        let table = FeeTable::default();
        let fee = table
            .schedule(Venue::Kalshi)
            .taker_fee_per_share(dec!(0.40));
        assert_eq!(fee, dec!(0.008));
    }
}
