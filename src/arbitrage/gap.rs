//! Gap Evaluator
//!
//! Pure computation of sum, gap-from-parity and threshold flags for one
//! price pair. Thresholds are compared against the raw sum; only the stored
//! presentation values are rounded to 4 decimals.

use chrono::{DateTime, Utc};

use crate::models::{Market, ObservationRecord, PricePair, ThresholdFlag, ThresholdSet};

/// Resolution price of a complete YES + NO set
pub const PARITY: f64 = 1.00;

/// Round half away from zero to 4 decimals, normalising negative zero
pub fn round4(value: f64) -> f64 {
    let rounded = (value * 10_000.0).round() / 10_000.0;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Build the observation record for one market at one instant
pub fn evaluate(
    pair: PricePair,
    thresholds: &ThresholdSet,
    market: &Market,
    timestamp: DateTime<Utc>,
) -> ObservationRecord {
    let raw_sum = pair.sum();

    let flags = thresholds
        .levels()
        .iter()
        .map(|level| ThresholdFlag {
            name: level.name.clone(),
            ceiling: level.ceiling,
            below: raw_sum < level.ceiling,
        })
        .collect();

    ObservationRecord {
        timestamp,
        market_id: market.id.clone(),
        market_name: market.name.clone(),
        yes_price: round4(pair.yes_price),
        no_price: round4(pair.no_price),
        price_sum: round4(raw_sum),
        gap: round4(PARITY - raw_sum),
        flags,
    }
}
