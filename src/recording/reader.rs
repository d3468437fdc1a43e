//! Reads a durable observation log back for analysis.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::models::{BASE_COLUMNS, FLAG_FALSE, FLAG_TRUE, TIMESTAMP_FORMAT};

/// One data row of the log, parsed back into typed fields
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedObservation {
    pub timestamp: DateTime<Utc>,
    pub market_id: String,
    pub market_name: String,
    pub yes_price: f64,
    pub no_price: f64,
    pub price_sum: f64,
    pub gap: f64,
    /// One flag per threshold column, in header order
    pub flags: Vec<bool>,
}

#[derive(Debug, Clone)]
pub struct ObservationLog {
    pub header: Vec<String>,
    pub rows: Vec<LoggedObservation>,
}

impl ObservationLog {
    /// Threshold column labels
    pub fn threshold_labels(&self) -> &[String] {
        &self.header[BASE_COLUMNS.len().min(self.header.len())..]
    }
}

pub fn read_observations(path: impl AsRef<Path>) -> Result<ObservationLog> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Failed to open observation log: {}", path.display()))?;

    let header: Vec<String> = reader
        .headers()
        .context("Failed to read header row")?
        .iter()
        .map(str::to_string)
        .collect();

    if header.len() < BASE_COLUMNS.len()
        || header[..BASE_COLUMNS.len()]
            .iter()
            .zip(BASE_COLUMNS)
            .any(|(a, b)| a != b)
    {
        bail!("{} is not an observation log (header {:?})", path.display(), header);
    }

    let mut rows = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Malformed row {}", i + 2))?;
        rows.push(parse_row(&record).with_context(|| format!("Invalid row {}", i + 2))?);
    }

    Ok(ObservationLog { header, rows })
}

fn parse_row(record: &csv::StringRecord) -> Result<LoggedObservation> {
    let field = |idx: usize| record.get(idx).unwrap_or_default();
    let number = |idx: usize| -> Result<f64> {
        field(idx)
            .parse::<f64>()
            .with_context(|| format!("column {} is not a number: {:?}", BASE_COLUMNS[idx], field(idx)))
    };

    let timestamp = NaiveDateTime::parse_from_str(field(0), TIMESTAMP_FORMAT)
        .with_context(|| format!("bad timestamp {:?}", field(0)))?
        .and_utc();

    let flags = record
        .iter()
        .skip(BASE_COLUMNS.len())
        .map(|value| match value {
            FLAG_TRUE => Ok(true),
            FLAG_FALSE => Ok(false),
            other => bail!("bad threshold flag {:?}", other),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(LoggedObservation {
        timestamp,
        market_id: field(1).to_string(),
        market_name: field(2).to_string(),
        yes_price: number(3)?,
        no_price: number(4)?,
        price_sum: number(5)?,
        gap: number(6)?,
        flags,
    })
}

/// Per-market frequency and size of mispricings
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSummary {
    pub market_id: String,
    pub market_name: String,
    pub observations: u64,
    /// Breach count per threshold column
    pub breaches: Vec<u64>,
    pub max_gap: f64,
    pub mean_gap: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Summaries ordered by market id
pub fn summarize(log: &ObservationLog) -> Vec<MarketSummary> {
    let columns = log.threshold_labels().len();
    let mut by_market: BTreeMap<&str, MarketSummary> = BTreeMap::new();

    for row in &log.rows {
        let entry = by_market
            .entry(row.market_id.as_str())
            .or_insert_with(|| MarketSummary {
                market_id: row.market_id.clone(),
                market_name: row.market_name.clone(),
                observations: 0,
                breaches: vec![0; columns],
                max_gap: f64::NEG_INFINITY,
                mean_gap: 0.0,
                first_seen: row.timestamp,
                last_seen: row.timestamp,
            });

        entry.observations += 1;
        // Incremental mean
        entry.mean_gap += (row.gap - entry.mean_gap) / entry.observations as f64;
        entry.max_gap = entry.max_gap.max(row.gap);
        entry.first_seen = entry.first_seen.min(row.timestamp);
        entry.last_seen = entry.last_seen.max(row.timestamp);
        for (count, below) in entry.breaches.iter_mut().zip(&row.flags) {
            if *below {
                *count += 1;
            }
        }
    }

    by_market.into_values().collect()
}
