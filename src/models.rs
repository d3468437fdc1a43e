//! Core data model
//! Markets, price pairs, threshold levels and the observation record that
//! every sink persists.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Timestamp format written to the durable log (UTC, second precision)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fixed columns preceding the per-threshold columns
pub const BASE_COLUMNS: [&str; 7] = [
    "Timestamp_UTC",
    "Market_ID",
    "Market_Name",
    "YES_Price",
    "NO_Price",
    "Sum",
    "Gap_From_One",
];

pub const FLAG_TRUE: &str = "YES";
pub const FLAG_FALSE: &str = "NO";

/// A monitored market. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    #[serde(alias = "display_name")]
    pub name: String,
    /// Opaque handle interpreted by the configured price fetcher
    #[serde(alias = "api_endpoint")]
    pub fetch_target: String,
}

/// Current YES/NO quote for one market
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePair {
    pub yes_price: f64,
    pub no_price: f64,
}

impl PricePair {
    pub fn new(yes_price: f64, no_price: f64) -> Self {
        Self {
            yes_price,
            no_price,
        }
    }

    /// Unrounded YES + NO
    pub fn sum(&self) -> f64 {
        self.yes_price + self.no_price
    }

    pub fn is_finite(&self) -> bool {
        self.yes_price.is_finite() && self.no_price.is_finite()
    }

    /// Both legs inside the [0, 1] probability range
    pub fn in_unit_range(&self) -> bool {
        (0.0..=1.0).contains(&self.yes_price) && (0.0..=1.0).contains(&self.no_price)
    }
}

/// A named price-sum ceiling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdLevel {
    pub name: String,
    pub ceiling: f64,
    /// Column header override; defaults to `Below_<ceiling>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ThresholdLevel {
    pub fn new(name: impl Into<String>, ceiling: f64) -> Self {
        Self {
            name: name.into(),
            ceiling,
            label: None,
        }
    }

    pub fn column_label(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => format!("Below_{:.2}", self.ceiling),
        }
    }
}

/// Ordered set of threshold levels. The first level is the primary one.
///
/// Levels are evaluated independently against the same sum; ordering only
/// determines column order and which level drives alerting.
///
/// In config files the set is either a `name -> ceiling` object, read in
/// document order, or a list of `{name, ceiling, label}` entries. It is
/// written back as an object unless a level carries a custom label.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSet(Vec<ThresholdLevel>);

impl ThresholdSet {
    pub fn new(levels: Vec<ThresholdLevel>) -> Self {
        Self(levels)
    }

    pub fn levels(&self) -> &[ThresholdLevel] {
        &self.0
    }

    pub fn primary(&self) -> Option<&ThresholdLevel> {
        self.0.first()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Full header row for the durable log and mirror
    pub fn header(&self) -> Vec<String> {
        BASE_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.0.iter().map(ThresholdLevel::column_label))
            .collect()
    }
}

impl Serialize for ThresholdSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.iter().any(|level| level.label.is_some()) {
            return serializer.collect_seq(&self.0);
        }
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for level in &self.0 {
            map.serialize_entry(&level.name, &level.ceiling)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ThresholdSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ThresholdSetVisitor)
    }
}

struct ThresholdSetVisitor;

impl<'de> Visitor<'de> for ThresholdSetVisitor {
    type Value = ThresholdSet;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of threshold name to ceiling, or a list of threshold levels")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        // Entries arrive in document order; the first one is primary
        let mut levels = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((name, ceiling)) = access.next_entry::<String, f64>()? {
            levels.push(ThresholdLevel::new(name, ceiling));
        }
        Ok(ThresholdSet(levels))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut levels = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some(level) = access.next_element::<ThresholdLevel>()? {
            levels.push(level);
        }
        Ok(ThresholdSet(levels))
    }
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self(vec![
            ThresholdLevel::new("primary", 1.00),
            ThresholdLevel::new("secondary", 0.95),
            ThresholdLevel::new("tertiary", 0.90),
        ])
    }
}

/// Outcome of comparing one observation against one level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdFlag {
    pub name: String,
    pub ceiling: f64,
    pub below: bool,
}

/// One persisted observation. Price fields hold 4-decimal presentation
/// values; `flags` were computed from the unrounded sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub timestamp: DateTime<Utc>,
    pub market_id: String,
    pub market_name: String,
    pub yes_price: f64,
    pub no_price: f64,
    pub price_sum: f64,
    pub gap: f64,
    pub flags: Vec<ThresholdFlag>,
}

impl ObservationRecord {
    pub fn primary_breached(&self) -> bool {
        self.flags.first().map(|f| f.below).unwrap_or(false)
    }

    /// Most severe breached level (lowest ceiling)
    pub fn severity(&self) -> Option<&ThresholdFlag> {
        self.flags
            .iter()
            .filter(|f| f.below)
            .min_by(|a, b| a.ceiling.total_cmp(&b.ceiling))
    }

    /// Row in durable-log column order
    pub fn to_row(&self) -> Vec<String> {
        let mut row = Vec::with_capacity(BASE_COLUMNS.len() + self.flags.len());
        row.push(self.timestamp.format(TIMESTAMP_FORMAT).to_string());
        row.push(self.market_id.clone());
        row.push(self.market_name.clone());
        row.push(format!("{:.4}", self.yes_price));
        row.push(format!("{:.4}", self.no_price));
        row.push(format!("{:.4}", self.price_sum));
        row.push(format!("{:.4}", self.gap));
        for flag in &self.flags {
            row.push(if flag.below { FLAG_TRUE } else { FLAG_FALSE }.to_string());
        }
        row
    }
}
