//! Monitor configuration
//!
//! Loaded once at startup from a JSON file. Missing fields are filled with
//! defaults and the completed document is written back so every run is
//! reproducible from the file on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::{Market, ThresholdSet};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const DEFAULT_SHEET_NAME: &str = "Polymarket Arbitrage Data";

/// Where price pairs come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    /// Polymarket CLOB REST API
    Clob,
    /// Uniform random quotes around parity, for dry runs
    Simulated,
}

impl std::str::FromStr for PriceSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clob" | "polymarket" => Ok(Self::Clob),
            "simulated" | "mock" => Ok(Self::Simulated),
            other => Err(format!("unknown price source '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub markets: Vec<Market>,
    pub thresholds: ThresholdSet,
    pub polling_interval_seconds: u64,
    pub fetch_timeout_seconds: u64,
    pub max_concurrent_fetches: usize,
    pub output_csv: PathBuf,
    pub price_source: PriceSource,
    /// Seed for the simulated source; random when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation_seed: Option<u64>,
    pub use_google_sheets: bool,
    pub google_sheets_name: String,
    pub share_sheet_publicly: bool,
    pub log_level: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            markets: vec![Market {
                id: "market_id_1".to_string(),
                name: "Trump wins 2024".to_string(),
                fetch_target: "https://clob.polymarket.com/markets/market_id_1".to_string(),
            }],
            thresholds: ThresholdSet::default(),
            polling_interval_seconds: 5,
            fetch_timeout_seconds: 10,
            max_concurrent_fetches: 4,
            output_csv: PathBuf::from("arbitrage_data.csv"),
            price_source: PriceSource::Clob,
            simulation_seed: None,
            use_google_sheets: false,
            google_sheets_name: DEFAULT_SHEET_NAME.to_string(),
            share_sheet_publicly: true,
            log_level: "info".to_string(),
        }
    }
}

/// Result of `MonitorConfig::load_or_create`
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: MonitorConfig,
    /// The file did not exist and was created from defaults
    pub created: bool,
    /// Defaults were merged into an existing file and written back
    pub completed: bool,
}

impl MonitorConfig {
    /// Parse a JSON document, filling every missing field with its default.
    pub fn from_json_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the config at `path`, creating it from defaults when absent and
    /// persisting any defaulted fields back to disk. The result is validated.
    pub fn load_or_create(path: &Path) -> Result<LoadedConfig, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(LoadedConfig {
                config,
                created: true,
                completed: false,
            });
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&content, path)?;
        config.validate()?;

        let on_disk: serde_json::Value =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let completed = serde_json::to_value(&config)
            .map(|full| full != on_disk)
            .unwrap_or(false);
        if completed {
            config.save(path)?;
        }

        Ok(LoadedConfig {
            config,
            created: false,
            completed,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let body = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, body + "\n").map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.markets.is_empty() {
            return Err(ConfigError::Invalid("no markets configured".into()));
        }

        let mut seen = HashSet::new();
        for market in &self.markets {
            if market.id.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "market '{}' has an empty id",
                    market.name
                )));
            }
            if !seen.insert(market.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate market id '{}'",
                    market.id
                )));
            }
        }

        if self.thresholds.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one threshold level is required".into(),
            ));
        }
        let mut names = HashSet::new();
        for level in self.thresholds.levels() {
            if !names.insert(level.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate threshold '{}'",
                    level.name
                )));
            }
            if !level.ceiling.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "threshold '{}' has a non-finite ceiling",
                    level.name
                )));
            }
        }

        if self.polling_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "polling_interval_seconds must be positive".into(),
            ));
        }
        if self.fetch_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "fetch_timeout_seconds must be positive".into(),
            ));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_fetches must be positive".into(),
            ));
        }
        if self.output_csv.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("output_csv must not be empty".into()));
        }
        if self.use_google_sheets && self.google_sheets_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "google_sheets_name is required when use_google_sheets is set".into(),
            ));
        }

        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    /// Apply CLI overrides. Overrides are not persisted back to the file.
    pub fn apply_overrides(
        &mut self,
        price_source: Option<PriceSource>,
        interval_secs: Option<u64>,
    ) {
        if let Some(source) = price_source {
            self.price_source = source;
        }
        if let Some(secs) = interval_secs {
            self.polling_interval_seconds = secs;
        }
    }
}
