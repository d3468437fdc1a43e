//! Error taxonomy for the monitor
//!
//! Fetch and mirror failures are contained where they happen; durable write
//! failures are surfaced as data-loss events; configuration errors only
//! occur at startup.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure to obtain a price pair for one market
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("price source returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("no {0} outcome in market response")]
    MissingOutcome(&'static str),

    #[error("non-finite price (yes={yes}, no={no})")]
    NonFinite { yes: f64, no: f64 },

    #[error("{0}")]
    Unavailable(String),
}

/// Failure to append to a sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("csv error on {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("mirror disabled")]
    Disabled,

    #[error("mirror queue closed")]
    QueueClosed,

    #[error("mirror queue full; row dropped")]
    QueueFull,

    #[error("remote sheet has header {found:?}, expected {expected:?}")]
    HeaderMismatch {
        found: Vec<String>,
        expected: Vec<String>,
    },

    #[error("remote mirror error: {0}")]
    Remote(String),
}

impl SinkError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        Self::Csv {
            path: path.into(),
            source,
        }
    }
}

/// Invalid or unusable configuration; fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("cannot open durable log {path:?}: {source}")]
    DurableLogUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read durable log header from {path:?}: {source}")]
    DurableLogUnreadable {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("durable log {path:?} has header {found:?}, expected {expected:?}")]
    HeaderMismatch {
        path: PathBuf,
        found: Vec<String>,
        expected: Vec<String>,
    },
}

/// Umbrella error used at the scheduler and fan-out boundaries
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("fetch failed for {market_id}: {source}")]
    FetchFailure {
        market_id: String,
        #[source]
        source: FetchError,
    },

    #[error("durable write failed for {market_id}; observation lost: {source}")]
    DurableWriteFailure {
        market_id: String,
        #[source]
        source: SinkError,
    },

    #[error("mirror write failed: {0}")]
    MirrorWriteFailure(#[source] SinkError),

    #[error(transparent)]
    Configuration(#[from] ConfigError),
}
