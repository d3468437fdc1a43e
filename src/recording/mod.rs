//! Observation Recording
//! Mission: Never lose an accepted observation; mirror it when possible
//!
//! The durable CSV log is authoritative. The remote mirror is best-effort
//! and always written second, so a mirror failure can never roll back or
//! skip a durable write.

pub mod csv_log;
pub mod reader;
pub mod sheet_mirror;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{MonitorError, SinkError};
use crate::models::ObservationRecord;

pub use csv_log::CsvObservationLog;
pub use reader::{read_observations, summarize, LoggedObservation, MarketSummary, ObservationLog};
pub use sheet_mirror::{
    provision, DisabledMirror, GoogleSheetsBackend, RemoteMirrorSink, SheetBackend,
};

/// Destination for observation records
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Human readable location, reported at shutdown
    fn destination(&self) -> String;

    /// Whether the sink currently accepts records
    fn is_enabled(&self) -> bool {
        true
    }

    /// Records accepted by `append` that later failed to reach the
    /// destination. Sinks that deliver synchronously report 0.
    fn failures(&self) -> u64 {
        0
    }

    async fn append(&self, record: &ObservationRecord) -> Result<(), SinkError>;

    /// Flush buffered state. Called once at shutdown.
    async fn close(&self) {}
}

/// What happened on the mirror side of a fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    Accepted,
    Disabled,
    Failed,
}

/// Fans each record out to the durable log, then the mirror.
pub struct Recorder {
    durable: Arc<dyn RecordSink>,
    mirror: Arc<dyn RecordSink>,
    /// Mirror appends rejected on the spot
    mirror_rejected: AtomicU64,
}

impl Recorder {
    pub fn new(durable: Arc<dyn RecordSink>, mirror: Arc<dyn RecordSink>) -> Self {
        Self {
            durable,
            mirror,
            mirror_rejected: AtomicU64::new(0),
        }
    }

    /// Durable-only recorder
    pub fn durable_only(durable: Arc<dyn RecordSink>) -> Self {
        Self::new(durable, Arc::new(DisabledMirror::default()))
    }

    /// Persist one record. A durable failure is returned as
    /// `DurableWriteFailure` and the mirror is skipped for that record;
    /// mirror failures are logged and reported through `MirrorOutcome`.
    pub async fn record(&self, record: &ObservationRecord) -> Result<MirrorOutcome, MonitorError> {
        self.durable
            .append(record)
            .await
            .map_err(|source| MonitorError::DurableWriteFailure {
                market_id: record.market_id.clone(),
                source,
            })?;

        if !self.mirror.is_enabled() {
            return Ok(MirrorOutcome::Disabled);
        }

        match self.mirror.append(record).await {
            Ok(()) => Ok(MirrorOutcome::Accepted),
            Err(SinkError::Disabled) => Ok(MirrorOutcome::Disabled),
            Err(e) => {
                self.mirror_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    market_id = %record.market_id,
                    sink = self.mirror.name(),
                    "{}",
                    MonitorError::MirrorWriteFailure(e)
                );
                Ok(MirrorOutcome::Failed)
            }
        }
    }

    pub fn durable_destination(&self) -> String {
        self.durable.destination()
    }

    pub fn mirror_enabled(&self) -> bool {
        self.mirror.is_enabled()
    }

    pub fn mirror_destination(&self) -> String {
        self.mirror.destination()
    }

    /// Mirror rows that were rejected or never delivered so far
    pub fn mirror_failures(&self) -> u64 {
        self.mirror_rejected.load(Ordering::Relaxed) + self.mirror.failures()
    }

    /// Close the durable sink first, then drain the mirror.
    pub async fn close(&self) {
        self.durable.close().await;
        self.mirror.close().await;
    }
}
