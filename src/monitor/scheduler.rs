//! Poll Scheduler
//!
//! Idle -> Polling -> Sleeping -> Polling ... -> Stopped.
//!
//! Each tick fetches every market concurrently (bounded, each call under
//! the fetch timeout), then evaluates and records the results one market
//! at a time in configured order. Recording is sequential so durable append
//! order always equals observation order. A stop request is honoured before
//! a tick, while fetches are in flight, between market records, and during
//! the sleep; an append that has started always completes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::arbitrage::evaluate;
use crate::config::MonitorConfig;
use crate::error::{FetchError, MonitorError};
use crate::models::{Market, ObservationRecord, PricePair, ThresholdSet};
use crate::recording::Recorder;
use crate::scrapers::PriceFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Polling,
    Sleeping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub fetch_timeout: Duration,
    pub max_concurrent_fetches: usize,
    /// Stop after this many ticks; run until cancelled when `None`
    pub max_ticks: Option<u64>,
}

impl From<&MonitorConfig> for SchedulerSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            interval: config.polling_interval(),
            fetch_timeout: config.fetch_timeout(),
            max_concurrent_fetches: config.max_concurrent_fetches.max(1),
            max_ticks: None,
        }
    }
}

/// Counters for the whole run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub ticks: u64,
    pub records_written: u64,
    pub fetch_failures: u64,
    pub durable_failures: u64,
    /// Mirror rows rejected on append or never delivered
    pub mirror_failures: u64,
    pub alerts: u64,
}

/// A market that produced no record this tick
#[derive(Debug)]
pub struct MarketFailure {
    pub market_id: String,
    pub error: MonitorError,
}

#[derive(Debug)]
pub struct TickReport {
    pub tick: u64,
    pub records: Vec<ObservationRecord>,
    pub failures: Vec<MarketFailure>,
    /// Stop was requested before every market was processed
    pub interrupted: bool,
}

pub struct PollScheduler {
    markets: Vec<Market>,
    thresholds: ThresholdSet,
    settings: SchedulerSettings,
    fetcher: Arc<dyn PriceFetcher>,
    recorder: Recorder,
    state: SchedulerState,
    tick: u64,
    stats: RunStats,
}

impl PollScheduler {
    pub fn new(
        markets: Vec<Market>,
        thresholds: ThresholdSet,
        settings: SchedulerSettings,
        fetcher: Arc<dyn PriceFetcher>,
        recorder: Recorder,
    ) -> Self {
        Self {
            markets,
            thresholds,
            settings,
            fetcher,
            recorder,
            state: SchedulerState::Idle,
            tick: 0,
            stats: RunStats::default(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Run until `stop` flips to true (or `max_ticks` is reached), then
    /// close the sinks. A dropped sender never cancels the loop.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> RunStats {
        info!(
            markets = self.markets.len(),
            interval_secs = self.settings.interval.as_secs(),
            source = self.fetcher.source_name(),
            "Polling scheduler started"
        );

        loop {
            if *stop.borrow() || self.reached_max_ticks() {
                break;
            }

            let report = self.run_tick(&mut stop).await;
            if report.interrupted || self.reached_max_ticks() {
                break;
            }

            self.state = SchedulerState::Sleeping;
            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                _ = stop_requested(&mut stop) => break,
            }
        }

        self.shutdown().await;
        self.stats.clone()
    }

    /// One pass over every configured market
    pub async fn run_tick(&mut self, stop: &mut watch::Receiver<bool>) -> TickReport {
        self.state = SchedulerState::Polling;
        self.tick += 1;
        self.stats.ticks += 1;

        let tick = self.tick;
        let timestamp = Utc::now().trunc_subsecs(0);
        info!(tick, "[Iteration {}] {} UTC", tick, timestamp.format("%Y-%m-%d %H:%M:%S"));

        let mut report = TickReport {
            tick,
            records: Vec::with_capacity(self.markets.len()),
            failures: Vec::new(),
            interrupted: false,
        };

        let results = tokio::select! {
            results = self.fetch_all() => results,
            _ = stop_requested(stop) => {
                info!(tick, "Stop requested while fetching; no records written this tick");
                report.interrupted = true;
                return report;
            }
        };

        for (market, result) in self.markets.iter().zip(results) {
            if *stop.borrow() {
                report.interrupted = true;
                break;
            }

            let pair = match result {
                Ok(pair) => pair,
                Err(source) => {
                    self.stats.fetch_failures += 1;
                    warn!(
                        tick,
                        market_id = %market.id,
                        reason = %source,
                        "  ✗ {}: Failed to fetch prices",
                        market.name
                    );
                    report.failures.push(MarketFailure {
                        market_id: market.id.clone(),
                        error: MonitorError::FetchFailure {
                            market_id: market.id.clone(),
                            source,
                        },
                    });
                    continue;
                }
            };

            let record = evaluate(pair, &self.thresholds, market, timestamp);
            match self.recorder.record(&record).await {
                Ok(_) => {
                    self.stats.records_written += 1;
                    log_observation(tick, &record);
                    if record.primary_breached() {
                        self.stats.alerts += 1;
                        alert(&record);
                    }
                    report.records.push(record);
                }
                Err(e) => {
                    self.stats.durable_failures += 1;
                    error!(tick, market_id = %market.id, "DATA LOSS: {}", e);
                    report.failures.push(MarketFailure {
                        market_id: market.id.clone(),
                        error: e,
                    });
                }
            }
        }

        self.stats.mirror_failures = self.recorder.mirror_failures();
        report
    }

    async fn fetch_all(&self) -> Vec<Result<PricePair, FetchError>> {
        let fetcher = &self.fetcher;
        let fetch_timeout = self.settings.fetch_timeout;

        // `buffered` yields results in market order regardless of completion order
        stream::iter(self.markets.iter())
            .map(|market| async move {
                match tokio::time::timeout(fetch_timeout, fetcher.fetch(market)).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout(fetch_timeout)),
                }
            })
            .buffered(self.settings.max_concurrent_fetches.max(1))
            .collect()
            .await
    }

    fn reached_max_ticks(&self) -> bool {
        self.settings
            .max_ticks
            .map(|max| self.tick >= max)
            .unwrap_or(false)
    }

    async fn shutdown(&mut self) {
        self.recorder.close().await;
        // Queued mirror rows finish (or fail) during close
        self.stats.mirror_failures = self.recorder.mirror_failures();
        self.state = SchedulerState::Stopped;
        info!(
            ticks = self.stats.ticks,
            records = self.stats.records_written,
            fetch_failures = self.stats.fetch_failures,
            "Polling scheduler stopped"
        );
    }
}

/// Resolves once stop is requested; pending forever if the sender is gone
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn log_observation(tick: u64, record: &ObservationRecord) {
    info!(
        tick,
        market_id = %record.market_id,
        "  ✓ {}: YES={:.4} NO={:.4} Sum={:.4} Gap={:.4}",
        record.market_name,
        record.yes_price,
        record.no_price,
        record.price_sum,
        record.gap
    );
}

fn alert(record: &ObservationRecord) {
    let severity = record.severity().map(|f| f.name.as_str()).unwrap_or("primary");
    warn!(
        target: "parity_monitor::alert",
        severity,
        market_id = %record.market_id,
        gap = record.gap,
        "🚨 ARBITRAGE FOUND! {}: YES={:.4} + NO={:.4} = {:.4} (Gap: {:.4})",
        record.market_name,
        record.yes_price,
        record.no_price,
        record.price_sum,
        record.gap
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::recording::{CsvObservationLog, RecordSink, RemoteMirrorSink, SheetBackend};
    use crate::scrapers::{ScriptedFetcher, ScriptedQuote};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    /// Sheet that accepts the header but rejects every data row
    #[derive(Default)]
    struct RejectingSheet {
        header_written: Mutex<bool>,
    }

    #[async_trait]
    impl SheetBackend for RejectingSheet {
        async fn open_sheet(&self, _name: &str) -> Result<String, SinkError> {
            Ok("memory://rejecting".into())
        }

        async fn read_header(&self) -> Result<Vec<String>, SinkError> {
            Ok(Vec::new())
        }

        async fn append_row(&self, _row: &[String]) -> Result<(), SinkError> {
            let mut written = self.header_written.lock();
            if *written {
                return Err(SinkError::Remote("HTTP 503".into()));
            }
            *written = true;
            Ok(())
        }
    }

    /// Durable sink that requests a stop once it has accepted one row
    struct StopAfterFirstRow {
        stop: watch::Sender<bool>,
        rows: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RecordSink for StopAfterFirstRow {
        fn name(&self) -> &'static str {
            "stop-after-first"
        }

        fn destination(&self) -> String {
            "memory".into()
        }

        async fn append(&self, record: &ObservationRecord) -> Result<(), SinkError> {
            self.rows.lock().push(record.market_id.clone());
            let _ = self.stop.send(true);
            Ok(())
        }
    }

    fn market(id: &str) -> Market {
        Market {
            id: id.into(),
            name: id.to_uppercase(),
            fetch_target: id.into(),
        }
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            interval: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(2),
            max_concurrent_fetches: 4,
            max_ticks: None,
        }
    }

    fn scheduler(
        markets: Vec<Market>,
        fetcher: Arc<ScriptedFetcher>,
        log: Arc<CsvObservationLog>,
        settings: SchedulerSettings,
    ) -> PollScheduler {
        PollScheduler::new(
            markets,
            ThresholdSet::default(),
            settings,
            fetcher,
            Recorder::durable_only(log),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_market_does_not_abort_tick() {
        let dir = tempdir().unwrap();
        let log = Arc::new(
            CsvObservationLog::open(dir.path().join("log.csv"), &ThresholdSet::default()).unwrap(),
        );
        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .with_pair("a", 0.46, 0.50)
                .failing("b", "HTTP 503")
                .with_pair("c", 0.51, 0.51),
        );
        let mut sched = scheduler(
            vec![market("a"), market("b"), market("c")],
            fetcher,
            log.clone(),
            settings(),
        );
        let (_tx, mut rx) = watch::channel(false);

        let report = sched.run_tick(&mut rx).await;

        assert_eq!(report.tick, 1);
        assert!(!report.interrupted);
        let ids: Vec<&str> = report.records.iter().map(|r| r.market_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].market_id, "b");
        assert!(matches!(report.failures[0].error, MonitorError::FetchFailure { .. }));
        assert_eq!(log.rows_written(), 2);
        assert_eq!(sched.stats().alerts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_fetch_times_out() {
        let dir = tempdir().unwrap();
        let log = Arc::new(
            CsvObservationLog::open(dir.path().join("log.csv"), &ThresholdSet::default()).unwrap(),
        );
        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .with_quote("slow", ScriptedQuote::Hang)
                .with_pair("fast", 0.5, 0.45),
        );
        let mut sched = scheduler(vec![market("slow"), market("fast")], fetcher, log, settings());
        let (_tx, mut rx) = watch::channel(false);

        let report = sched.run_tick(&mut rx).await;

        assert_eq!(report.records.len(), 1);
        assert!(matches!(
            report.failures[0].error,
            MonitorError::FetchFailure {
                source: FetchError::Timeout(_),
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_keep_market_order_under_concurrency() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let log = Arc::new(CsvObservationLog::open(&path, &ThresholdSet::default()).unwrap());
        let markets: Vec<Market> = (0..10).map(|i| market(&format!("m{i}"))).collect();
        let mut fetcher = ScriptedFetcher::new();
        for m in &markets {
            fetcher = fetcher.with_pair(&m.id, 0.5, 0.48);
        }
        let mut sched = scheduler(markets.clone(), Arc::new(fetcher), log, settings());
        let (_tx, mut rx) = watch::channel(false);

        sched.run_tick(&mut rx).await;

        let read = crate::recording::read_observations(&path).unwrap();
        let ids: Vec<String> = read.rows.iter().map(|r| r.market_id.clone()).collect();
        let expected: Vec<String> = markets.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_after_max_ticks() {
        let dir = tempdir().unwrap();
        let log = Arc::new(
            CsvObservationLog::open(dir.path().join("log.csv"), &ThresholdSet::default()).unwrap(),
        );
        let fetcher = Arc::new(ScriptedFetcher::new().with_pair("a", 0.5, 0.5));
        let mut s = settings();
        s.max_ticks = Some(4);
        let mut sched = scheduler(vec![market("a")], fetcher, log.clone(), s);
        let (_tx, rx) = watch::channel(false);

        let started = tokio::time::Instant::now();
        let stats = sched.run(rx).await;

        assert_eq!(stats.ticks, 4);
        assert_eq!(stats.records_written, 4);
        assert_eq!(sched.state(), SchedulerState::Stopped);
        // Three sleeps between four ticks
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_tick() {
        let dir = tempdir().unwrap();
        let log = Arc::new(
            CsvObservationLog::open(dir.path().join("log.csv"), &ThresholdSet::default()).unwrap(),
        );
        let fetcher = Arc::new(ScriptedFetcher::new().with_pair("a", 0.5, 0.5));
        let mut sched = scheduler(vec![market("a")], fetcher.clone(), log, settings());
        assert_eq!(sched.state(), SchedulerState::Idle);

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let stats = sched.run(rx).await;

        assert_eq!(stats.ticks, 0);
        assert!(fetcher.calls().is_empty());
        assert_eq!(sched.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_mirror_failures_reach_run_stats() {
        let dir = tempdir().unwrap();
        let log = Arc::new(
            CsvObservationLog::open(dir.path().join("log.csv"), &ThresholdSet::default()).unwrap(),
        );
        let mirror = Arc::new(RemoteMirrorSink::spawn(
            Arc::new(RejectingSheet::default()),
            "Arb",
            ThresholdSet::default().header(),
        ));
        let fetcher = Arc::new(ScriptedFetcher::new().with_pair("a", 0.48, 0.5));
        let mut s = settings();
        s.max_ticks = Some(3);
        let mut sched = PollScheduler::new(
            vec![market("a")],
            ThresholdSet::default(),
            s,
            fetcher,
            Recorder::new(log.clone(), mirror.clone()),
        );
        let (_tx, rx) = watch::channel(false);

        let stats = sched.run(rx).await;

        assert_eq!(mirror.failed(), 3);
        assert_eq!(stats.mirror_failures, 3);
        assert_eq!(stats.records_written, 3);
        assert_eq!(log.rows_written(), 3);
        assert!(mirror.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_fetch_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let log = Arc::new(CsvObservationLog::open(&path, &ThresholdSet::default()).unwrap());
        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .with_pair("fast", 0.4, 0.4)
                .with_quote("slow", ScriptedQuote::Hang),
        );
        let mut s = settings();
        s.fetch_timeout = Duration::from_secs(60);
        let mut sched = scheduler(vec![market("fast"), market("slow")], fetcher, log.clone(), s);
        let (tx, mut rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(true).unwrap();
        });
        let report = sched.run_tick(&mut rx).await;

        assert!(report.interrupted);
        assert!(report.records.is_empty());
        assert_eq!(log.rows_written(), 0);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_stop_between_markets_keeps_written_rows_whole() {
        let (tx, mut rx) = watch::channel(false);
        let durable = Arc::new(StopAfterFirstRow {
            stop: tx,
            rows: Mutex::new(Vec::new()),
        });
        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .with_pair("a", 0.5, 0.4)
                .with_pair("b", 0.5, 0.4)
                .with_pair("c", 0.5, 0.4),
        );
        let mut sched = PollScheduler::new(
            vec![market("a"), market("b"), market("c")],
            ThresholdSet::default(),
            settings(),
            fetcher,
            Recorder::durable_only(durable.clone()),
        );

        let report = sched.run_tick(&mut rx).await;

        assert!(report.interrupted);
        assert_eq!(report.records.len(), 1);
        assert_eq!(*durable.rows.lock(), vec!["a".to_string()]);
        assert_eq!(sched.stats().records_written, 1);
    }
}
