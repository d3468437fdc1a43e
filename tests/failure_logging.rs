//! Log output of a run against a market that never answers
//!
//! Kept in its own test binary so the captured subscriber sees only this run.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::tempdir;
use tokio::sync::watch;

use parity_monitor::models::{Market, ThresholdSet};
use parity_monitor::monitor::{PollScheduler, SchedulerSettings};
use parity_monitor::recording::{CsvObservationLog, Recorder};
use parity_monitor::scrapers::ScriptedFetcher;

/// Shared in-memory sink for formatted log lines
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_each_tick_logs_one_failure_for_a_dead_market() {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = tempdir().unwrap();
    let path = dir.path().join("arbitrage_data.csv");
    let log = Arc::new(CsvObservationLog::open(&path, &ThresholdSet::default()).unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new().failing("market_id_1", "HTTP 404"));
    let mut scheduler = PollScheduler::new(
        vec![Market {
            id: "market_id_1".into(),
            name: "Trump wins 2024".into(),
            fetch_target: "market_id_1".into(),
        }],
        ThresholdSet::default(),
        SchedulerSettings {
            interval: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(10),
            max_concurrent_fetches: 1,
            max_ticks: Some(3),
        },
        fetcher,
        Recorder::durable_only(log),
    );
    let (_tx, rx) = watch::channel(false);

    scheduler.run(rx).await;

    let lines = captured.lines();
    let failures: Vec<&String> = lines
        .iter()
        .filter(|l| l.contains("Failed to fetch prices"))
        .collect();
    assert_eq!(failures.len(), 3, "captured log:\n{}", lines.join("\n"));
    for (tick, line) in (1..=3).zip(&failures) {
        assert!(line.contains("WARN"));
        assert!(line.contains(&format!("tick={}", tick)));
        assert!(line.contains("market_id=market_id_1"));
        assert!(line.contains("reason=HTTP 404"));
    }

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 1);
}
