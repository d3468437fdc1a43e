//! Parity Monitor - Polymarket YES/NO parity watcher
//! Mission: Catch every market where YES + NO trades below $1.00

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parity_monitor::config::{MonitorConfig, PriceSource, DEFAULT_CONFIG_PATH};
use parity_monitor::monitor::{PollScheduler, RunStats, SchedulerSettings};
use parity_monitor::recording::{
    CsvObservationLog, DisabledMirror, GoogleSheetsBackend, RecordSink, Recorder,
    RemoteMirrorSink,
};
use parity_monitor::scrapers::{ClobPriceFetcher, PriceFetcher, SimulatedPriceFetcher};

#[derive(Parser, Debug)]
#[command(name = "parity-monitor")]
#[command(about = "Monitor prediction markets for YES + NO parity gaps")]
struct Args {
    /// Path to the JSON config; created with defaults when missing
    #[arg(long, env = "PARITY_MONITOR_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Stop after this many polling iterations
    #[arg(long)]
    max_ticks: Option<u64>,

    /// Override the configured price source (clob | simulated)
    #[arg(long)]
    price_source: Option<PriceSource>,

    /// Override the polling interval in seconds
    #[arg(long)]
    interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let loaded = MonitorConfig::load_or_create(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    let mut config = loaded.config;
    config.apply_overrides(args.price_source, args.interval);
    config.validate().context("Invalid configuration after CLI overrides")?;

    init_tracing(&config.log_level);

    if loaded.created {
        info!("📝 Created default config at {}; edit it to add your markets", args.config.display());
    } else if loaded.completed {
        info!("📝 Added missing defaults to {}", args.config.display());
    }

    let fetcher = build_fetcher(&config)?;
    let durable = Arc::new(
        CsvObservationLog::open(&config.output_csv, &config.thresholds)
            .context("Durable log is unavailable")?,
    );
    let mirror = build_mirror(&config)?;
    let recorder = Recorder::new(durable, mirror);

    print_banner(&config, fetcher.source_name(), &recorder);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("🛑 Shutdown requested, finishing in-flight writes");
        let _ = stop_tx.send(true);
    });

    let mut settings = SchedulerSettings::from(&config);
    settings.max_ticks = args.max_ticks;

    let mut scheduler = PollScheduler::new(
        config.markets.clone(),
        config.thresholds.clone(),
        settings,
        fetcher,
        recorder,
    );
    let stats = scheduler.run(stop_rx).await;

    print_summary(&stats, scheduler.recorder());
    Ok(())
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("parity_monitor={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_fetcher(config: &MonitorConfig) -> Result<Arc<dyn PriceFetcher>> {
    Ok(match config.price_source {
        PriceSource::Clob => Arc::new(
            ClobPriceFetcher::new(config.fetch_timeout())
                .context("Failed to build CLOB HTTP client")?,
        ),
        PriceSource::Simulated => {
            warn!("⚠️  Using simulated prices; nothing recorded reflects a real market");
            Arc::new(SimulatedPriceFetcher::new(config.simulation_seed))
        }
    })
}

/// The mirror never blocks startup; any setup problem downgrades it to disabled.
fn build_mirror(config: &MonitorConfig) -> Result<Arc<dyn RecordSink>> {
    if !config.use_google_sheets {
        return Ok(Arc::new(DisabledMirror::with_reason("use_google_sheets = false")));
    }

    match GoogleSheetsBackend::from_env(config.share_sheet_publicly) {
        Some(Ok(backend)) => Ok(Arc::new(RemoteMirrorSink::spawn(
            Arc::new(backend),
            &config.google_sheets_name,
            config.thresholds.header(),
        ))),
        Some(Err(e)) => {
            error!("Google Sheets mirror unavailable: {}. Continuing with CSV only", e);
            Ok(Arc::new(DisabledMirror::with_reason(e.to_string())))
        }
        None => {
            warn!(
                "use_google_sheets is set but GOOGLE_SHEETS_ACCESS_TOKEN is missing. Continuing with CSV only"
            );
            Ok(Arc::new(DisabledMirror::with_reason("missing access token")))
        }
    }
}

fn print_banner(config: &MonitorConfig, source: &str, recorder: &Recorder) {
    let levels: Vec<String> = config
        .thresholds
        .levels()
        .iter()
        .map(|l| format!("{}={:.2}", l.name, l.ceiling))
        .collect();

    info!("🚀 Parity monitor starting");
    info!("📊 Markets: {}", config.markets.len());
    for market in &config.markets {
        info!("   - {} ({})", market.name, market.id);
    }
    info!("🎯 Thresholds: {}", levels.join(", "));
    info!("⏱️  Interval: {}s, fetch timeout: {}s", config.polling_interval_seconds, config.fetch_timeout_seconds);
    info!("🔌 Price source: {}", source);
    info!("💾 CSV log: {}", recorder.durable_destination());
    info!("📄 Mirror: {}", recorder.mirror_destination());
}

fn print_summary(stats: &RunStats, recorder: &Recorder) {
    info!("✅ Monitoring stopped after {} iterations", stats.ticks);
    info!(
        "   records={} alerts={} fetch_failures={} durable_failures={} mirror_failures={}",
        stats.records_written,
        stats.alerts,
        stats.fetch_failures,
        stats.durable_failures,
        stats.mirror_failures
    );
    info!("💾 Data saved to: {}", recorder.durable_destination());
    if recorder.mirror_enabled() {
        info!("📄 Mirror: {}", recorder.mirror_destination());
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
