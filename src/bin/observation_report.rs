//! Observation Report CLI
//!
//! Summarises a durable observation log: how often each market traded
//! below each threshold and how large the gaps were.
//!
//! Usage:
//!   cargo run --bin observation_report -- --csv arbitrage_data.csv
//!   cargo run --bin observation_report -- --csv arbitrage_data.csv --market market_id_1

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use parity_monitor::recording::{read_observations, summarize};

#[derive(Parser, Debug)]
#[command(name = "observation_report")]
#[command(about = "Summarise a parity monitor observation log")]
struct Args {
    /// Path to the CSV observation log
    #[arg(long, default_value = "arbitrage_data.csv")]
    csv: PathBuf,

    /// Only report this market id
    #[arg(long)]
    market: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    println!("=== Observation Report ===");
    println!("Log: {}", args.csv.display());
    println!();

    let log = read_observations(&args.csv)?;
    let labels = log.threshold_labels().to_vec();
    println!("Rows: {}", log.rows.len());
    println!("Threshold columns: {}", labels.join(", "));
    println!();

    let summaries = summarize(&log);
    let mut shown = 0;
    for summary in summaries
        .iter()
        .filter(|s| args.market.as_deref().map_or(true, |id| s.market_id == id))
    {
        shown += 1;
        println!("--- {} ({}) ---", summary.market_name, summary.market_id);
        println!("Observations: {}", summary.observations);
        println!(
            "Window: {} to {}",
            summary.first_seen.format("%Y-%m-%d %H:%M:%S"),
            summary.last_seen.format("%Y-%m-%d %H:%M:%S")
        );
        for (label, count) in labels.iter().zip(&summary.breaches) {
            let pct = *count as f64 / summary.observations as f64 * 100.0;
            println!("  {:<14} {:>6} ({:.1}%)", label, count, pct);
        }
        println!("Max gap:  {:.4}", summary.max_gap);
        println!("Mean gap: {:.4}", summary.mean_gap);
        println!();
    }

    if shown == 0 {
        println!("  (no data)");
        println!();
    }

    println!("=== Report Complete ===");
    Ok(())
}
