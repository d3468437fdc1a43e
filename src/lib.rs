//! Parity Monitor Library
//!
//! Polls binary prediction markets, flags YES + NO price sums below parity,
//! and records every observation to a durable CSV log with an optional
//! best-effort spreadsheet mirror.

pub mod arbitrage;
pub mod config;
pub mod error;
pub mod models;
pub mod monitor;
pub mod recording;
pub mod scrapers;
