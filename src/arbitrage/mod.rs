//! Arbitrage Detection Module
//! Mission: Quantify how far a market's YES + NO sits from parity

pub mod gap;

pub use gap::{evaluate, round4};
