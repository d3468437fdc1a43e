//! Price sources
//!
//! Everything that turns a configured market into a YES/NO price pair sits
//! behind the `PriceFetcher` trait.

pub mod fetcher;
pub mod polymarket_api; // CLOB REST quotes
pub mod scripted; // Deterministic test double
pub mod simulated; // Random quotes for dry runs

pub use fetcher::PriceFetcher;
pub use polymarket_api::ClobPriceFetcher;
pub use scripted::{ScriptedFetcher, ScriptedQuote};
pub use simulated::SimulatedPriceFetcher;
