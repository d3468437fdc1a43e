use async_trait::async_trait;

use crate::error::FetchError;
use crate::models::{Market, PricePair};

/// Source of current YES/NO prices for a market.
///
/// Implementations should not enforce their own overall deadline; the
/// scheduler bounds every call with the configured fetch timeout.
#[async_trait]
pub trait PriceFetcher: Send + Sync {
    async fn fetch(&self, market: &Market) -> Result<PricePair, FetchError>;

    /// Short name used in logs and the startup banner
    fn source_name(&self) -> &'static str;
}
