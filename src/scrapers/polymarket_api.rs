//! Polymarket CLOB Integration
//! Mission: Pull the current YES and NO token prices for a single market

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::models::{Market, PricePair};
use crate::scrapers::PriceFetcher;

pub const CLOB_API_BASE: &str = "https://clob.polymarket.com";

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;

/// Fetches price pairs from the CLOB `/markets/{condition_id}` endpoint.
///
/// A market's `fetch_target` is either a full endpoint URL or a bare
/// condition id, which is resolved against the configured base URL.
pub struct ClobPriceFetcher {
    client: Client,
    base_url: String,
}

impl ClobPriceFetcher {
    pub fn new(request_timeout: Duration) -> Result<Self, FetchError> {
        Self::with_base_url(CLOB_API_BASE, request_timeout)
    }

    pub fn with_base_url(base_url: &str, request_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent("parity-monitor/0.1")
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn market_url(&self, fetch_target: &str) -> String {
        if fetch_target.starts_with("http://") || fetch_target.starts_with("https://") {
            fetch_target.to_string()
        } else {
            format!("{}/markets/{}", self.base_url, fetch_target)
        }
    }

    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let mut backoff = INITIAL_BACKOFF_MS;
        let mut last_err = None;

        for attempt in 0..MAX_RETRIES {
            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    warn!("Rate limited on attempt {}, backing off", attempt + 1);
                    last_err = Some(FetchError::Status {
                        status: response.status().as_u16(),
                        body: String::new(),
                    });
                    sleep(Duration::from_millis(backoff * 10)).await;
                }
                Ok(response) => {
                    // Non-retryable: 404 for an unknown market, 4xx for a bad id
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    return Err(FetchError::Status { status, body });
                }
                Err(e) => {
                    debug!("Request failed (attempt {}): {}", attempt + 1, e);
                    last_err = Some(FetchError::Transport(e));
                }
            }

            if attempt < MAX_RETRIES - 1 {
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(2_000);
            }
        }

        Err(last_err.unwrap_or_else(|| FetchError::Unavailable(format!("no response from {}", url))))
    }
}

#[async_trait]
impl PriceFetcher for ClobPriceFetcher {
    async fn fetch(&self, market: &Market) -> Result<PricePair, FetchError> {
        let url = self.market_url(&market.fetch_target);
        let response = self.get_with_retry(&url).await?;
        let body: ClobMarket = response.json().await?;

        let pair = extract_pair(&body.tokens)?;
        if !pair.in_unit_range() {
            debug!(
                market_id = %market.id,
                yes = pair.yes_price,
                no = pair.no_price,
                "Quote outside [0, 1]"
            );
        }
        Ok(pair)
    }

    fn source_name(&self) -> &'static str {
        "polymarket-clob"
    }
}

/// Pick the Yes/No token prices out of a CLOB market's token list
pub fn extract_pair(tokens: &[ClobToken]) -> Result<PricePair, FetchError> {
    let price_of = |outcome: &'static str| {
        tokens
            .iter()
            .find(|t| t.outcome.eq_ignore_ascii_case(outcome))
            .map(|t| t.price)
            .ok_or(FetchError::MissingOutcome(outcome))
    };

    let pair = PricePair::new(price_of("yes")?, price_of("no")?);
    if !pair.is_finite() {
        return Err(FetchError::NonFinite {
            yes: pair.yes_price,
            no: pair.no_price,
        });
    }
    Ok(pair)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClobMarket {
    #[serde(default, alias = "conditionId")]
    pub condition_id: String,
    #[serde(default)]
    pub tokens: Vec<ClobToken>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClobToken {
    #[serde(default, alias = "tokenId")]
    pub token_id: String,
    pub outcome: String,
    pub price: f64,
}
