//! Deterministic price source for tests and rehearsals.
//!
//! Each market can have a queue of one-shot quotes, consumed first, and a
//! steady quote returned once its queue is empty.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::FetchError;
use crate::models::{Market, PricePair};
use crate::scrapers::PriceFetcher;

#[derive(Debug, Clone)]
pub enum ScriptedQuote {
    Pair(PricePair),
    Fail(String),
    /// Never resolves; exercises the scheduler's fetch timeout
    Hang,
}

#[derive(Default)]
pub struct ScriptedFetcher {
    steady: HashMap<String, ScriptedQuote>,
    queued: Mutex<HashMap<String, VecDeque<ScriptedQuote>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quote(mut self, market_id: &str, quote: ScriptedQuote) -> Self {
        self.steady.insert(market_id.to_string(), quote);
        self
    }

    pub fn with_pair(self, market_id: &str, yes: f64, no: f64) -> Self {
        self.with_quote(market_id, ScriptedQuote::Pair(PricePair::new(yes, no)))
    }

    pub fn failing(self, market_id: &str, reason: &str) -> Self {
        self.with_quote(market_id, ScriptedQuote::Fail(reason.to_string()))
    }

    /// Queue a one-shot quote ahead of the steady one
    pub fn push(&self, market_id: &str, quote: ScriptedQuote) {
        self.queued
            .lock()
            .entry(market_id.to_string())
            .or_default()
            .push_back(quote);
    }

    /// Market ids in the order they were fetched
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn next_quote(&self, market_id: &str) -> Option<ScriptedQuote> {
        let queued = self
            .queued
            .lock()
            .get_mut(market_id)
            .and_then(VecDeque::pop_front);
        queued.or_else(|| self.steady.get(market_id).cloned())
    }
}

#[async_trait]
impl PriceFetcher for ScriptedFetcher {
    async fn fetch(&self, market: &Market) -> Result<PricePair, FetchError> {
        self.calls.lock().push(market.id.clone());

        match self.next_quote(&market.id) {
            Some(ScriptedQuote::Pair(pair)) => Ok(pair),
            Some(ScriptedQuote::Fail(reason)) => Err(FetchError::Unavailable(reason)),
            Some(ScriptedQuote::Hang) => {
                std::future::pending::<()>().await;
                Err(FetchError::Unavailable("unreachable".into()))
            }
            None => Err(FetchError::Unavailable(format!(
                "no scripted quote for {}",
                market.id
            ))),
        }
    }

    fn source_name(&self) -> &'static str {
        "scripted"
    }
}
