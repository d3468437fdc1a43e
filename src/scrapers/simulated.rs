//! Simulated quotes for dry runs without network access.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::arbitrage::round4;
use crate::error::FetchError;
use crate::models::{Market, PricePair};
use crate::scrapers::PriceFetcher;

const LOW: f64 = 0.40;
const HIGH: f64 = 0.60;

/// Draws each leg uniformly from [0.40, 0.60), so sums straddle parity.
pub struct SimulatedPriceFetcher {
    rng: Mutex<ChaCha8Rng>,
}

impl SimulatedPriceFetcher {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }
}

#[async_trait]
impl PriceFetcher for SimulatedPriceFetcher {
    async fn fetch(&self, _market: &Market) -> Result<PricePair, FetchError> {
        let mut rng = self.rng.lock();
        let yes = round4(rng.gen_range(LOW..HIGH));
        let no = round4(rng.gen_range(LOW..HIGH));
        Ok(PricePair::new(yes, no))
    }

    fn source_name(&self) -> &'static str {
        "simulated"
    }
}
