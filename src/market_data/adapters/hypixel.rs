// Hypixel bazaar adapter: one GET per cycle, no retries

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::hypixel_types::{BazaarEnvelope, RawProduct};
use super::{FetchError, MarketSource, RawMarket};

pub const DEFAULT_URL: &str = "https://api.hypixel.net/skyblock/bazaar";

pub struct HypixelAdapter {
    client: reqwest::Client,
    url: String,
}

impl HypixelAdapter {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { client, url: url.to_string() })
    }
}

/// Decode a bazaar body. Products that do not match `RawProduct` are counted
/// and skipped; a missing `products` map fails the whole body.
pub fn decode_body(body: &[u8]) -> Result<RawMarket, FetchError> {
    let envelope: BazaarEnvelope =
        serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))?;
    if envelope.success == Some(false) {
        return Err(FetchError::Unsuccessful);
    }

    let mut products = BTreeMap::new();
    let mut malformed = 0;
    for (product_id, value) in envelope.products {
        match serde_json::from_value::<RawProduct>(value) {
            Ok(p) => {
                products.insert(product_id, p);
            }
            Err(e) => {
                malformed += 1;
                warn!(product_id = %product_id, error = %e, "Skipping malformed product");
            }
        }
    }
    debug!(products = products.len(), malformed, last_updated = ?envelope.last_updated, "Decoded bazaar body");
    Ok(RawMarket { products, malformed })
}

#[async_trait::async_trait]
impl MarketSource for HypixelAdapter {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<RawMarket, FetchError> {
        let res = self.client.get(&self.url).send().await?;
        let status = res.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = res.bytes().await?;
        decode_body(&body)
    }
}
