// Shared trait + raw payload for market data sources

use std::collections::BTreeMap;

use thiserror::Error;

use crate::market_data::adapters::hypixel_types::RawProduct;

// Full market state as returned by one fetch, before filtering.
#[derive(Debug, Clone, Default)]
pub struct RawMarket {
    pub products: BTreeMap<String, RawProduct>,
    // products dropped while decoding because required fields were missing
    pub malformed: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Transport(String),
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("upstream reported success=false")]
    Unsuccessful,
    #[error("undecodable body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = e.status() {
            FetchError::Status(status.as_u16())
        } else if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

#[async_trait::async_trait]
pub trait MarketSource: Send + Sync {
    // One bounded-time call, no retries.
    async fn fetch(&self) -> Result<RawMarket, FetchError>;
}

pub mod hypixel;
pub mod hypixel_types;
