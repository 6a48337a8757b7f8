// Source: https://api.hypixel.net/skyblock/bazaar
use std::collections::BTreeMap;

// Top-level body. Products are kept opaque so one bad entry cannot fail the batch.
#[derive(Debug, serde::Deserialize)]
pub struct BazaarEnvelope {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(rename = "lastUpdated", default)]
    pub last_updated: Option<i64>,
    pub products: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RawProduct {
    #[serde(default)]
    pub buy_summary: Vec<RawLevel>,  // best price first
    #[serde(default)]
    pub sell_summary: Vec<RawLevel>,
    // quick_status and the rest are ignored
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct RawLevel {
    #[serde(rename = "pricePerUnit")]
    pub price_per_unit: f64,
    pub amount: u64,
    pub orders: u32,
}
