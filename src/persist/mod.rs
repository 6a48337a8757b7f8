pub mod types;
pub use types::*;
pub mod snapshot;
pub mod memory;
pub mod postgres;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::types::{BookDepth, Candle, MarketSnapshot, UpsertOutcome};

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert rows, skipping any whose (product, timestamp, side, rank) already exists.
    /// Returns the number of rows actually inserted.
    async fn insert_snapshots(&self, rows: &[MarketSnapshot]) -> PersistResult<u64>;
    /// Distinct product ids with at least one snapshot at or after `cutoff`, sorted.
    async fn products_since(&self, cutoff: DateTime<Utc>) -> PersistResult<Vec<String>>;
    /// Rank-1 snapshots of both sides at or after `cutoff`.
    async fn top_of_book_since(&self, cutoff: DateTime<Utc>) -> PersistResult<Vec<MarketSnapshot>>;
    /// Delete snapshots strictly older than `cutoff`; returns the number removed.
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> PersistResult<u64>;
    /// Best `depth` levels per side at the product's most recent snapshot timestamp.
    async fn latest_book(&self, product_id: &str, depth: usize) -> PersistResult<BookDepth>;
}

#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Insert the candle, or overwrite the OHLCV fields of the one with the same
    /// (product_id, window_end).
    async fn upsert_candle(&self, candle: &Candle) -> PersistResult<UpsertOutcome>;
    async fn candle_products(&self) -> PersistResult<Vec<String>>;
    /// Candles with `window_end >= since`, ascending.
    async fn candles_since(&self, product_id: &str, since: DateTime<Utc>) -> PersistResult<Vec<Candle>>;
}

/// Bound a storage call so an unresponsive store cannot hang the caller.
pub async fn with_timeout<T, F>(op: &'static str, limit: Duration, fut: F) -> PersistResult<T>
where
    F: Future<Output = PersistResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PersistError::Timeout { op, secs: limit.as_secs() }),
    }
}
