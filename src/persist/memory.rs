//! In-process store used by tests and `--dry-run`.
//!
//! Same semantics as the Postgres store: snapshot inserts ignore duplicate keys,
//! candle writes overwrite on (product_id, window_end).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::engine::types::{BookDepth, Candle, MarketSnapshot, SnapshotKey, UpsertOutcome};
use crate::persist::snapshot::levels_for_side;
use crate::persist::{CandleStore, PersistError, PersistResult, SnapshotStore};
use crate::engine::types::Side;

#[derive(Default)]
pub struct MemoryStore {
    snapshots: RwLock<BTreeMap<SnapshotKey, MarketSnapshot>>,
    candles: RwLock<BTreeMap<(String, DateTime<Utc>), Candle>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with an I/O error until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn candle_count(&self) -> usize {
        self.candles.read().len()
    }

    pub fn all_snapshots(&self) -> Vec<MarketSnapshot> {
        self.snapshots.read().values().cloned().collect()
    }

    fn check(&self) -> PersistResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistError::IoFailure("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn insert_snapshots(&self, rows: &[MarketSnapshot]) -> PersistResult<u64> {
        self.check()?;
        let mut map = self.snapshots.write();
        let mut inserted = 0;
        for row in rows {
            map.entry(row.key()).or_insert_with(|| {
                inserted += 1;
                row.clone()
            });
        }
        Ok(inserted)
    }

    async fn products_since(&self, cutoff: DateTime<Utc>) -> PersistResult<Vec<String>> {
        self.check()?;
        let map = self.snapshots.read();
        let ids: BTreeSet<&String> = map
            .values()
            .filter(|s| s.captured_at >= cutoff)
            .map(|s| &s.product_id)
            .collect();
        Ok(ids.into_iter().cloned().collect())
    }

    async fn top_of_book_since(&self, cutoff: DateTime<Utc>) -> PersistResult<Vec<MarketSnapshot>> {
        self.check()?;
        Ok(self
            .snapshots
            .read()
            .values()
            .filter(|s| s.captured_at >= cutoff && s.is_top_of_book())
            .cloned()
            .collect())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> PersistResult<u64> {
        self.check()?;
        let mut map = self.snapshots.write();
        let before = map.len();
        map.retain(|_, s| s.captured_at >= cutoff);
        Ok((before - map.len()) as u64)
    }

    async fn latest_book(&self, product_id: &str, depth: usize) -> PersistResult<BookDepth> {
        self.check()?;
        let map = self.snapshots.read();
        let latest = map
            .values()
            .filter(|s| s.product_id == product_id)
            .map(|s| s.captured_at)
            .max();
        let Some(at) = latest else {
            return Ok(BookDepth::default());
        };
        let rows: Vec<MarketSnapshot> = map
            .values()
            .filter(|s| s.product_id == product_id && s.captured_at == at && (s.rank as usize) <= depth)
            .cloned()
            .collect();
        Ok(BookDepth {
            captured_at: Some(at),
            buy: levels_for_side(&rows, Side::BUY),
            sell: levels_for_side(&rows, Side::SELL),
        })
    }
}

#[async_trait]
impl CandleStore for MemoryStore {
    async fn upsert_candle(&self, candle: &Candle) -> PersistResult<UpsertOutcome> {
        self.check()?;
        let key = (candle.product_id.clone(), candle.window_end);
        match self.candles.write().insert(key, candle.clone()) {
            Some(_) => Ok(UpsertOutcome::Updated),
            None => Ok(UpsertOutcome::Inserted),
        }
    }

    async fn candle_products(&self) -> PersistResult<Vec<String>> {
        self.check()?;
        let map = self.candles.read();
        let ids: BTreeSet<&String> = map.keys().map(|(p, _)| p).collect();
        Ok(ids.into_iter().cloned().collect())
    }

    async fn candles_since(&self, product_id: &str, since: DateTime<Utc>) -> PersistResult<Vec<Candle>> {
        self.check()?;
        // BTreeMap order is (product, window_end) so the result is already ascending
        Ok(self
            .candles
            .read()
            .values()
            .filter(|c| c.product_id == product_id && c.window_end >= since)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal::Decimal;

    fn snap(product: &str, at: DateTime<Utc>, side: Side, rank: u8, price: i64) -> MarketSnapshot {
        MarketSnapshot {
            product_id: product.into(),
            captured_at: at,
            side,
            rank,
            price: Decimal::new(price, 0),
            amount: 10,
            order_count: 1,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_snapshot_is_noop() {
        let store = MemoryStore::new();
        let row = snap("X", t0(), Side::BUY, 1, 10);

        assert_eq!(store.insert_snapshots(&[row.clone()]).await.unwrap(), 1);
        assert_eq!(store.insert_snapshots(&[row]).await.unwrap(), 0);
        assert_eq!(store.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_before_is_strict() {
        let store = MemoryStore::new();
        let rows = vec![
            snap("X", t0(), Side::BUY, 1, 10),
            snap("X", t0() + Duration::minutes(1), Side::BUY, 1, 11),
            snap("X", t0() + Duration::minutes(2), Side::BUY, 1, 12),
        ];
        store.insert_snapshots(&rows).await.unwrap();

        let removed = store.delete_before(t0() + Duration::minutes(1)).await.unwrap();
        assert_eq!(removed, 1);
        let left: Vec<_> = store.all_snapshots().into_iter().map(|s| s.captured_at).collect();
        assert_eq!(left, vec![t0() + Duration::minutes(1), t0() + Duration::minutes(2)]);
    }

    #[tokio::test]
    async fn test_latest_book_uses_newest_timestamp() {
        let store = MemoryStore::new();
        let later = t0() + Duration::minutes(1);
        store
            .insert_snapshots(&[
                snap("X", t0(), Side::BUY, 1, 1),
                snap("X", later, Side::SELL, 2, 22),
                snap("X", later, Side::BUY, 1, 20),
                snap("X", later, Side::SELL, 1, 21),
            ])
            .await
            .unwrap();

        let book = store.latest_book("X", 5).await.unwrap();
        assert_eq!(book.captured_at, Some(later));
        assert_eq!(book.buy.len(), 1);
        assert_eq!(book.sell.iter().map(|l| l.price).collect::<Vec<_>>(), vec![Decimal::new(21, 0), Decimal::new(22, 0)]);

        assert_eq!(store.latest_book("MISSING", 5).await.unwrap(), BookDepth::default());
    }

    #[tokio::test]
    async fn test_upsert_overwrites_same_key() {
        let store = MemoryStore::new();
        let mut candle = Candle {
            product_id: "X".into(),
            window_end: t0(),
            open: Decimal::ONE,
            high: Decimal::ONE,
            low: Decimal::ONE,
            close: Decimal::ONE,
            buy_volume: 1,
            sell_volume: 1,
        };
        assert_eq!(store.upsert_candle(&candle).await.unwrap(), UpsertOutcome::Inserted);
        candle.close = Decimal::TWO;
        assert_eq!(store.upsert_candle(&candle).await.unwrap(), UpsertOutcome::Updated);

        assert_eq!(store.candle_count(), 1);
        let stored = store.candles_since("X", t0()).await.unwrap();
        assert_eq!(stored[0].close, Decimal::TWO);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.products_since(t0()).await, Err(PersistError::IoFailure(_))));
        store.set_available(true);
        assert!(store.products_since(t0()).await.unwrap().is_empty());
    }
}
