use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::engine::candles::AggregationReport;
use crate::persist::{with_timeout, PersistResult, SnapshotStore};

/// Deletes the snapshots an aggregation pass has already consumed.
pub struct RetentionSweeper {
    storage_timeout: Duration,
}

impl RetentionSweeper {
    pub fn new(storage_timeout: Duration) -> Self {
        Self { storage_timeout }
    }

    /// Remove every snapshot strictly older than the pass's cutoff.
    /// Taking the report means a sweep can only follow a completed aggregation.
    #[instrument(skip_all, fields(cutoff = %report.cutoff))]
    pub async fn sweep<S>(&self, store: &S, report: &AggregationReport) -> PersistResult<u64>
    where
        S: SnapshotStore + ?Sized,
    {
        self.sweep_before(store, report.cutoff).await
    }

    async fn sweep_before<S>(&self, store: &S, cutoff: DateTime<Utc>) -> PersistResult<u64>
    where
        S: SnapshotStore + ?Sized,
    {
        let deleted = with_timeout("delete_before", self.storage_timeout, store.delete_before(cutoff)).await?;
        metrics::counter!("bazaar_snapshots_swept_total").increment(deleted);
        info!(deleted, "Cleaned up old order book entries");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::candles::CandleAggregator;
    use crate::engine::types::{MarketSnapshot, Side};
    use crate::persist::memory::MemoryStore;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn row(min: i64, rank: u8) -> MarketSnapshot {
        MarketSnapshot {
            product_id: "X".into(),
            captured_at: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(min),
            side: Side::SELL,
            rank,
            price: Decimal::ONE,
            amount: 1,
            order_count: 1,
        }
    }

    #[tokio::test]
    async fn test_sweep_keeps_rows_at_or_after_cutoff() {
        let store = MemoryStore::new();
        store
            .insert_snapshots(&[row(0, 1), row(0, 2), row(9, 1), row(10, 1), row(11, 3)])
            .await
            .unwrap();

        let agg = CandleAggregator::new(Duration::from_secs(5 * 60), Duration::from_secs(1));
        let now = row(15, 1).captured_at;
        let report = agg.aggregate(&store, now).await.unwrap();

        let sweeper = RetentionSweeper::new(Duration::from_secs(1));
        assert_eq!(sweeper.sweep(&store, &report).await.unwrap(), 3);

        let left = store.all_snapshots();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|s| s.captured_at >= report.cutoff));
    }
}
