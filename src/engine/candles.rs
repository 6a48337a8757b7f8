//! Windowed OHLCV aggregation.
//!
//! Candles are folded from rank-1 snapshots only. Prices (open/high/low/close)
//! come from the BUY side; volumes are summed separately per side. A candle's
//! `window_end` is the timestamp of the last BUY sample folded into it, so the
//! window boundary follows the data rather than a clock grid.
//!
//! Volumes are sums over the whole lookback window. If the window is longer
//! than the gap between two passes, consecutive candles count the overlapping
//! samples twice.

use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use rust_decimal::Decimal;
use tracing::{debug, info, instrument};

use crate::engine::types::{Candle, MarketSnapshot, Side, UpsertOutcome};
use crate::persist::{with_timeout, CandleStore, PersistResult, SnapshotStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ohlc {
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    window_end: DateTime<Utc>,
}

// Running first/last/min/max/sum state for one product
#[derive(Debug, Default)]
struct CandleAccumulator {
    ohlc: Option<Ohlc>,
    buy_volume: u64,
    sell_volume: u64,
}

impl CandleAccumulator {
    // Samples must arrive in ascending timestamp order
    fn push(&mut self, s: &MarketSnapshot) {
        match s.side {
            Side::BUY => {
                self.buy_volume = self.buy_volume.saturating_add(s.amount);
                match self.ohlc.as_mut() {
                    None => {
                        self.ohlc = Some(Ohlc {
                            open: s.price,
                            high: s.price,
                            low: s.price,
                            close: s.price,
                            window_end: s.captured_at,
                        })
                    }
                    Some(o) => {
                        o.high = o.high.max(s.price);
                        o.low = o.low.min(s.price);
                        o.close = s.price;
                        o.window_end = s.captured_at;
                    }
                }
            }
            Side::SELL => self.sell_volume = self.sell_volume.saturating_add(s.amount),
        }
    }

    fn finish(self, product_id: &str) -> Option<Candle> {
        let o = self.ohlc?;
        Some(Candle {
            product_id: product_id.to_string(),
            window_end: o.window_end,
            open: o.open,
            high: o.high,
            low: o.low,
            close: o.close,
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
        })
    }
}

/// Fold top-of-book samples into one candle per product in `products`.
/// Products without a BUY rank-1 sample get no candle. Output follows `products` order.
pub fn build_candles(products: &[String], samples: Vec<MarketSnapshot>) -> Vec<Candle> {
    let mut by_product = samples
        .into_iter()
        .filter(MarketSnapshot::is_top_of_book)
        .into_group_map_by(|s| s.product_id.clone());

    products
        .iter()
        .filter_map(|product_id| {
            let mut series = by_product.remove(product_id)?;
            series.sort_by_key(|s| s.captured_at);
            let mut acc = CandleAccumulator::default();
            for s in &series {
                acc.push(s);
            }
            acc.finish(product_id)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationReport {
    pub cutoff: DateTime<Utc>,
    pub products: usize,
    pub inserted: usize,
    pub updated: usize,
}

impl AggregationReport {
    pub fn candles(&self) -> usize {
        self.inserted + self.updated
    }
}

pub struct CandleAggregator {
    window: Duration,
    storage_timeout: Duration,
}

impl CandleAggregator {
    pub fn new(window: Duration, storage_timeout: Duration) -> Self {
        Self { window, storage_timeout }
    }

    /// Inclusive lower bound of the window ending at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Compute candles for the window ending at `now` and upsert them.
    #[instrument(skip(self, store))]
    pub async fn aggregate<S>(&self, store: &S, now: DateTime<Utc>) -> PersistResult<AggregationReport>
    where
        S: SnapshotStore + CandleStore + ?Sized,
    {
        let cutoff = self.cutoff(now);
        let limit = self.storage_timeout;

        let products = with_timeout("products_since", limit, store.products_since(cutoff)).await?;
        let samples = with_timeout("top_of_book_since", limit, store.top_of_book_since(cutoff)).await?;
        debug!(products = products.len(), samples = samples.len(), %cutoff, "Loaded window");

        let candles = build_candles(&products, samples);
        let mut report = AggregationReport { cutoff, products: products.len(), inserted: 0, updated: 0 };
        for candle in &candles {
            match with_timeout("upsert_candle", limit, store.upsert_candle(candle)).await? {
                UpsertOutcome::Inserted => report.inserted += 1,
                UpsertOutcome::Updated => report.updated += 1,
            }
        }

        metrics::counter!("bazaar_candles_written_total").increment(report.candles() as u64);
        info!(products = report.products, inserted = report.inserted, updated = report.updated, "Generated candles");
        Ok(report)
    }
}
