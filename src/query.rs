//! Read-side views over the stores, for the query service.
//!
//! Every read degrades to an empty value plus a message instead of
//! returning an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;

use crate::engine::types::{BookDepth, Candle, Level, MAX_DEPTH};
use crate::persist::{with_timeout, CandleStore, PersistResult, SnapshotStore};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A read result that never fails: on error `value` is empty and `error` explains why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Degraded<T> {
    #[serde(flatten)]
    pub value: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Default> Degraded<T> {
    fn from_result(op: &str, result: PersistResult<T>) -> Self {
        match result {
            Ok(value) => Degraded { value, error: None },
            Err(e) => {
                warn!(op, error = %e, "Read failed, serving empty result");
                Degraded { value: T::default(), error: Some(e.to_string()) }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProductList {
    pub products: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandleView {
    pub timestamp: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub buy_volume: u64,
    pub sell_volume: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CandleSeries {
    pub candles: Vec<CandleView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelView {
    pub price: f64,
    pub amount: u64,
    pub orders: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderBookView {
    pub buy_orders: Vec<LevelView>,
    pub sell_orders: Vec<LevelView>,
}

fn num(d: Decimal) -> f64 {
    d.to_f64().unwrap_or_default()
}

impl From<&Candle> for CandleView {
    fn from(c: &Candle) -> Self {
        CandleView {
            timestamp: c.window_end.format(TIMESTAMP_FORMAT).to_string(),
            open: num(c.open),
            high: num(c.high),
            low: num(c.low),
            close: num(c.close),
            buy_volume: c.buy_volume,
            sell_volume: c.sell_volume,
        }
    }
}

impl From<&Level> for LevelView {
    fn from(l: &Level) -> Self {
        LevelView { price: num(l.price), amount: l.amount, orders: l.orders }
    }
}

impl From<BookDepth> for OrderBookView {
    fn from(b: BookDepth) -> Self {
        OrderBookView {
            buy_orders: b.buy.iter().map(LevelView::from).collect(),
            sell_orders: b.sell.iter().map(LevelView::from).collect(),
        }
    }
}

pub struct ReadModel<S> {
    store: Arc<S>,
    timeout: Duration,
}

impl<S> ReadModel<S>
where
    S: SnapshotStore + CandleStore,
{
    pub fn new(store: Arc<S>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Distinct products present in the candle relation, sorted.
    pub async fn products(&self) -> Degraded<ProductList> {
        let res = with_timeout("candle_products", self.timeout, self.store.candle_products())
            .await
            .map(|products| ProductList { products });
        Degraded::from_result("products", res)
    }

    /// Candles whose window ended within the trailing span, oldest first.
    pub async fn candles(&self, product_id: &str, trailing: Duration) -> Degraded<CandleSeries> {
        let since = chrono::Duration::from_std(trailing)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let res = with_timeout("candles_since", self.timeout, self.store.candles_since(product_id, since))
            .await
            .map(|cs| CandleSeries { candles: cs.iter().map(CandleView::from).collect() });

        let mut out = Degraded::from_result("candles", res);
        if out.error.is_none() && out.value.candles.is_empty() {
            out.error = Some("No data available for this product".into());
        }
        out
    }

    /// Best levels per side at the product's latest snapshot.
    pub async fn order_book(&self, product_id: &str) -> Degraded<OrderBookView> {
        let res = with_timeout("latest_book", self.timeout, self.store.latest_book(product_id, MAX_DEPTH))
            .await
            .map(OrderBookView::from);
        Degraded::from_result("order_book", res)
    }
}
