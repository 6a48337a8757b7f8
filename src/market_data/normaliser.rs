// Filter raw products and convert wire levels into decimal levels.
// Prices are kept at a fixed 2 decimal places, matching the persisted column.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use smallvec::SmallVec;
use tracing::{debug, info, instrument};

use crate::engine::types::{Level, MAX_DEPTH};
use crate::market_data::adapters::hypixel_types::{RawLevel, RawProduct};
use crate::market_data::adapters::RawMarket;

pub const PRICE_DECIMALS: u32 = 2;

pub type Levels = SmallVec<[Level; MAX_DEPTH]>;

// One product ready to be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct NormalisedProduct {
    pub product_id: String,
    pub captured_at: DateTime<Utc>,
    pub buy: Levels,
    pub sell: Levels,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    EmptySide,
    Illiquid,
    Malformed,
}

pub struct Normaliser {
    pub min_price: Decimal,
    pub depth: usize,
}

impl Normaliser {
    pub fn new(min_price: Decimal, depth: usize) -> Self {
        Self { min_price, depth: depth.clamp(1, MAX_DEPTH) }
    }

    /// Keep liquid products, each truncated to `depth` levels per side and
    /// stamped with the same `captured_at`.
    #[instrument(skip_all, fields(raw = market.products.len()))]
    pub fn normalise(&self, market: &RawMarket, captured_at: DateTime<Utc>) -> Vec<NormalisedProduct> {
        let mut out = Vec::with_capacity(market.products.len());
        let (mut empty, mut illiquid, mut malformed) = (0usize, 0usize, market.malformed);

        for (product_id, raw) in &market.products {
            match self.normalise_product(product_id, raw, captured_at) {
                Ok(p) => out.push(p),
                Err(Rejection::EmptySide) => empty += 1,
                Err(Rejection::Illiquid) => illiquid += 1,
                Err(Rejection::Malformed) => {
                    debug!(product_id = %product_id, "Unrepresentable price");
                    malformed += 1
                }
            }
        }

        info!(kept = out.len(), empty, illiquid, malformed, "Filtered products");
        out
    }

    pub fn normalise_product(
        &self,
        product_id: &str,
        raw: &RawProduct,
        captured_at: DateTime<Utc>,
    ) -> Result<NormalisedProduct, Rejection> {
        let (Some(best_buy), Some(best_sell)) = (raw.buy_summary.first(), raw.sell_summary.first()) else {
            return Err(Rejection::EmptySide);
        };

        // Threshold applies to the wire price, before rounding
        let best_buy = to_decimal(best_buy.price_per_unit).ok_or(Rejection::Malformed)?;
        let best_sell = to_decimal(best_sell.price_per_unit).ok_or(Rejection::Malformed)?;
        if best_buy < self.min_price || best_sell < self.min_price {
            return Err(Rejection::Illiquid);
        }

        let buy = self.norm_side(&raw.buy_summary)?;
        let sell = self.norm_side(&raw.sell_summary)?;
        // Rounding can still empty a side when the threshold is below a cent
        if buy.is_empty() || sell.is_empty() {
            return Err(Rejection::EmptySide);
        }

        Ok(NormalisedProduct { product_id: product_id.to_string(), captured_at, buy, sell })
    }

    // Converts the first `depth` levels. A level that rounds to a non-positive
    // price ends the side there so ranks stay contiguous.
    fn norm_side(&self, side: &[RawLevel]) -> Result<Levels, Rejection> {
        let mut levels = Levels::new();
        for lvl in side.iter().take(self.depth) {
            let price = to_decimal(lvl.price_per_unit)
                .ok_or(Rejection::Malformed)?
                .round_dp(PRICE_DECIMALS);
            if price <= Decimal::ZERO {
                break;
            }
            levels.push(Level { price, amount: lvl.amount, orders: lvl.orders });
        }
        Ok(levels)
    }
}

fn to_decimal(v: f64) -> Option<Decimal> {
    if !v.is_finite() {
        return None;
    }
    Decimal::from_f64(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn lvl(price: f64, amount: u64) -> RawLevel {
        RawLevel { price_per_unit: price, amount, orders: 1 }
    }

    fn product(buy: Vec<RawLevel>, sell: Vec<RawLevel>) -> RawProduct {
        RawProduct { buy_summary: buy, sell_summary: sell }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
    }

    fn normaliser() -> Normaliser {
        Normaliser::new(Decimal::new(7, 1), MAX_DEPTH)
    }

    #[test]
    fn test_empty_side_rejected() {
        let n = normaliser();
        let only_buy = product(vec![lvl(2.0, 1)], vec![]);
        let only_sell = product(vec![], vec![lvl(2.0, 1)]);
        assert_eq!(n.normalise_product("A", &only_buy, ts()), Err(Rejection::EmptySide));
        assert_eq!(n.normalise_product("A", &only_sell, ts()), Err(Rejection::EmptySide));
    }

    #[test]
    fn test_threshold_on_best_prices() {
        let n = normaliser();
        let cheap_buy = product(vec![lvl(0.69, 1)], vec![lvl(5.0, 1)]);
        let cheap_sell = product(vec![lvl(5.0, 1)], vec![lvl(0.1, 1)]);
        let at_threshold = product(vec![lvl(0.7, 1)], vec![lvl(0.7, 1)]);
        assert_eq!(n.normalise_product("A", &cheap_buy, ts()), Err(Rejection::Illiquid));
        assert_eq!(n.normalise_product("A", &cheap_sell, ts()), Err(Rejection::Illiquid));
        assert!(n.normalise_product("A", &at_threshold, ts()).is_ok());
    }

    #[test]
    fn test_unrounded_price_checked_against_threshold() {
        // 0.699 would round up to 0.70 but is still below the threshold
        let p = product(vec![lvl(0.699, 1)], vec![lvl(3.0, 1)]);
        assert_eq!(normaliser().normalise_product("A", &p, ts()), Err(Rejection::Illiquid));
    }

    #[test]
    fn test_depth_truncated_and_rounded() {
        let buys: Vec<RawLevel> = (0..8).map(|i| lvl(100.0 - i as f64 + 0.456, i)).collect();
        let p = product(buys, vec![lvl(101.0, 9)]);
        let out = normaliser().normalise_product("A", &p, ts()).unwrap();

        assert_eq!(out.buy.len(), 5);
        assert_eq!(out.sell.len(), 1);
        assert_eq!(out.buy[0].price, Decimal::new(10046, 2));
        assert_eq!(out.buy.iter().map(|l| l.amount).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_non_positive_deep_level_ends_side() {
        let p = product(vec![lvl(3.0, 1), lvl(0.001, 2), lvl(2.0, 3)], vec![lvl(4.0, 1)]);
        let out = normaliser().normalise_product("A", &p, ts()).unwrap();
        assert_eq!(out.buy.len(), 1);
    }

    #[test]
    fn test_side_rounded_to_zero_is_empty() {
        let n = Normaliser::new(Decimal::ZERO, MAX_DEPTH);
        let p = product(vec![lvl(0.001, 5)], vec![lvl(1.0, 1)]);
        assert_eq!(n.normalise_product("A", &p, ts()), Err(Rejection::EmptySide));

        let p = product(vec![lvl(1.0, 1)], vec![lvl(0.004, 5)]);
        assert_eq!(n.normalise_product("A", &p, ts()), Err(Rejection::EmptySide));
    }

    #[test]
    fn test_nan_price_is_malformed() {
        let p = product(vec![lvl(f64::NAN, 1)], vec![lvl(4.0, 1)]);
        assert_eq!(normaliser().normalise_product("A", &p, ts()), Err(Rejection::Malformed));
    }

    #[test]
    fn test_batch_shares_timestamp() {
        let mut products = BTreeMap::new();
        products.insert("A".to_string(), product(vec![lvl(2.0, 1)], vec![lvl(3.0, 1)]));
        products.insert("B".to_string(), product(vec![lvl(0.2, 1)], vec![lvl(3.0, 1)]));
        products.insert("C".to_string(), product(vec![lvl(9.0, 1)], vec![lvl(9.5, 1)]));
        let market = RawMarket { products, malformed: 0 };

        let out = normaliser().normalise(&market, ts());
        assert_eq!(out.iter().map(|p| p.product_id.as_str()).collect::<Vec<_>>(), vec!["A", "C"]);
        assert!(out.iter().all(|p| p.captured_at == ts()));
    }

    fn arb_level() -> impl Strategy<Value = RawLevel> {
        (0.0f64..50.0, 0u64..1_000_000, 0u32..500)
            .prop_map(|(price_per_unit, amount, orders)| RawLevel { price_per_unit, amount, orders })
    }

    proptest! {
        #[test]
        fn prop_kept_products_are_liquid_and_shallow(
            buy in prop::collection::vec(arb_level(), 0..12),
            sell in prop::collection::vec(arb_level(), 0..12),
        ) {
            let raw = product(buy.clone(), sell.clone());
            match normaliser().normalise_product("P", &raw, ts()) {
                Ok(p) => {
                    prop_assert!(buy[0].price_per_unit >= 0.7);
                    prop_assert!(sell[0].price_per_unit >= 0.7);
                    prop_assert!(!p.buy.is_empty() && p.buy.len() <= MAX_DEPTH);
                    prop_assert!(!p.sell.is_empty() && p.sell.len() <= MAX_DEPTH);
                    prop_assert!(p.buy.iter().chain(p.sell.iter()).all(|l| l.price > Decimal::ZERO));
                }
                Err(Rejection::EmptySide) => prop_assert!(buy.is_empty() || sell.is_empty()),
                Err(Rejection::Illiquid) => {
                    prop_assert!(buy[0].price_per_unit < 0.7 || sell[0].price_per_unit < 0.7)
                }
                Err(Rejection::Malformed) => prop_assert!(false, "finite prices are never malformed"),
            }
        }
    }
}
