//! Pure conversions between normalised products and persisted snapshot rows.
//!
//! This file MUST NOT talk to the database. Only struct <-> struct mapping lives here.

use crate::engine::types::{Level, MarketSnapshot, Side};
use crate::market_data::normaliser::NormalisedProduct;

/// Flatten a batch of products into snapshot rows.
/// - Ranks start at 1 (best level) and follow the level order of each side.
/// - Every row carries the product's capture timestamp.
pub fn rows_from_products(products: &[NormalisedProduct]) -> Vec<MarketSnapshot> {
    let mut rows = Vec::with_capacity(products.iter().map(|p| p.buy.len() + p.sell.len()).sum());
    for product in products {
        push_side(&mut rows, product, Side::BUY, &product.buy);
        push_side(&mut rows, product, Side::SELL, &product.sell);
    }
    rows
}

fn push_side(rows: &mut Vec<MarketSnapshot>, product: &NormalisedProduct, side: Side, levels: &[Level]) {
    for (i, level) in levels.iter().enumerate() {
        rows.push(MarketSnapshot {
            product_id: product.product_id.clone(),
            captured_at: product.captured_at,
            side,
            rank: (i + 1) as u8,
            price: level.price,
            amount: level.amount,
            order_count: level.orders,
        });
    }
}

/// Regroup rows of one product and one timestamp into ranked levels.
/// Rows of other sides are ignored; output is ascending by rank.
pub fn levels_for_side(rows: &[MarketSnapshot], side: Side) -> Vec<Level> {
    let mut picked: Vec<&MarketSnapshot> = rows.iter().filter(|r| r.side == side).collect();
    picked.sort_by_key(|r| r.rank);
    picked
        .into_iter()
        .map(|r| Level { price: r.price, amount: r.amount, orders: r.order_count })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use smallvec::smallvec;

    fn level(price: i64, amount: u64) -> Level {
        Level { price: Decimal::new(price, 0), amount, orders: 1 }
    }

    #[test]
    fn test_rows_are_ranked_per_side() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let product = NormalisedProduct {
            product_id: "ENCHANTED_GOLD".into(),
            captured_at: ts,
            buy: smallvec![level(10, 5), level(9, 7)],
            sell: smallvec![level(11, 3)],
        };
        let rows = rows_from_products(&[product]);

        assert_eq!(rows.len(), 3);
        assert_eq!((rows[0].side, rows[0].rank, rows[0].amount), (Side::BUY, 1, 5));
        assert_eq!((rows[1].side, rows[1].rank, rows[1].amount), (Side::BUY, 2, 7));
        assert_eq!((rows[2].side, rows[2].rank, rows[2].amount), (Side::SELL, 1, 3));
        assert!(rows.iter().all(|r| r.captured_at == ts));
    }

    #[test]
    fn test_levels_for_side_sorts_by_rank() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let product = NormalisedProduct {
            product_id: "X".into(),
            captured_at: ts,
            buy: smallvec![level(10, 1), level(9, 2), level(8, 3)],
            sell: smallvec![level(12, 4)],
        };
        let mut rows = rows_from_products(&[product]);
        rows.reverse();

        let buys = levels_for_side(&rows, Side::BUY);
        assert_eq!(buys.iter().map(|l| l.amount).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(levels_for_side(&rows, Side::SELL).len(), 1);
    }
}
