use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Deepest rank ever persisted per side.
pub const MAX_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    BUY,
    SELL
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::BUY => "BUY",
            Side::SELL => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "BUY" => Some(Side::BUY),
            "SELL" => Some(Side::SELL),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// One price level after normalisation (price already rounded)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Level {
    pub price: Decimal,
    pub amount: u64,
    pub orders: u32
}

// One observed price level at one instant, as persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketSnapshot {
    pub product_id: String,
    pub captured_at: DateTime<Utc>,
    pub side: Side,
    pub rank: u8,
    pub price: Decimal,
    pub amount: u64,
    pub order_count: u32
}

impl MarketSnapshot {
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            product_id: self.product_id.clone(),
            captured_at: self.captured_at,
            side: self.side,
            rank: self.rank,
        }
    }

    pub fn is_top_of_book(&self) -> bool {
        self.rank == 1
    }
}

// Uniqueness key of a snapshot row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotKey {
    pub product_id: String,
    pub captured_at: DateTime<Utc>,
    pub side: Side,
    pub rank: u8
}

// OHLCV record for one product, keyed by (product_id, window_end)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candle {
    pub product_id: String,
    pub window_end: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub buy_volume: u64,
    pub sell_volume: u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome { Inserted, Updated }

// Latest book for one product, both sides ascending by rank
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookDepth {
    pub captured_at: Option<DateTime<Utc>>,
    pub buy: Vec<Level>,
    pub sell: Vec<Level>
}
