use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info, instrument};

use crate::engine::types::{BookDepth, Candle, MarketSnapshot, Side, UpsertOutcome};
use crate::persist::snapshot::levels_for_side;
use crate::persist::types::{PersistError, PersistResult};
use crate::persist::{CandleStore, SnapshotStore};

// 7 binds per row, Postgres caps a statement at 65535 binds
const ROWS_PER_STATEMENT: usize = 1000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS order_book_snapshot (
    product_id VARCHAR(50) NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL,
    side VARCHAR(4) NOT NULL,
    rank INT NOT NULL,
    price DECIMAL(15,2) NOT NULL,
    amount BIGINT NOT NULL,
    orders INT NOT NULL,
    PRIMARY KEY (product_id, timestamp, side, rank)
);
CREATE INDEX IF NOT EXISTS idx_orderbook_cleanup
    ON order_book_snapshot(timestamp);
CREATE INDEX IF NOT EXISTS idx_orderbook_product_time
    ON order_book_snapshot(product_id, timestamp, side, rank);

CREATE TABLE IF NOT EXISTS candles (
    id SERIAL PRIMARY KEY,
    product_id VARCHAR(50) NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL,
    open DECIMAL(15,2) NOT NULL,
    high DECIMAL(15,2) NOT NULL,
    low DECIMAL(15,2) NOT NULL,
    close DECIMAL(15,2) NOT NULL,
    buy_volume BIGINT NOT NULL,
    sell_volume BIGINT NOT NULL,
    UNIQUE (product_id, timestamp)
);
CREATE INDEX IF NOT EXISTS idx_candles_product_time
    ON candles(product_id, timestamp DESC);
"#;

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    product_id: String,
    timestamp: DateTime<Utc>,
    side: String,
    rank: i32,
    price: Decimal,
    amount: i64,
    orders: i32,
}

impl TryFrom<SnapshotRow> for MarketSnapshot {
    type Error = PersistError;

    fn try_from(row: SnapshotRow) -> PersistResult<Self> {
        let side = Side::parse(&row.side)
            .ok_or_else(|| PersistError::FormatMismatch(format!("unknown side {:?}", row.side)))?;
        let bad = |field: &str| PersistError::FormatMismatch(format!("{} out of range for {}", field, row.product_id));
        Ok(MarketSnapshot {
            side,
            rank: u8::try_from(row.rank).map_err(|_| bad("rank"))?,
            amount: u64::try_from(row.amount).map_err(|_| bad("amount"))?,
            order_count: u32::try_from(row.orders).map_err(|_| bad("orders"))?,
            price: row.price,
            captured_at: row.timestamp,
            product_id: row.product_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CandleRow {
    product_id: String,
    timestamp: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    buy_volume: i64,
    sell_volume: i64,
}

impl TryFrom<CandleRow> for Candle {
    type Error = PersistError;

    fn try_from(row: CandleRow) -> PersistResult<Self> {
        let bad = |field: &str| PersistError::FormatMismatch(format!("{} negative for {}", field, row.product_id));
        Ok(Candle {
            buy_volume: u64::try_from(row.buy_volume).map_err(|_| bad("buy_volume"))?,
            sell_volume: u64::try_from(row.sell_volume).map_err(|_| bad("sell_volume"))?,
            window_end: row.timestamp,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            product_id: row.product_id,
        })
    }
}

fn to_bigint(v: u64, what: &str) -> PersistResult<i64> {
    i64::try_from(v).map_err(|_| PersistError::Rejected(format!("{} {} exceeds BIGINT", what, v)))
}

/// Snapshot and candle relations behind one connection pool.
pub struct PostgresStore {
    connection_pool: sqlx::PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32, acquire_timeout: Duration) -> PersistResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        info!(max_connections, "Connected to Postgres");
        Ok(Self { connection_pool: pool })
    }

    /// Create both relations and their indexes if they are missing.
    pub async fn ensure_schema(&self) -> PersistResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.connection_pool).await?;
        info!("Schema ensured");
        Ok(())
    }
}

#[async_trait::async_trait]
impl SnapshotStore for PostgresStore {
    #[instrument(skip_all, fields(rows = rows.len()))]
    async fn insert_snapshots(&self, rows: &[MarketSnapshot]) -> PersistResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        for row in rows {
            to_bigint(row.amount, "amount")?;
            i32::try_from(row.order_count)
                .map_err(|_| PersistError::Rejected(format!("orders {} exceeds INT", row.order_count)))?;
        }

        let mut tx = self.connection_pool.begin().await?;
        let mut inserted = 0;
        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO order_book_snapshot (product_id, timestamp, side, rank, price, amount, orders) ",
            );
            // Ranges were checked above
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.product_id.clone())
                    .push_bind(row.captured_at)
                    .push_bind(row.side.as_str())
                    .push_bind(i32::from(row.rank))
                    .push_bind(row.price)
                    .push_bind(row.amount as i64)
                    .push_bind(row.order_count as i32);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            let res = qb.build().execute(&mut *tx).await?;
            inserted += res.rows_affected();
        }
        tx.commit().await?;
        debug!(inserted, skipped = rows.len() as u64 - inserted, "Snapshot batch committed");
        Ok(inserted)
    }

    async fn products_since(&self, cutoff: DateTime<Utc>) -> PersistResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT product_id
            FROM order_book_snapshot
            WHERE timestamp >= $1
            ORDER BY product_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.connection_pool)
        .await?;
        Ok(ids)
    }

    async fn top_of_book_since(&self, cutoff: DateTime<Utc>) -> PersistResult<Vec<MarketSnapshot>> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT product_id, timestamp, side, rank, price, amount, orders
            FROM order_book_snapshot
            WHERE timestamp >= $1
            AND rank = 1
            ORDER BY product_id, timestamp ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.connection_pool)
        .await?;
        rows.into_iter().map(MarketSnapshot::try_from).collect()
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> PersistResult<u64> {
        let res = sqlx::query("DELETE FROM order_book_snapshot WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.connection_pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn latest_book(&self, product_id: &str, depth: usize) -> PersistResult<BookDepth> {
        let latest = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(timestamp) FROM order_book_snapshot WHERE product_id = $1",
        )
        .bind(product_id)
        .fetch_one(&self.connection_pool)
        .await?;

        let Some(at) = latest else {
            return Ok(BookDepth::default());
        };

        let rows = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT product_id, timestamp, side, rank, price, amount, orders
            FROM order_book_snapshot
            WHERE product_id = $1
            AND timestamp = $2
            AND rank <= $3
            ORDER BY side, rank ASC
            "#,
        )
        .bind(product_id)
        .bind(at)
        .bind(depth as i32)
        .fetch_all(&self.connection_pool)
        .await?;
        let rows = rows
            .into_iter()
            .map(MarketSnapshot::try_from)
            .collect::<PersistResult<Vec<_>>>()?;

        Ok(BookDepth {
            captured_at: Some(at),
            buy: levels_for_side(&rows, Side::BUY),
            sell: levels_for_side(&rows, Side::SELL),
        })
    }
}

#[async_trait::async_trait]
impl CandleStore for PostgresStore {
    async fn upsert_candle(&self, candle: &Candle) -> PersistResult<UpsertOutcome> {
        // xmax is 0 only for a freshly inserted tuple
        let inserted = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO candles
            (product_id, timestamp, open, high, low, close, buy_volume, sell_volume)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (product_id, timestamp)
            DO UPDATE SET
                open = EXCLUDED.open,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                buy_volume = EXCLUDED.buy_volume,
                sell_volume = EXCLUDED.sell_volume
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&candle.product_id)
        .bind(candle.window_end)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(to_bigint(candle.buy_volume, "buy_volume")?)
        .bind(to_bigint(candle.sell_volume, "sell_volume")?)
        .fetch_one(&self.connection_pool)
        .await?;

        Ok(if inserted { UpsertOutcome::Inserted } else { UpsertOutcome::Updated })
    }

    async fn candle_products(&self) -> PersistResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>("SELECT DISTINCT product_id FROM candles ORDER BY product_id")
            .fetch_all(&self.connection_pool)
            .await?;
        Ok(ids)
    }

    async fn candles_since(&self, product_id: &str, since: DateTime<Utc>) -> PersistResult<Vec<Candle>> {
        let rows = sqlx::query_as::<_, CandleRow>(
            r#"
            SELECT product_id, timestamp, open, high, low, close, buy_volume, sell_volume
            FROM candles
            WHERE product_id = $1
            AND timestamp >= $2
            ORDER BY timestamp ASC
            "#,
        )
        .bind(product_id)
        .bind(since)
        .fetch_all(&self.connection_pool)
        .await?;
        rows.into_iter().map(Candle::try_from).collect()
    }
}
