pub mod types;
pub mod candles;    // OHLCV fold + upsert
pub mod retention;  // snapshot cleanup after aggregation
