//! Drives the ingest cycle and the coarser aggregation cadence.
//!
//! One worker, one cycle at a time: fetch, filter, store, then aggregate and
//! sweep when the candle interval has elapsed. A stop request is only observed
//! between cycles.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Settings, StorageFailurePolicy};
use crate::engine::candles::{AggregationReport, CandleAggregator};
use crate::engine::retention::RetentionSweeper;
use crate::market_data::adapters::MarketSource;
use crate::market_data::normaliser::Normaliser;
use crate::persist::snapshot::rows_from_products;
use crate::persist::{with_timeout, CandleStore, PersistError, SnapshotStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Fetching,
    Storing,
    Aggregating,
    Stopped,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage failure while {stage}: {source}")]
    Storage {
        stage: &'static str,
        #[source]
        source: PersistError,
    },
}

impl SchedulerError {
    fn storage(stage: &'static str) -> impl FnOnce(PersistError) -> SchedulerError {
        move |source| SchedulerError::Storage { stage, source }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub fetch_interval: Duration,
    pub candle_interval: Duration,
    pub storage_timeout: Duration,
    pub on_storage_failure: StorageFailurePolicy,
}

impl From<&Settings> for SchedulerConfig {
    fn from(s: &Settings) -> Self {
        Self {
            fetch_interval: s.fetch_interval(),
            candle_interval: s.candle_interval(),
            storage_timeout: s.storage_timeout(),
            on_storage_failure: s.on_storage_failure,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub fetched: bool,
    pub kept_products: usize,
    pub stored_rows: u64,
    pub aggregation: Option<AggregationReport>,
    pub swept_rows: u64,
}

pub struct Scheduler<F, S> {
    source: F,
    normaliser: Normaliser,
    store: Arc<S>,
    aggregator: CandleAggregator,
    sweeper: RetentionSweeper,
    config: SchedulerConfig,
    last_aggregation: Instant,
    state_tx: watch::Sender<SchedulerState>,
}

impl<F, S> Scheduler<F, S>
where
    F: MarketSource,
    S: SnapshotStore + CandleStore,
{
    /// The lookback window of each aggregation pass equals the candle interval.
    pub fn new(config: SchedulerConfig, source: F, normaliser: Normaliser, store: Arc<S>) -> Self {
        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        Self {
            aggregator: CandleAggregator::new(config.candle_interval, config.storage_timeout),
            sweeper: RetentionSweeper::new(config.storage_timeout),
            last_aggregation: Instant::now(),
            source,
            normaliser,
            store,
            config,
            state_tx,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SchedulerState) {
        debug!(?state, "Scheduler state");
        self.state_tx.send_replace(state);
    }

    /// Run cycles on every fetch tick until `stop` turns true or its sender is dropped.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        let mut ticker = tokio::time::interval(self.config.fetch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            fetch_interval_secs = self.config.fetch_interval.as_secs(),
            candle_interval_secs = self.config.candle_interval.as_secs(),
            "Starting bazaar data pipeline"
        );

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            // Never raced against the stop signal
            if let Err(e) = self.run_cycle().await {
                metrics::counter!("bazaar_cycle_failures_total").increment(1);
                match self.config.on_storage_failure {
                    StorageFailurePolicy::Continue => {
                        error!(error = %e, "Cycle failed, retrying on next tick");
                    }
                    StorageFailurePolicy::Stop => {
                        error!(error = %e, "Cycle failed, stopping");
                        self.set_state(SchedulerState::Stopped);
                        return Err(e);
                    }
                }
            }
        }

        self.set_state(SchedulerState::Stopped);
        info!("Scheduler stopped");
        Ok(())
    }

    /// One full cycle. Fetch failures are absorbed; storage failures are returned.
    #[instrument(skip(self))]
    pub async fn run_cycle(&mut self) -> Result<CycleReport, SchedulerError> {
        let result = self.cycle_body().await;
        self.set_state(SchedulerState::Idle);
        result
    }

    async fn cycle_body(&mut self) -> Result<CycleReport, SchedulerError> {
        let mut report = CycleReport::default();
        let limit = self.config.storage_timeout;

        self.set_state(SchedulerState::Fetching);
        match self.source.fetch().await {
            Ok(market) => {
                report.fetched = true;
                let products = self.normaliser.normalise(&market, Utc::now());
                report.kept_products = products.len();
                metrics::gauge!("bazaar_products_kept").set(products.len() as f64);

                if !products.is_empty() {
                    self.set_state(SchedulerState::Storing);
                    let rows = rows_from_products(&products);
                    report.stored_rows = with_timeout("insert_snapshots", limit, self.store.insert_snapshots(&rows))
                        .await
                        .map_err(SchedulerError::storage("storing snapshots"))?;
                    metrics::counter!("bazaar_snapshots_stored_total").increment(report.stored_rows);
                    info!(rows = rows.len(), inserted = report.stored_rows, "Stored order book entries");
                }
            }
            Err(e) => {
                metrics::counter!("bazaar_fetch_failures_total").increment(1);
                warn!(error = %e, "Fetch failed, nothing stored this cycle");
            }
        }

        let elapsed = self.last_aggregation.elapsed();
        if elapsed >= self.config.candle_interval {
            self.set_state(SchedulerState::Aggregating);
            debug!(elapsed_secs = elapsed.as_secs(), "Candle interval reached");
            let aggregation = self
                .aggregator
                .aggregate(self.store.as_ref(), Utc::now())
                .await
                .map_err(SchedulerError::storage("aggregating candles"))?;
            // Only reached when aggregation succeeded
            report.swept_rows = self
                .sweeper
                .sweep(self.store.as_ref(), &aggregation)
                .await
                .map_err(SchedulerError::storage("sweeping snapshots"))?;
            report.aggregation = Some(aggregation);
            self.last_aggregation = Instant::now();
        }

        Ok(report)
    }
}
