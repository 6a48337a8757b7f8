use std::sync::Arc;

use anyhow::Context;
use bazaar_candles::config::Settings;
use bazaar_candles::market_data::adapters::hypixel::HypixelAdapter;
use bazaar_candles::market_data::normaliser::Normaliser;
use bazaar_candles::persist::memory::MemoryStore;
use bazaar_candles::persist::postgres::PostgresStore;
use bazaar_candles::persist::{CandleStore, SnapshotStore};
use bazaar_candles::scheduler::{Scheduler, SchedulerConfig};
use bazaar_candles::telemetry;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "bazaar-candles", version, about = "Samples bazaar order books and folds them into OHLCV candles")]
struct Cli {
    /// Settings file (TOML); missing is fine
    #[arg(long, default_value = "bazaar.toml")]
    config: String,
    /// Run a single fetch/store cycle and exit
    #[arg(long)]
    once: bool,
    /// Create the snapshot and candle tables before starting
    #[arg(long)]
    init_schema: bool,
    /// Keep everything in memory instead of Postgres
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env
    let cli = Cli::parse();

    let settings = Settings::load(&cli.config).context("loading settings")?;
    telemetry::init_tracing(&settings.log_filter);
    telemetry::init_metrics()?;

    let source = HypixelAdapter::new(&settings.source_url, settings.fetch_timeout())?;
    let normaliser = Normaliser::new(settings.min_price_decimal(), settings.max_depth);

    if cli.dry_run {
        info!("Dry run, using in-memory store");
        return run(cli.once, &settings, source, normaliser, Arc::new(MemoryStore::new())).await;
    }

    let db_url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL (or database_url in settings) is required unless --dry-run")?;
    let store = PostgresStore::connect(db_url, settings.max_connections, settings.storage_timeout()).await?;
    if cli.init_schema {
        store.ensure_schema().await?;
    }
    run(cli.once, &settings, source, normaliser, Arc::new(store)).await
}

async fn run<S>(
    once: bool,
    settings: &Settings,
    source: HypixelAdapter,
    normaliser: Normaliser,
    store: Arc<S>,
) -> anyhow::Result<()>
where
    S: SnapshotStore + CandleStore + 'static,
{
    let mut scheduler = Scheduler::new(SchedulerConfig::from(settings), source, normaliser, store);

    if once {
        let report = scheduler.run_cycle().await?;
        info!(kept = report.kept_products, stored = report.stored_rows, "Single cycle complete");
        return Ok(());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Stop requested, finishing current cycle");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                // Dropping the sender would stop the scheduler
                error!(error = %e, "Could not listen for Ctrl+C");
                let _keep = stop_tx;
                std::future::pending::<()>().await;
            }
        }
    });

    scheduler.run(stop_rx).await?;
    Ok(())
}
