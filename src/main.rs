use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use session_forecast::{
    AppConfig, Clock, CsvStore, ForecastStore, PostgresStore, RestStore, StoreBackend,
    SystemClock, csv_store, forecast::default_start_date, pipeline,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "session-forecast")]
#[command(about = "Forecast per-session attendance and capacity risk for upcoming business days")]
struct Args {
    /// Number of calendar days to forecast, starting at the start date
    #[arg(long)]
    horizon_days: Option<i64>,

    /// First forecast date (YYYY-MM-DD); defaults to tomorrow
    #[arg(long)]
    start_date: Option<NaiveDate>,

    /// Data store to read inputs from and write forecasts to
    #[arg(long, value_enum)]
    backend: Option<StoreBackend>,

    /// Directory of input CSV files for the csv backend
    #[arg(long)]
    csv_dir: Option<PathBuf>,

    /// Compute the forecast without writing it to the store
    #[arg(long)]
    dry_run: bool,

    /// Also write the forecast rows to this CSV file
    #[arg(long)]
    export: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .parse_lossy("session_forecast=debug");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let mut config = AppConfig::load().context("Failed to load configuration")?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid command-line overrides")?;

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    rt.block_on(run(config, args, &SystemClock))
}

fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(horizon) = args.horizon_days {
        config.forecast.forecast_horizon_days = horizon;
    }
    if let Some(backend) = args.backend {
        config.store.backend = backend;
    }
    if let Some(dir) = &args.csv_dir {
        config.store.csv_dir = dir.clone();
    }
}

async fn run(config: AppConfig, args: Args, clock: &dyn Clock) -> Result<()> {
    let start_date = args
        .start_date
        .unwrap_or_else(|| default_start_date(clock));

    tracing::info!(
        "Starting session forecast: backend={:?}, start={}, horizon={} days{}",
        config.store.backend,
        start_date,
        config.forecast.forecast_horizon_days,
        if args.dry_run { " (dry run)" } else { "" }
    );

    match config.store.backend {
        StoreBackend::Postgres => {
            let url = config
                .store
                .database_url
                .as_deref()
                .context("store.database_url (or DATABASE_URL) is not set")?;
            tracing::info!("Connecting to database...");
            let store = PostgresStore::new(url, &config.store.forecast_table).await?;
            tracing::info!("Database connected successfully");
            forecast_with(&store, &config, start_date, &args).await
        }
        StoreBackend::Rest => {
            let store = RestStore::from_config(&config.store, &config.network)?;
            tracing::info!("REST client initialized");
            forecast_with(&store, &config, start_date, &args).await
        }
        StoreBackend::Csv => {
            let store = CsvStore::new(&config.store.csv_dir, &config.store.forecast_table);
            forecast_with(&store, &config, start_date, &args).await
        }
    }
}

async fn forecast_with<S: ForecastStore>(
    store: &S,
    config: &AppConfig,
    start_date: NaiveDate,
    args: &Args,
) -> Result<()> {
    let output =
        pipeline::run_with_store(store, &config.forecast, start_date, args.dry_run).await?;

    if let Some(path) = &args.export {
        let path = path.clone();
        let rows = output.rows.clone();
        let written = path.clone();
        tokio::task::spawn_blocking(move || csv_store::write_forecasts_csv(&path, &rows))
            .await
            .context("CSV export task failed")??;
        tracing::info!("Exported {} rows to {}", output.rows.len(), written.display());
    }

    tracing::info!("Forecast run complete");
    Ok(())
}
