use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ethpulse_core::{RunState, TierSpec};
use ethpulse_storage::PgMetricStore;
use ethpulse_sync::{MetricRegistry, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ethpulse")]
#[command(about = "Daily Ethereum network, market and DeFi metrics ingest")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve and store every metric (the default).
    Sync(SyncArgs),
    /// Create bookkeeping and metric tables.
    Migrate,
    /// List the metric registry.
    Metrics,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Only sync this metric; repeatable.
    #[arg(long = "only", value_name = "NAME")]
    only: Vec<String>,
    /// Write to an in-memory store instead of Postgres.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    history_days: Option<u32>,
    #[arg(long)]
    batch_size: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => sync(config, args).await,
        Commands::Migrate => {
            let registry = MetricRegistry::load(&config.metrics_file).await?;
            let store = PgMetricStore::connect(&config.store_config())
                .await
                .context("connecting to the metric store")?;
            store
                .ensure_schema(&registry.metrics)
                .await
                .context("creating schema")?;
            info!(tables = registry.metrics.len(), "schema ready");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Metrics => {
            let registry = MetricRegistry::load(&config.metrics_file).await?;
            for metric in &registry.metrics {
                let tiers: Vec<&str> = metric.tiers.iter().map(TierSpec::source).collect();
                println!(
                    "{:<24} {:<32} {}",
                    metric.name,
                    metric.table,
                    tiers.join(" > ")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn sync(mut config: SyncConfig, args: SyncArgs) -> Result<ExitCode> {
    config.only = args.only;
    config.dry_run = args.dry_run;
    if let Some(days) = args.history_days.filter(|d| *d > 0) {
        config.history_days = days;
    }
    if let Some(size) = args.batch_size.filter(|s| *s > 0) {
        config.batch_size = size;
    }

    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.control().cancel_on_ctrl_c();
    let summary = pipeline.run_once().await?;

    for outcome in &summary.outcomes {
        let quality = outcome.quality.map(|q| q.as_str()).unwrap_or("-");
        match (&outcome.state, &outcome.error) {
            (RunState::Failed, Some(error)) => {
                println!("{:<24} failed   {error}", outcome.metric);
            }
            (state, _) => println!(
                "{:<24} {:<8} {:<9} {} records{}",
                outcome.metric,
                state.as_str(),
                quality,
                outcome.records,
                if outcome.unchanged { " (unchanged)" } else { "" }
            ),
        }
    }
    println!(
        "sync complete: run_id={} succeeded={} partial={} failed={} estimated={} rows_written={}",
        summary.run_id,
        summary.succeeded,
        summary.partial,
        summary.failed,
        summary.estimated,
        summary.rows_written
    );

    Ok(if summary.has_failures() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}
