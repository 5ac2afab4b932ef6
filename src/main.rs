//! Command-line entry point: bootstraps configuration, telemetry, and the
//! dependency container, then either starts the scheduled ingestion loop
//! or runs a one-off operator command.

use clap::{Parser, Subcommand};
use factory_core::config::Config;
use factory_core::container::Container;
use factory_core::scheduler::Scheduler;
use factory_core::{telemetry, CoreResult};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about = "Chocolate factory ingestion and forecasting core")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Directory for persisted state (AEMET token cache, SIAR CSV).
    #[arg(long, default_value = "state")]
    state_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduled ingestion/backfill/forecast loop (default).
    Serve,
    /// Forecast `hours` ahead using the current model, then exit.
    Forecast {
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Train the forecast model on `months_back` months of history, then exit.
    Train {
        #[arg(long, default_value_t = 12)]
        months_back: u32,
    },
    /// Run a one-off backfill over the trailing `days_back` days.
    Backfill {
        #[arg(long, default_value_t = 7)]
        days_back: i64,
    },
}

#[tokio::main]
async fn main() -> CoreResult<()> {
    telemetry::init();
    let args = Args::parse();
    let config = Config::load()?;
    let container = Container::build(&config, args.state_dir.clone());

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(container).await,
        Command::Forecast { hours } => run_forecast(container, hours).await,
        Command::Train { months_back } => run_train(container, months_back).await,
        Command::Backfill { days_back } => run_backfill(container, days_back).await,
    }
}

async fn run_serve(container: Container) -> CoreResult<()> {
    info!("starting chocolate factory core");
    let scheduler = Scheduler::new()
        .await
        .map_err(|e| factory_core::CoreError::Store(e.to_string()))?;

    scheduler
        .register_jobs(
            container.store.clone(),
            container.orchestrator.clone(),
            container.backfill.clone(),
            container.forecaster.clone(),
            container.analyzer.clone(),
            container.aemet.clone(),
        )
        .await
        .map_err(|e| factory_core::CoreError::Store(e.to_string()))?;

    scheduler
        .start()
        .await
        .map_err(|e| factory_core::CoreError::Store(e.to_string()))?;

    info!("scheduler started, entering run loop");
    let mut shutdown = tokio::signal::ctrl_c();
    tokio::select! {
        result = &mut shutdown => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for shutdown signal");
            }
        }
    }

    info!("shutdown requested, draining in-flight jobs");
    scheduler
        .shutdown()
        .await
        .map_err(|e| factory_core::CoreError::Store(e.to_string()))?;
    Ok(())
}

async fn run_forecast(container: Container, hours: u32) -> CoreResult<()> {
    container.forecaster.ensure_fresh().await?;
    let points = container.forecaster.forecast(hours).await?;
    for p in points {
        println!(
            "{}\t{:.4}\t[{:.4}, {:.4}]",
            p.timestamp.to_rfc3339(),
            p.price_eur_kwh,
            p.lower_bound,
            p.upper_bound
        );
    }
    Ok(())
}

async fn run_train(container: Container, months_back: u32) -> CoreResult<()> {
    let report = container.forecaster.train(months_back).await?;
    println!(
        "trained on {} rows: MAE={:.4} RMSE={:.4} R2={:.3} CI coverage={:.2} degraded={}",
        report.training_rows, report.mae, report.rmse, report.r_squared, report.ci_coverage, report.degraded
    );
    Ok(())
}

async fn run_backfill(container: Container, days_back: i64) -> CoreResult<()> {
    let report = container.backfill.run_manual(days_back).await?;
    println!(
        "backfill processed {} gaps, wrote {}/{} records ({:.1}% success)",
        report.gaps_processed,
        report.records_written,
        report.records_requested,
        report.per_source_success_rate() * 100.0
    );
    Ok(())
}
