//! fanout-fetch - fetch a batch manifest, every group and every item

use clap::Parser;
use fanout_fetch::{Config, FanOut, cancel_on_shutdown};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Resilient hierarchical HTTP fetcher
#[derive(Debug, Parser)]
#[command(name = "fanout-fetch", version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Where to write run metrics (overrides run.metrics_path)
    #[arg(short, long)]
    metrics: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match load_config(&cli).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(2);
        }
    };
    let metrics_path = config.run.metrics_path.clone();

    let fan_out = match FanOut::from_config(config) {
        Ok(fan_out) => fan_out,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(2);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));

    let report = fan_out.run(&cancel).await;
    cancel.cancel();

    if let Some(fault) = &report.final_fault {
        eprintln!("{}", fault.report());
    }
    if let Err(e) = report.persist(&metrics_path).await {
        tracing::error!(path = %metrics_path.display(), error = %e, "Failed to write run metrics");
    }

    tracing::info!(
        iterations = report.iterations,
        failures = report.failures,
        missing = report.missing.len(),
        succeeded = report.succeeded,
        "Run finished"
    );
    ExitCode::from(report.exit_code())
}

async fn load_config(cli: &Cli) -> fanout_fetch::Result<Config> {
    let mut config = Config::from_file(&cli.config).await?;
    if let Some(metrics) = &cli.metrics {
        config.run.metrics_path = metrics.clone();
    }
    config.validate()?;
    Ok(config)
}
