//! skillgated - runs the pipeline's background loops until interrupted.
//!
//! One process per data directory: the aggregator folds new executions,
//! the rollback monitor watches serving skills, and the variation manager
//! spawns and concludes A/B trials. Ctrl-C stops all three after their
//! current tick.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use skillgate_core::{Pipeline, PipelineConfig, METRICS};
use tokio::sync::watch;
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "skillgated")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "skillgate background service", long_about = None)]
struct Args {
    /// Config file (default: $SKILLGATE_CONFIG, then <data-dir>/skillgate.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(long, env = "SKILLGATE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    skillgate_core::init_tracing(args.json, level);

    let mut config =
        PipelineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    let pipeline = Pipeline::open(config)
        .await
        .context("Failed to open skillgate stores")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %pipeline.config().data_dir.display(),
        "skillgated started"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let aggregator = pipeline.aggregator();
    let monitor = pipeline.monitor();
    let variation = pipeline.variation();
    let tasks = vec![
        tokio::spawn({
            let rx = shutdown_rx.clone();
            async move { aggregator.run(rx).await }
        }),
        tokio::spawn({
            let rx = shutdown_rx.clone();
            async move { monitor.run(rx).await }
        }),
        tokio::spawn(async move { variation.run(shutdown_rx).await }),
    ];

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "background task panicked");
        }
    }
    METRICS.flush();
    info!("skillgated stopped");
    Ok(())
}
