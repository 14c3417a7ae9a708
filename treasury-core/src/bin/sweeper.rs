//! Deadline sweep binary
//!
//! Runs the proposal deadline sweep on a fixed interval until Ctrl-C.

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use treasury_core::{Config, Treasury};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting treasury sweeper");

    let config = Config::from_env().context("loading configuration")?;
    let treasury = Treasury::open(config).context("opening treasury store")?;

    // Finish deletions interrupted by a previous crash before sweeping
    let resumed = treasury
        .deletion()
        .resume_pending_deletions()
        .context("resuming pending deletions")?;
    if resumed > 0 {
        tracing::info!(resumed, "Finished interrupted deletions");
    }

    if !treasury.config().scheduler.enabled {
        tracing::warn!("Scheduler disabled by configuration, running a single sweep");
        let summary = treasury.scheduler().run_once()?;
        tracing::info!(?summary, "Sweep finished");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(treasury.scheduler());
    let handle = tokio::spawn(scheduler.start(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down treasury sweeper");

    shutdown_tx.send(true)?;
    handle.await?;
    Ok(())
}
