//! `extsync sweep`: retention sweep of the share directory.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tokio::sync::broadcast;

use extsync_cluster::run_share_sweeper;
use extsync_core::SyncConfig;
use extsync_fs::cleanup_expired;

/// Arguments for `extsync sweep`.
#[derive(Args, Debug)]
pub struct SweepArgs {
    /// Remove archives older than this many seconds (default:
    /// `archive_retention_secs` from config).
    #[arg(long, value_name = "SECS")]
    pub older_than: Option<u64>,

    /// Keep sweeping every `sweep_interval_secs` until interrupted.
    #[arg(long)]
    pub watch: bool,
}

impl SweepArgs {
    pub fn run(self, config: &SyncConfig) -> Result<()> {
        let retention = self
            .older_than
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.archive_retention());
        if self.watch {
            return watch(config, retention);
        }

        let report = cleanup_expired(&config.share_dir(), retention);
        for path in &report.removed {
            println!("  {} {}", "✗".red(), path.display());
        }
        println!(
            "{} removed {} archive(s), {} failure(s)",
            "✓".green(),
            report.removed.len(),
            report.failed.len()
        );
        if !report.failed.is_empty() {
            anyhow::bail!("{} archive(s) could not be removed", report.failed.len());
        }
        Ok(())
    }
}

fn watch(config: &SyncConfig, retention: Duration) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let sweeper = tokio::spawn(run_share_sweeper(
            config.share_dir(),
            retention,
            config.sweep_interval(),
            shutdown_rx,
        ));
        tokio::signal::ctrl_c()
            .await
            .context("ctrl-c handler failed")?;
        tracing::info!("received ctrl-c, stopping sweeper");
        let _ = shutdown_tx.send(());
        sweeper.await.context("sweeper task panicked")??;
        Ok::<(), anyhow::Error>(())
    })
}
