//! Periodic retention sweep of the share directory.
//!
//! Stateless and idempotent: each tick removes published archives older
//! than the retention window. The filesystem work runs on the blocking pool.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::broadcast;

use extsync_fs::cleanup_expired;

use crate::error::ClusterError;

/// Sweep `share_dir` every `period` until `shutdown` fires.
///
/// The first sweep runs immediately. Sweep errors are logged per file and
/// never stop the task.
pub async fn run_share_sweeper(
    share_dir: PathBuf,
    retention: Duration,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ClusterError> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tracing::info!(
        share_dir = %share_dir.display(),
        retention_secs = retention.as_secs(),
        period_secs = period.as_secs(),
        "share sweeper started"
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {
                let dir = share_dir.clone();
                match tokio::task::spawn_blocking(move || cleanup_expired(&dir, retention)).await {
                    Ok(report) if !report.removed.is_empty() || !report.failed.is_empty() => {
                        tracing::info!(
                            removed = report.removed.len(),
                            failed = report.failed.len(),
                            "share sweep finished"
                        );
                    }
                    Ok(_) => tracing::debug!("share sweep found nothing to remove"),
                    Err(err) => tracing::warn!(error = %err, "share sweep task failed"),
                }
            }
        }
    }
    tracing::info!("share sweeper stopped");
    Ok(())
}
