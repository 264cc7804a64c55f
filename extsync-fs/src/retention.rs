//! Retention sweep for the shared archive directory.
//!
//! Deletes published `*.tgz` archives whose modification time is older than
//! a cutoff. Anything else in the share directory is left alone. The sweep
//! is best effort: one file's failure is logged and never blocks the rest.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::codec::ArchiveFormat;

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Delete archives in `share_dir` last modified before `cutoff`.
///
/// A missing `share_dir` is a no-op.
pub fn cleanup_share_files(share_dir: &Path, cutoff: SystemTime) -> SweepReport {
    let mut report = SweepReport::default();
    let entries = match fs::read_dir(share_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return report,
        Err(err) => {
            tracing::warn!(dir = %share_dir.display(), error = %err, "cannot read share directory");
            return report;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !is_archive(&path) {
            continue;
        }
        match sweep_one(&path, cutoff) {
            Ok(true) => {
                tracing::info!(archive = %path.display(), "removed expired archive");
                report.removed.push(path);
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(archive = %path.display(), error = %err, "failed to sweep archive");
                report.failed.push(path);
            }
        }
    }
    report
}

/// Sweep archives older than `retention` relative to now.
pub fn cleanup_expired(share_dir: &Path, retention: Duration) -> SweepReport {
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    cleanup_share_files(share_dir, cutoff)
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == ArchiveFormat::TarGz.extension())
}

fn sweep_one(path: &Path, cutoff: SystemTime) -> io::Result<bool> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_file() || meta.modified()? >= cutoff {
        return Ok(false);
    }
    fs::remove_file(path)?;
    Ok(true)
}
