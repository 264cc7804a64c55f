//! Converging a live extension directory to a distributed archive.
//!
//! ## `atomic_replace` protocol
//!
//! 1. Target missing: create its parent, move source into place. Done.
//! 2. Move target aside to `<target>.bak-<epochMillis>`. If that fails, a
//!    partial backup is removed, and a partly deleted target is refilled
//!    from the complete backup copy.
//! 3. Move source into target. On failure, move the backup back and return
//!    the original error.
//! 4. Remove the backup.
//!
//! A move is a `rename`; when that fails (typically across volumes) it falls
//! back to copy-then-delete, and the source is only deleted once the copy is
//! complete.
//!
//! ## `overlay`
//!
//! Copies every regular file of source over target at the same relative
//! path. Nothing in target is ever deleted.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use walkdir::WalkDir;

use extsync_core::error::io_err;
use extsync_core::{Clock, Extension, SyncError, SyncType, SystemClock};

use crate::codec::ArchiveFormat;
use crate::store::ExtensionStore;

/// Default bound on a single unpack operation.
pub const DEFAULT_UNPACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Applies downloaded archives to live extension directories.
///
/// Concurrent applies for different extensions are independent (each uses
/// its own staging subdirectory). Applies for the same extension must be
/// serialized by the caller.
#[derive(Clone)]
pub struct ApplyEngine {
    store: ExtensionStore,
    format: ArchiveFormat,
    unpack_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ApplyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyEngine")
            .field("store", &self.store)
            .field("format", &self.format)
            .field("unpack_timeout", &self.unpack_timeout)
            .finish_non_exhaustive()
    }
}

impl ApplyEngine {
    pub fn new(store: ExtensionStore) -> Self {
        Self {
            store,
            format: ArchiveFormat::TarGz,
            unpack_timeout: DEFAULT_UNPACK_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock used for backup directory names.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_unpack_timeout(mut self, timeout: Duration) -> Self {
        self.unpack_timeout = timeout;
        self
    }

    pub fn store(&self) -> &ExtensionStore {
        &self.store
    }

    /// Extract `archive` into a fresh staging subdirectory, then converge
    /// `extension_root` to it according to `sync_type`.
    pub fn apply_extension_sync(
        &self,
        extension: &Extension,
        sync_type: SyncType,
        archive: &Path,
        extension_root: &Path,
    ) -> Result<(), SyncError> {
        let staging = self.store.fresh_staging_dir("apply-")?;
        let extracted = staging.path().join(extension.dir_name());

        if !self
            .store
            .unpack_archive(self.format, archive, &extracted, self.unpack_timeout)
        {
            return Err(SyncError::IoFailure(format!(
                "failed to extract archive {} for extension {}",
                archive.display(),
                extension.name
            )));
        }

        match sync_type {
            SyncType::Complete => {
                atomic_replace_with(&extracted, extension_root, self.clock.as_ref(), &move_dir)?
            }
            SyncType::Partial => overlay(&extracted, extension_root)?,
        }

        tracing::info!(
            extension = %extension.name,
            sync_type = %sync_type,
            root = %extension_root.display(),
            "applied extension archive"
        );
        // `staging` drops here and removes whatever is left of the extraction.
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// atomic_replace
// ---------------------------------------------------------------------------

/// Swap `target` for `source` so that `target` is only ever observed fully
/// old or fully new.
pub fn atomic_replace(source: &Path, target: &Path) -> Result<(), SyncError> {
    atomic_replace_with(source, target, &SystemClock, &move_dir)
}

/// Why a move did not complete.
#[derive(Debug)]
pub(crate) enum MoveError {
    /// Nothing was moved and `from` is intact.
    NotMoved(io::Error),
    /// `to` holds a complete copy, but `from` was only partly removed.
    SourceLeft(io::Error),
}

impl MoveError {
    fn into_io(self) -> io::Error {
        match self {
            MoveError::NotMoved(err) | MoveError::SourceLeft(err) => err,
        }
    }
}

type MoveFn<'a> = &'a dyn Fn(&Path, &Path) -> Result<(), MoveError>;

fn atomic_replace_with(
    source: &Path,
    target: &Path,
    clock: &dyn Clock,
    mv: MoveFn<'_>,
) -> Result<(), SyncError> {
    if !source.is_dir() {
        return Err(SyncError::not_found(format!(
            "source directory {}",
            source.display()
        )));
    }

    if !target.exists() {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        return install(source, target, mv);
    }

    let backup = backup_path(target, clock.now_millis());
    if let Err(err) = mv(target, &backup) {
        undo_backup(&err, &backup, target);
        return Err(io_err(&backup, err.into_io()));
    }

    if let Err(err) = install(source, target, mv) {
        restore_backup(&backup, target, mv);
        return Err(err);
    }

    if let Err(err) = std::fs::remove_dir_all(&backup) {
        tracing::warn!(
            backup = %backup.display(),
            error = %err,
            "failed to remove backup after replace; leaving it for cleanup"
        );
    }
    Ok(())
}

/// Move `source` into `target`. A leftover source is only logged: `target`
/// is already complete and the staging area is discarded anyway.
fn install(source: &Path, target: &Path, mv: MoveFn<'_>) -> Result<(), SyncError> {
    match mv(source, target) {
        Ok(()) => Ok(()),
        Err(MoveError::SourceLeft(err)) => {
            tracing::warn!(source = %source.display(), error = %err, "staged tree left behind");
            Ok(())
        }
        Err(MoveError::NotMoved(err)) => Err(io_err(target, err)),
    }
}

/// `<target>.bak-<epochMillis>`
fn backup_path(target: &Path, millis: i64) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "extension".to_string());
    target.with_file_name(format!("{name}.bak-{millis}"))
}

/// Roll back a failed "move target aside" step.
///
/// `NotMoved` leaves `target` untouched, so only a stray backup is removed.
/// `SourceLeft` means the backup is complete while `target` may be partly
/// deleted: the backup is copied back over it, or renamed into place if
/// nothing is left.
fn undo_backup(err: &MoveError, backup: &Path, target: &Path) {
    match err {
        MoveError::NotMoved(_) => {
            if backup.exists() {
                if let Err(err) = std::fs::remove_dir_all(backup) {
                    tracing::warn!(backup = %backup.display(), error = %err, "failed to remove partial backup");
                }
            }
        }
        MoveError::SourceLeft(_) => {
            let restored = if target.exists() {
                copy_tree_io(backup, target)
            } else {
                std::fs::rename(backup, target)
            };
            match restored {
                Ok(()) => {
                    if backup.exists() {
                        if let Err(err) = std::fs::remove_dir_all(backup) {
                            tracing::warn!(backup = %backup.display(), error = %err, "failed to remove backup");
                        }
                    }
                    tracing::warn!(target = %target.display(), "backup failed; original restored");
                }
                Err(err) => tracing::error!(
                    backup = %backup.display(),
                    target = %target.display(),
                    error = %err,
                    "backup failed and restoring the original also failed"
                ),
            }
        }
    }
}

/// Best effort: the replace error already dominates, so a failed restore is
/// only logged.
fn restore_backup(backup: &Path, target: &Path, mv: MoveFn<'_>) {
    if target.exists() {
        if let Err(err) = std::fs::remove_dir_all(target) {
            tracing::warn!(target = %target.display(), error = %err, "failed to clear half-installed target");
        }
    }
    match mv(backup, target) {
        Ok(()) => tracing::warn!(target = %target.display(), "replace failed; original restored"),
        Err(err) => tracing::error!(
            backup = %backup.display(),
            target = %target.display(),
            error = %err.into_io(),
            "replace failed and restoring the original also failed"
        ),
    }
}

/// `rename`, falling back to copy-then-delete.
pub(crate) fn move_dir(from: &Path, to: &Path) -> Result<(), MoveError> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tracing::debug!(
                from = %from.display(),
                to = %to.display(),
                error = %rename_err,
                "rename failed, falling back to copy"
            );
            if let Err(copy_err) = copy_tree_io(from, to) {
                let _ = std::fs::remove_dir_all(to);
                return Err(MoveError::NotMoved(copy_err));
            }
            std::fs::remove_dir_all(from).map_err(MoveError::SourceLeft)
        }
    }
}

// ---------------------------------------------------------------------------
// overlay
// ---------------------------------------------------------------------------

/// Copy every regular file under `source` to the same relative path under
/// `target`, replacing existing files and never deleting anything.
pub fn overlay(source: &Path, target: &Path) -> Result<(), SyncError> {
    std::fs::create_dir_all(target).map_err(|e| io_err(target, e))?;
    let mut copied = 0usize;
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| io_err(source, io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io_err(entry.path(), io::Error::other(e)))?;
        let dest = target.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        replace_file(entry.path(), &dest)?;
        copied += 1;
    }
    tracing::debug!(target = %target.display(), copied, "overlay complete");
    Ok(())
}

/// Copy to a temporary sibling, then rename over `dest`.
fn replace_file(from: &Path, dest: &Path) -> Result<(), SyncError> {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dest.with_file_name(format!(".{name}.extsync.tmp"));
    std::fs::copy(from, &tmp).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, dest) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(dest, e));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// copy_tree
// ---------------------------------------------------------------------------

/// Recursively copy `from` into `to` (created if needed), preserving
/// permissions and recreating symlinks.
pub fn copy_tree(from: &Path, to: &Path) -> Result<(), SyncError> {
    copy_tree_io(from, to).map_err(|e| io_err(from, e))
}

fn copy_tree_io(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(from).map_err(io::Error::other)?;
        let dest = to.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    let link = std::fs::read_link(from)?;
    std::os::unix::fs::symlink(link, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::copy(from, to).map(|_| ())
}
