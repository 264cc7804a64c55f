//! Archive publishing for cluster distribution.
//!
//! ## `create_archive_for_sync`
//!
//! 1. Resolve the extension root.
//! 2. Validate every requested path (no escapes, must exist) before any I/O.
//! 3. Pick the sync type: no files ⇒ Complete, otherwise Partial.
//! 4. Complete: pack the root. Partial: copy the listed paths into a fresh
//!    staging directory at their relative positions, pack that.
//! 5. Digest + size the archive and return [`ArchiveInfo`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use extsync_core::error::io_err;
use extsync_core::{ArchiveInfo, Clock, Extension, SyncError, SyncType, SystemClock};

use crate::apply::copy_tree;
use crate::codec::ArchiveFormat;
use crate::store::{resolve_under, ExtensionStore};

/// Default bound on a single pack operation.
pub const DEFAULT_PACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Produces one [`ArchiveInfo`] per call.
#[derive(Clone)]
pub struct ArchivePublisher {
    store: ExtensionStore,
    clock: Arc<dyn Clock>,
    format: ArchiveFormat,
    pack_timeout: Duration,
}

impl ArchivePublisher {
    pub fn new(store: ExtensionStore) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            format: ArchiveFormat::TarGz,
            pack_timeout: DEFAULT_PACK_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_pack_timeout(mut self, timeout: Duration) -> Self {
        self.pack_timeout = timeout;
        self
    }

    pub fn store(&self) -> &ExtensionStore {
        &self.store
    }

    /// Archive file name for `extension` at `millis`.
    pub fn archive_name(&self, extension: &Extension, sync_type: SyncType, millis: i64) -> String {
        let ext = self.format.extension();
        let dir = extension.dir_name();
        match sync_type {
            SyncType::Complete => format!("{dir}-{millis}.{ext}"),
            SyncType::Partial => format!("partial-{dir}-{millis}.{ext}"),
        }
    }

    /// Publish `extension` into the share directory.
    ///
    /// Empty `files` publishes the whole tree (Complete); otherwise only the
    /// listed files/directories, relative to the extension root (Partial).
    pub fn create_archive_for_sync(
        &self,
        extension: &Extension,
        files: &[PathBuf],
    ) -> Result<ArchiveInfo, SyncError> {
        let root = self.store.root_path_for(extension)?;
        if !root.is_dir() {
            return Err(SyncError::not_found(format!(
                "extension directory {}",
                root.display()
            )));
        }
        let requested = validate_requested(&root, files)?;
        let sync_type = if requested.is_empty() {
            SyncType::Complete
        } else {
            SyncType::Partial
        };

        let share = self.store.ensure_share_dir()?;
        let archive = share.join(self.archive_name(extension, sync_type, self.clock.now_millis()));

        let packed = match sync_type {
            SyncType::Complete => self.pack(&root, &archive),
            SyncType::Partial => self.pack_partial(&root, &requested, &archive)?,
        };
        if !packed || !archive.is_file() {
            let _ = std::fs::remove_file(&archive);
            return Err(SyncError::IoFailure("failed to create archive".to_string()));
        }

        let size = std::fs::metadata(&archive)
            .map_err(|e| io_err(&archive, e))?
            .len();
        let checksum = self
            .store
            .digester()
            .digest(&archive)
            .map_err(|source| SyncError::Checksum {
                path: archive.clone(),
                source,
            })?;

        tracing::info!(
            extension = %extension.name,
            archive = %archive.display(),
            sync_type = %sync_type,
            size,
            "published extension archive"
        );
        Ok(ArchiveInfo {
            path: archive,
            checksum,
            size,
            sync_type,
        })
    }

    fn pack(&self, source: &Path, archive: &Path) -> bool {
        self.store
            .pack_directory(self.format, source, archive, self.pack_timeout)
    }

    fn pack_partial(
        &self,
        root: &Path,
        requested: &[(PathBuf, PathBuf)],
        archive: &Path,
    ) -> Result<bool, SyncError> {
        let selection = self.store.fresh_staging_dir("publish-")?;
        for (relative, absolute) in requested {
            let target = selection.path().join(relative);
            if absolute.is_dir() {
                copy_tree(absolute, &target)?;
            } else {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
                }
                std::fs::copy(absolute, &target).map_err(|e| io_err(absolute, e))?;
            }
            tracing::debug!(file = %relative.display(), root = %root.display(), "selected for partial archive");
        }
        Ok(self.pack(selection.path(), archive))
    }
}

/// Resolve every requested path under `root`.
///
/// All paths are checked for escapes first, then for existence, so an
/// escaping path is reported as a security failure even when a sibling is
/// missing.
fn validate_requested(
    root: &Path,
    files: &[PathBuf],
) -> Result<Vec<(PathBuf, PathBuf)>, SyncError> {
    let resolved = files
        .iter()
        .map(|rel| resolve_under(root, rel).map(|abs| (rel.clone(), abs)))
        .collect::<Result<Vec<_>, _>>()?;
    if let Some((rel, _)) = resolved.iter().find(|(_, abs)| !abs.exists()) {
        return Err(SyncError::not_found(format!(
            "file {} in {}",
            rel.display(),
            root.display()
        )));
    }
    Ok(resolved)
}
