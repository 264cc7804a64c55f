//! Receiving-peer side of a sync round.
//!
//! Invoked by the cluster RPC layer with one [`SyncCommand`]:
//!
//! 1. Resolve the extension through the [`ExtensionCatalog`].
//! 2. Hold the extension's single-flight guard.
//! 3. Download the archive into a fresh staging directory.
//! 4. Verify size and digest against the command.
//! 5. Apply it to the live extension directory.
//!
//! The answer is always a one-entry list; failures are reported in it
//! rather than as an RPC error.

use std::path::Path;
use std::sync::Arc;

use extsync_core::error::io_err;
use extsync_core::{Extension, SyncAnswer, SyncCommand, SyncError};
use extsync_fs::{ApplyEngine, Digester};

use crate::download::{download_to, redact, Downloader};
use crate::error::ClusterError;
use crate::locks::ExtensionLocks;

/// Read-only view of the metadata store's extension records.
#[cfg_attr(test, mockall::automock)]
pub trait ExtensionCatalog: Send + Sync {
    fn find_extension(&self, extension_id: u64) -> Option<Extension>;
}

pub struct SyncCommandHandler {
    engine: ApplyEngine,
    downloader: Arc<dyn Downloader>,
    catalog: Arc<dyn ExtensionCatalog>,
    locks: ExtensionLocks,
}

impl SyncCommandHandler {
    pub fn new(
        engine: ApplyEngine,
        downloader: Arc<dyn Downloader>,
        catalog: Arc<dyn ExtensionCatalog>,
    ) -> Self {
        Self {
            engine,
            downloader,
            catalog,
            locks: ExtensionLocks::new(),
        }
    }

    /// Share a lock table with other components on this node.
    pub fn with_locks(mut self, locks: ExtensionLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn handle(&self, command: &SyncCommand) -> Vec<SyncAnswer> {
        match self.apply_command(command) {
            Ok(()) => {
                tracing::info!(
                    extension = %command.extension_name,
                    ms_id = command.ms_id,
                    sync_type = %command.sync_type,
                    "applied extension sync"
                );
                vec![SyncAnswer::success("")]
            }
            Err(err) => {
                tracing::warn!(
                    extension = %command.extension_name,
                    ms_id = command.ms_id,
                    kind = %err.kind(),
                    error = %err,
                    "extension sync failed"
                );
                vec![SyncAnswer::failure(err.to_string())]
            }
        }
    }

    /// JSON in, JSON out, for transports that carry raw payloads.
    pub fn handle_json(&self, payload: &str) -> Result<String, ClusterError> {
        let answers = match serde_json::from_str::<SyncCommand>(payload) {
            Ok(command) => self.handle(&command),
            Err(err) => vec![SyncAnswer::failure(format!("malformed sync command: {err}"))],
        };
        Ok(serde_json::to_string(&answers)?)
    }

    fn apply_command(&self, command: &SyncCommand) -> Result<(), ClusterError> {
        let extension = self
            .catalog
            .find_extension(command.extension_id)
            .ok_or_else(|| {
                SyncError::not_found(format!(
                    "extension {} ({})",
                    command.extension_id, command.extension_name
                ))
            })?;
        let _guard = self.locks.acquire(extension.id);

        let store = self.engine.store();
        let root = store.root_path_for(&extension)?;
        let scratch = store.fresh_staging_dir("download-")?;
        let archive = scratch.path().join("archive.tgz");

        download_to(self.downloader.as_ref(), &command.download_url, &archive)?;
        verify_archive(command, &archive, store.digester())?;
        tracing::debug!(url = redact(&command.download_url), "archive verified");

        self.engine
            .apply_extension_sync(&extension, command.sync_type, &archive, &root)?;
        Ok(())
    }
}

fn verify_archive(
    command: &SyncCommand,
    archive: &Path,
    digester: &dyn Digester,
) -> Result<(), SyncError> {
    let size = std::fs::metadata(archive)
        .map_err(|e| io_err(archive, e))?
        .len();
    if size != command.size {
        return Err(SyncError::IoFailure(format!(
            "downloaded archive is {size} bytes, expected {}",
            command.size
        )));
    }
    let checksum = digester
        .digest(archive)
        .map_err(|source| SyncError::Checksum {
            path: archive.to_path_buf(),
            source,
        })?;
    if !checksum.eq_ignore_ascii_case(&command.checksum) {
        return Err(SyncError::IoFailure(format!(
            "downloaded archive checksum {checksum} does not match {}",
            command.checksum
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::MockDownloader;
    use extsync_core::SyncType;
    use extsync_fs::{ArchivePublisher, ExtensionStore};
    use tempfile::TempDir;

    struct Fixture {
        _source_tmp: TempDir,
        peer_tmp: TempDir,
        archive: extsync_core::ArchiveInfo,
        extension: Extension,
    }

    impl Fixture {
        fn new() -> Self {
            let source_tmp = TempDir::new().unwrap();
            let store = ExtensionStore::new(
                source_tmp.path().join("extensions"),
                source_tmp.path().join("share"),
            );
            let extension = Extension::new(5, "demo-orchestrator");
            let root = store.extensions_root().join(&extension.relative_path);
            std::fs::create_dir_all(&root).unwrap();
            std::fs::write(root.join("a.sh"), "new a").unwrap();
            let archive = ArchivePublisher::new(store)
                .create_archive_for_sync(&extension, &[])
                .unwrap();
            Self {
                _source_tmp: source_tmp,
                peer_tmp: TempDir::new().unwrap(),
                archive,
                extension,
            }
        }

        fn command(&self) -> SyncCommand {
            SyncCommand {
                ms_id: 1,
                extension_id: self.extension.id,
                extension_name: self.extension.name.clone(),
                download_url: "http://10.0.0.1:8080/extensions-share/x.tgz?exp=9".to_string(),
                size: self.archive.size,
                checksum: self.archive.checksum.clone(),
                sync_type: SyncType::Complete,
            }
        }

        fn handler(&self, catalog: MockExtensionCatalog) -> SyncCommandHandler {
            let source = self.archive.path.clone();
            let mut downloader = MockDownloader::new();
            downloader.expect_download().returning(move |_, dest| {
                std::fs::copy(&source, dest)?;
                Ok(())
            });
            let store = ExtensionStore::new(
                self.peer_tmp.path().join("extensions"),
                self.peer_tmp.path().join("share"),
            );
            SyncCommandHandler::new(
                ApplyEngine::new(store),
                Arc::new(downloader),
                Arc::new(catalog),
            )
        }

        fn peer_file(&self, rel: &str) -> std::path::PathBuf {
            self.peer_tmp
                .path()
                .join("extensions")
                .join(&self.extension.relative_path)
                .join(rel)
        }
    }

    fn catalog_with(extension: &Extension) -> MockExtensionCatalog {
        let extension = extension.clone();
        let mut catalog = MockExtensionCatalog::new();
        catalog
            .expect_find_extension()
            .returning(move |id| (id == extension.id).then(|| extension.clone()));
        catalog
    }

    #[test]
    fn applies_verified_archive() {
        let fx = Fixture::new();
        let handler = fx.handler(catalog_with(&fx.extension));

        let answers = handler.handle(&fx.command());
        assert_eq!(answers, vec![SyncAnswer::success("")]);
        assert_eq!(std::fs::read_to_string(fx.peer_file("a.sh")).unwrap(), "new a");
    }

    #[test]
    fn unknown_extension_answers_failure() {
        let fx = Fixture::new();
        let mut catalog = MockExtensionCatalog::new();
        catalog.expect_find_extension().returning(|_| None);
        let handler = fx.handler(catalog);

        let answers = handler.handle(&fx.command());
        assert_eq!(answers.len(), 1);
        assert!(!answers[0].result);
        assert!(answers[0].details.contains("not found"));
    }

    #[test]
    fn checksum_mismatch_leaves_tree_untouched() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.peer_file("")).unwrap();
        std::fs::write(fx.peer_file("a.sh"), "old a").unwrap();
        let handler = fx.handler(catalog_with(&fx.extension));

        let mut command = fx.command();
        command.checksum = "0".repeat(64);
        let answers = handler.handle(&command);
        assert!(!answers[0].result);
        assert!(answers[0].details.contains("does not match"));
        assert_eq!(std::fs::read_to_string(fx.peer_file("a.sh")).unwrap(), "old a");
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let fx = Fixture::new();
        let handler = fx.handler(catalog_with(&fx.extension));

        let mut command = fx.command();
        command.size += 1;
        let answers = handler.handle(&command);
        assert!(!answers[0].result);
        assert!(answers[0].details.contains("bytes, expected"));
    }

    #[test]
    fn handle_json_round_trips_answers() {
        let fx = Fixture::new();
        let handler = fx.handler(catalog_with(&fx.extension));

        let payload = serde_json::to_string(&fx.command()).unwrap();
        let raw = handler.handle_json(&payload).unwrap();
        let answers: Vec<SyncAnswer> = serde_json::from_str(&raw).unwrap();
        assert!(answers[0].result);

        let raw = handler.handle_json("{not json").unwrap();
        let answers: Vec<SyncAnswer> = serde_json::from_str(&raw).unwrap();
        assert!(!answers[0].result);
    }
}
