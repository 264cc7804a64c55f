//! `extsync apply`: converge the local extension directory to an archive.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use extsync_core::{Extension, SyncConfig, SyncType};
use extsync_fs::{ApplyEngine, ExtensionStore};

/// Arguments for `extsync apply`.
#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Extension name.
    pub extension: String,

    /// Archive to apply.
    pub archive: PathBuf,

    /// Overlay the archived files instead of replacing the whole directory.
    #[arg(long)]
    pub partial: bool,
}

impl ApplyArgs {
    pub fn run(self, config: &SyncConfig) -> Result<()> {
        let extension = Extension::new(0, self.extension.as_str());
        let sync_type = if self.partial {
            SyncType::Partial
        } else {
            SyncType::Complete
        };
        let engine = ApplyEngine::new(ExtensionStore::from_config(config))
            .with_unpack_timeout(config.pack_timeout());
        let root = engine.store().root_path_for(&extension)?;
        engine
            .apply_extension_sync(&extension, sync_type, &self.archive, &root)
            .with_context(|| {
                format!("failed to apply {} to '{}'", self.archive.display(), self.extension)
            })?;
        println!(
            "{} '{}' {} ({})",
            "✓".green(),
            self.extension,
            "applied".bold(),
            sync_type
        );
        Ok(())
    }
}
