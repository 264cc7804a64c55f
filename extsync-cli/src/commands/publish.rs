//! `extsync publish`: archive an extension into the share directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use extsync_core::{Extension, SyncConfig};
use extsync_fs::{ArchivePublisher, ExtensionStore};

/// Arguments for `extsync publish`.
#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Extension name.
    pub extension: String,

    /// Files or directories to include, relative to the extension root.
    /// Omit to publish the whole tree.
    pub files: Vec<PathBuf>,

    /// Extension id recorded in the metadata store.
    #[arg(long, default_value_t = 0)]
    pub id: u64,
}

impl PublishArgs {
    pub fn run(self, config: &SyncConfig) -> Result<()> {
        let extension = Extension::new(self.id, self.extension.as_str());
        let publisher = ArchivePublisher::new(ExtensionStore::from_config(config))
            .with_pack_timeout(config.pack_timeout());
        let info = publisher
            .create_archive_for_sync(&extension, &self.files)
            .with_context(|| format!("failed to publish '{}'", self.extension))?;
        println!("{}", serde_json::to_string_pretty(&info)?);
        Ok(())
    }
}
