//! `extsync checksum`: per-file digests of an extension directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use extsync_core::{ExtensionName, SyncConfig};
use extsync_fs::ExtensionStore;

/// Arguments for `extsync checksum`.
#[derive(Args, Debug)]
pub struct ChecksumArgs {
    /// Extension name.
    pub extension: String,

    /// Subtree to digest, relative to the extensions root (default: the
    /// extension's own directory).
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct ChecksumRow {
    #[tabled(rename = "file")]
    file: String,
    #[tabled(rename = "sha256")]
    sha256: String,
}

impl ChecksumArgs {
    pub fn run(self, config: &SyncConfig) -> Result<()> {
        let store = ExtensionStore::from_config(config);
        let relative = match self.path {
            Some(path) => path,
            None => PathBuf::from(ExtensionName::from(self.extension.as_str()).dir_name()),
        };
        let map = store
            .checksum_map(&self.extension, &relative)
            .with_context(|| format!("failed to checksum '{}'", self.extension))?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&map)?);
            return Ok(());
        }
        if map.is_empty() {
            println!("'{}' has no files", self.extension);
            return Ok(());
        }
        let rows = map.into_iter().map(|(file, sha256)| ChecksumRow { file, sha256 });
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}
