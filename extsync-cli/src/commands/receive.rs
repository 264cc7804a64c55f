//! `extsync receive`: act as a receiving peer for one sync command.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use extsync_cluster::{ExtensionCatalog, HttpDownloader, SyncCommandHandler};
use extsync_core::{Extension, SyncCommand, SyncConfig};
use extsync_fs::{ApplyEngine, ExtensionStore};

/// Arguments for `extsync receive`.
#[derive(Args, Debug)]
pub struct ReceiveArgs {
    /// JSON sync command to execute (`-` reads stdin).
    #[arg(default_value = "-")]
    pub command: PathBuf,
}

/// The extension named by the command, laid out at its derived directory.
struct CommandExtension(Extension);

impl ExtensionCatalog for CommandExtension {
    fn find_extension(&self, extension_id: u64) -> Option<Extension> {
        (self.0.id == extension_id).then(|| self.0.clone())
    }
}

impl ReceiveArgs {
    pub fn run(self, config: &SyncConfig) -> Result<()> {
        let payload = self.read_payload()?;
        let command: SyncCommand =
            serde_json::from_str(&payload).context("malformed sync command")?;
        let extension = Extension::new(command.extension_id, command.extension_name.clone());

        let engine = ApplyEngine::new(ExtensionStore::from_config(config))
            .with_unpack_timeout(config.pack_timeout());
        let handler = SyncCommandHandler::new(
            engine,
            Arc::new(HttpDownloader::from_config(config)),
            Arc::new(CommandExtension(extension)),
        );

        let answers = handler.handle(&command);
        println!("{}", serde_json::to_string(&answers)?);
        match answers.first() {
            Some(answer) if answer.result => {
                eprintln!(
                    "{} '{}' {} ({})",
                    "✓".green(),
                    command.extension_name,
                    "received".bold(),
                    command.sync_type
                );
                Ok(())
            }
            Some(answer) => anyhow::bail!("sync command failed: {}", answer.details),
            None => anyhow::bail!("sync command produced no answer"),
        }
    }

    fn read_payload(&self) -> Result<String> {
        if self.command.as_os_str() == "-" {
            let mut payload = String::new();
            std::io::stdin()
                .read_to_string(&mut payload)
                .context("failed to read sync command from stdin")?;
            return Ok(payload);
        }
        std::fs::read_to_string(&self.command)
            .with_context(|| format!("failed to read {}", self.command.display()))
    }
}
