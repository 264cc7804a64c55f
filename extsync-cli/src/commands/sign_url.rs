//! `extsync sign-url`: download URL for a published archive.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use extsync_cluster::{share_url_path, UrlSigner};
use extsync_core::{ManagementServerHost, SyncConfig};

/// Arguments for `extsync sign-url`.
#[derive(Args, Debug)]
pub struct SignUrlArgs {
    /// Service address of the peer that serves the archive.
    pub peer_ip: String,

    /// Path of the published archive.
    pub archive: PathBuf,

    /// Lifetime of the URL in seconds (default: `url_ttl_secs` from config).
    #[arg(long)]
    pub ttl: Option<u64>,
}

impl SignUrlArgs {
    pub fn run(self, config: &SyncConfig) -> Result<()> {
        let peer = ManagementServerHost {
            id: 0,
            uuid: String::new(),
            name: self.peer_ip.clone(),
            service_ip: self.peer_ip.clone(),
        };
        let ttl = self
            .ttl
            .map(std::time::Duration::from_secs)
            .unwrap_or_else(|| config.url_ttl());
        let path = share_url_path(&self.archive)?;
        let url = UrlSigner::from_config(config)
            .signed_url(&peer, &path, ttl)
            .context("failed to generate signed URL")?;
        println!("{url}");
        Ok(())
    }
}
