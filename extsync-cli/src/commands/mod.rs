pub mod apply;
pub mod checksum;
pub mod publish;
pub mod receive;
pub mod sign_url;
pub mod sweep;

use std::path::Path;

use anyhow::{Context, Result};
use extsync_core::{config, SyncConfig};

/// Load `explicit`, or `~/.extsync/config.yaml` when not given. A missing
/// file yields defaults either way.
pub fn load_config(explicit: Option<&Path>) -> Result<SyncConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let home = dirs::home_dir().context("could not determine home directory")?;
            config::default_config_path(&home)
        }
    };
    config::load_at(&path).with_context(|| format!("failed to load config {}", path.display()))
}
