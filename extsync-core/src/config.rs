//! YAML-backed node configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.extsync/
//!   config.yaml   (mode 0600, holds the shared signing secret)
//! ```
//!
//! # API pattern
//!
//! Functions take an explicit path or home (`_at` form) so tests can point
//! them at a `TempDir`. A missing file loads as [`SyncConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Directory name of the cluster-shared archive directory under
/// [`SyncConfig::share_base_dir`].
pub const SHARE_DIR_NAME: &str = "extensions-share";

/// Directory name of the extraction scratch area under
/// [`SyncConfig::extensions_root`].
pub const STAGING_DIR_NAME: &str = ".staging";

pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_HTTPS_PORT: u16 = 8443;

/// Cluster-wide settings for extension synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root under which every extension directory lives.
    pub extensions_root: PathBuf,
    /// Base of the cluster-visible share (`<base>/extensions-share/`).
    pub share_base_dir: PathBuf,
    pub https_enabled: bool,
    pub http_port: u16,
    pub https_port: u16,
    /// Shared HMAC secret for download URLs. Unset means unsigned URLs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
    pub url_ttl_secs: u64,
    /// Published archives older than this are swept.
    pub archive_retention_secs: u64,
    pub sweep_interval_secs: u64,
    pub pack_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            extensions_root: PathBuf::from("/usr/share/extsync/extensions"),
            share_base_dir: PathBuf::from("/var/lib/extsync"),
            https_enabled: false,
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            signing_secret: None,
            url_ttl_secs: 600,
            archive_retention_secs: 3600,
            sweep_interval_secs: 300,
            pack_timeout_secs: 60,
            download_timeout_secs: 120,
        }
    }
}

impl SyncConfig {
    /// `<share_base_dir>/extensions-share/`
    pub fn share_dir(&self) -> PathBuf {
        self.share_base_dir.join(SHARE_DIR_NAME)
    }

    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.url_ttl_secs)
    }

    pub fn archive_retention(&self) -> Duration {
        Duration::from_secs(self.archive_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn pack_timeout(&self) -> Duration {
        Duration::from_secs(self.pack_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// The configured secret, treating an empty string as unset.
    pub fn signing_secret(&self) -> Option<&str> {
        self.signing_secret.as_deref().filter(|s| !s.is_empty())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.archive_retention_secs <= self.url_ttl_secs {
            return Err(ConfigError::Invalid {
                field: "archive_retention_secs",
                reason: format!(
                    "must exceed url_ttl_secs ({}) so archives outlive their download URLs",
                    self.url_ttl_secs
                ),
            });
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sweep_interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// `<home>/.extsync/config.yaml` (pure, no I/O).
pub fn default_config_path(home: &Path) -> PathBuf {
    home.join(".extsync").join("config.yaml")
}

/// Load the config at `path`; a missing file yields defaults.
///
/// Returns `ConfigError::Parse` (with path) on malformed YAML and
/// `ConfigError::Invalid` on out-of-range values.
pub fn load_at(path: &Path) -> Result<SyncConfig, ConfigError> {
    if !path.exists() {
        return Ok(SyncConfig::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: SyncConfig =
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

/// Save `config` to `path` atomically (`<path>.tmp` then rename).
pub fn save_at(path: &Path, config: &SyncConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(io(dir))?;
    }
    let yaml = serde_yaml::to_string(config)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml).map_err(io(&tmp))?;
    set_file_permissions(&tmp).map_err(io(&tmp))?;
    std::fs::rename(&tmp, path).map_err(io(path))?;
    Ok(())
}

fn io(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError {
    let path = path.to_path_buf();
    move |source| ConfigError::Io { path, source }
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
