//! extsync core library: domain types, errors, configuration.
//!
//! - [`types`]: extensions, peers, archives and the peer wire payloads
//! - [`error`]: [`SyncError`], [`ErrorKind`], [`ConfigError`]
//! - [`config`]: YAML-backed [`SyncConfig`]
//! - [`clock`]: injectable wall clock

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::SyncConfig;
pub use error::{ConfigError, ErrorKind, SyncError};
pub use types::{
    ArchiveInfo, Extension, ExtensionName, FileChecksumMap, ManagementServerHost, SyncAnswer,
    SyncCommand, SyncType,
};
