//! Domain types shared by every extsync crate.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! Peer-facing payloads ([`SyncCommand`], [`SyncAnswer`]) serialize as camelCase JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed extension name, as recorded by the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExtensionName(pub String);

impl ExtensionName {
    /// Directory name derived from the extension name.
    ///
    /// Lowercases the name and replaces every character outside
    /// `[a-z0-9._-]` with `-`, so `"Demo Orchestrator"` maps to
    /// `"demo-orchestrator"`.
    pub fn dir_name(&self) -> String {
        self.0
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| match c {
                'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
                _ => '-',
            })
            .collect()
    }
}

impl fmt::Display for ExtensionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ExtensionName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExtensionName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Relative file path (always `/`-separated) → hex digest.
///
/// Built fresh for every request and never persisted. Directories never
/// appear as keys.
pub type FileChecksumMap = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How a receiving peer converges its live tree to a distributed archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    /// Replace the whole extension directory.
    #[default]
    Complete,
    /// Overlay the archived files, leave everything else alone.
    Partial,
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncType::Complete => write!(f, "complete"),
            SyncType::Partial => write!(f, "partial"),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// A named, directory-scoped bundle of executable files.
///
/// Owned by the metadata store; extsync only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub id: u64,
    pub name: ExtensionName,
    /// Path of the extension directory relative to the extensions root.
    pub relative_path: PathBuf,
}

impl Extension {
    /// Extension whose directory sits directly under the extensions root at
    /// its derived [`ExtensionName::dir_name`].
    pub fn new(id: u64, name: impl Into<ExtensionName>) -> Self {
        let name = name.into();
        let relative_path = PathBuf::from(name.dir_name());
        Self {
            id,
            name,
            relative_path,
        }
    }

    pub fn dir_name(&self) -> String {
        self.name.dir_name()
    }
}

/// Cluster-membership record for one management server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementServerHost {
    pub id: u64,
    pub uuid: String,
    /// Display name used in operator-facing messages.
    pub name: String,
    /// Externally reachable service address.
    pub service_ip: String,
}

impl fmt::Display for ManagementServerHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.service_ip)
    }
}

/// A published archive, ready to be distributed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    /// Absolute path of the archive inside the shared directory.
    pub path: PathBuf,
    pub checksum: String,
    pub size: u64,
    pub sync_type: SyncType,
}

/// "Fetch and apply" instruction sent to one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCommand {
    /// Id of the management server that published the archive.
    pub ms_id: u64,
    pub extension_id: u64,
    pub extension_name: ExtensionName,
    pub download_url: String,
    pub size: u64,
    pub checksum: String,
    pub sync_type: SyncType,
}

/// One entry of a peer's answer list. The first entry is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAnswer {
    pub result: bool,
    #[serde(default)]
    pub details: String,
}

impl SyncAnswer {
    pub fn success(details: impl Into<String>) -> Self {
        Self {
            result: true,
            details: details.into(),
        }
    }

    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            result: false,
            details: details.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
