//! Payload files handed to an extension on invocation.
//!
//! The file holds exactly the serialized details map and is created with
//! create-new semantics: an existing file with the same name is an error,
//! never overwritten.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;

use extsync_core::error::io_err;
use extsync_core::SyncError;

/// Write `details` as JSON to `<data_dir>/<file_name>`.
pub fn write_payload_file(
    data_dir: &Path,
    file_name: &str,
    details: &BTreeMap<String, Value>,
) -> Result<PathBuf, SyncError> {
    std::fs::create_dir_all(data_dir).map_err(|e| io_err(data_dir, e))?;
    let path = data_dir.join(file_name);
    let json = serde_json::to_vec(details)?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| io_err(&path, e))?;
    file.write_all(&json).map_err(|e| io_err(&path, e))?;
    file.sync_all().map_err(|e| io_err(&path, e))?;

    tracing::debug!(path = %path.display(), "wrote payload file");
    Ok(path)
}
