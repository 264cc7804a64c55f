//! Archive codec: "pack directory → file" and "unpack file → directory".
//!
//! Both directions run on a worker thread bounded by a timeout and report a
//! plain `bool`. Packing writes to a temporary sibling of the destination and
//! renames it into place only on success. A pack whose rename lands before
//! the deadline reports `true`; one that misses it never renames, so `false`
//! always means the destination archive was not written.

use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use walkdir::WalkDir;

/// Supported archive encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveFormat {
    /// gzip-compressed tar, `.tgz`.
    #[default]
    TarGz,
}

impl ArchiveFormat {
    /// File extension without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tgz",
        }
    }
}

/// Pack/unpack primitive. Implementations must not block past `timeout`.
pub trait ArchiveCodec: Send + Sync {
    /// Pack the contents of `source_dir` (not the directory itself) into
    /// `dest_archive`. Entry names are relative to `source_dir`.
    fn pack(
        &self,
        format: ArchiveFormat,
        source_dir: &Path,
        dest_archive: &Path,
        timeout: Duration,
    ) -> bool;

    /// Unpack `archive` into `dest_dir`, creating it if needed.
    fn unpack(
        &self,
        format: ArchiveFormat,
        archive: &Path,
        dest_dir: &Path,
        timeout: Duration,
    ) -> bool;
}

/// Default codec built on `tar` + `flate2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarGzCodec;

impl ArchiveCodec for TarGzCodec {
    fn pack(
        &self,
        format: ArchiveFormat,
        source_dir: &Path,
        dest_archive: &Path,
        timeout: Duration,
    ) -> bool {
        let ArchiveFormat::TarGz = format;
        let source = source_dir.to_path_buf();
        let dest = dest_archive.to_path_buf();
        let tmp = partial_path(dest_archive);
        let outcome = run_with_timeout(timeout, {
            let tmp = tmp.clone();
            move |cancel: &Cancel| {
                write_tar_gz(&source, &tmp, cancel)?;
                cancel.commit(|| std::fs::rename(&tmp, &dest))
            }
        });
        if !outcome {
            let _ = std::fs::remove_file(&tmp);
            tracing::warn!(
                source = %source_dir.display(),
                archive = %dest_archive.display(),
                "packing failed"
            );
        }
        outcome
    }

    fn unpack(
        &self,
        format: ArchiveFormat,
        archive: &Path,
        dest_dir: &Path,
        timeout: Duration,
    ) -> bool {
        let ArchiveFormat::TarGz = format;
        let archive_path = archive.to_path_buf();
        let dest = dest_dir.to_path_buf();
        let outcome = run_with_timeout(timeout, move |cancel: &Cancel| {
            read_tar_gz(&archive_path, &dest, cancel)
        });
        if !outcome {
            tracing::warn!(
                archive = %archive.display(),
                dest = %dest_dir.display(),
                "unpacking failed"
            );
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Timeout plumbing
// ---------------------------------------------------------------------------

/// Cancellation flag shared between the caller and the worker.
pub(crate) struct Cancel {
    flag: AtomicBool,
    committed: AtomicBool,
    gate: Mutex<()>,
}

impl Cancel {
    fn check(&self) -> io::Result<()> {
        if self.flag.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "operation cancelled"));
        }
        Ok(())
    }

    /// Run the final, visible step only if the caller has not given up yet.
    fn commit(&self, step: impl FnOnce() -> io::Result<()>) -> io::Result<()> {
        let _gate = self.gate.lock().map_err(|_| io::Error::other("cancel gate poisoned"))?;
        self.check()?;
        step()?;
        self.committed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn run_with_timeout<F>(timeout: Duration, work: F) -> bool
where
    F: FnOnce(&Cancel) -> io::Result<()> + Send + 'static,
{
    let cancel = Arc::new(Cancel {
        flag: AtomicBool::new(false),
        committed: AtomicBool::new(false),
        gate: Mutex::new(()),
    });
    let (tx, rx) = mpsc::channel();
    let worker_cancel = Arc::clone(&cancel);
    let spawned = thread::Builder::new()
        .name("extsync-codec".to_string())
        .spawn(move || {
            let result = work(&worker_cancel);
            if let Err(err) = &result {
                tracing::debug!(error = %err, "codec worker failed");
            }
            let _ = tx.send(result.is_ok());
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "failed to spawn codec worker");
        return false;
    }

    match rx.recv_timeout(timeout) {
        Ok(ok) => ok,
        Err(mpsc::RecvTimeoutError::Disconnected) => false,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            // Hold the gate so the worker cannot commit after we give up. A
            // commit is the last step, so one that already happened counts as
            // success even if its result has not been sent yet.
            let _gate = cancel.gate.lock();
            cancel.flag.store(true, Ordering::SeqCst);
            let finished =
                cancel.committed.load(Ordering::SeqCst) || rx.try_recv().unwrap_or(false);
            if !finished {
                tracing::warn!(timeout_secs = timeout.as_secs(), "codec operation timed out");
            }
            finished
        }
    }
}

// ---------------------------------------------------------------------------
// tar + gzip
// ---------------------------------------------------------------------------

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    dest.with_file_name(format!(".{name}.partial"))
}

fn write_tar_gz(source_dir: &Path, dest: &Path, cancel: &Cancel) -> io::Result<()> {
    if !source_dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("source directory {} does not exist", source_dir.display()),
        ));
    }
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(source_dir).min_depth(1).sort_by_file_name() {
        cancel.check()?;
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(io::Error::other)?;
        builder.append_path_with_name(entry.path(), rel)?;
    }

    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;
    Ok(())
}

fn read_tar_gz(archive_path: &Path, dest_dir: &Path, cancel: &Cancel) -> io::Result<()> {
    std::fs::create_dir_all(dest_dir)?;
    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);

    for entry in archive.entries()? {
        cancel.check()?;
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        validate_entry_path(&entry_path)?;
        entry.unpack_in(dest_dir)?;
    }
    Ok(())
}

/// Reject entries that are absolute or climb out via `..`.
fn validate_entry_path(path: &Path) -> io::Result<()> {
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("path traversal detected: {}", path.display()),
        ));
    }
    Ok(())
}
