//! Path resolution, checksums, staging and codec access for extension trees.
//!
//! # Layout
//!
//! ```text
//! <extensions_root>/
//!   .staging/                 (scratch space, one subdirectory per operation)
//!   <extension dir>/...       (live extension trees)
//! <share_base_dir>/
//!   extensions-share/         (published archives, swept by retention)
//! ```
//!
//! Every path handed out by [`ExtensionStore`] resolves strictly under the
//! directory it belongs to. Relative inputs containing `..`, a root, or a
//! drive prefix are rejected before touching the filesystem.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use walkdir::WalkDir;

use extsync_core::config::{SyncConfig, SHARE_DIR_NAME, STAGING_DIR_NAME};
use extsync_core::error::io_err;
use extsync_core::{Extension, FileChecksumMap, SyncError};

use crate::checksum::{Digester, Sha256Digester};
use crate::codec::{ArchiveCodec, ArchiveFormat, TarGzCodec};

/// Resolves, validates and fingerprints extension files.
#[derive(Clone)]
pub struct ExtensionStore {
    extensions_root: PathBuf,
    share_dir: PathBuf,
    digester: Arc<dyn Digester>,
    codec: Arc<dyn ArchiveCodec>,
}

impl std::fmt::Debug for ExtensionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionStore")
            .field("extensions_root", &self.extensions_root)
            .field("share_dir", &self.share_dir)
            .finish_non_exhaustive()
    }
}

impl ExtensionStore {
    /// Store rooted at `extensions_root`, publishing into
    /// `<share_base_dir>/extensions-share/`, with SHA-256 digests and the
    /// tar+gzip codec.
    pub fn new(extensions_root: impl Into<PathBuf>, share_base_dir: impl AsRef<Path>) -> Self {
        Self {
            extensions_root: extensions_root.into(),
            share_dir: share_base_dir.as_ref().join(SHARE_DIR_NAME),
            digester: Arc::new(Sha256Digester),
            codec: Arc::new(TarGzCodec),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.extensions_root.clone(), &config.share_base_dir)
    }

    pub fn with_digester(mut self, digester: Arc<dyn Digester>) -> Self {
        self.digester = digester;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn ArchiveCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn extensions_root(&self) -> &Path {
        &self.extensions_root
    }

    /// `<share_base_dir>/extensions-share/` (pure, no I/O).
    pub fn share_dir(&self) -> &Path {
        &self.share_dir
    }

    pub fn digester(&self) -> &dyn Digester {
        self.digester.as_ref()
    }

    // -----------------------------------------------------------------------
    // Path resolution
    // -----------------------------------------------------------------------

    /// Canonical directory of `extension`'s files.
    ///
    /// Fails with `SecurityViolation` if the extension's relative path is
    /// empty, would leave the extensions root, or lands in the staging area.
    pub fn root_path_for(&self, extension: &Extension) -> Result<PathBuf, SyncError> {
        self.resolve_in_root(&extension.relative_path)
    }

    /// [`resolve_under`] the extensions root, with the staging area reserved.
    fn resolve_in_root(&self, relative: &Path) -> Result<PathBuf, SyncError> {
        let reserved = relative
            .components()
            .find(|c| !matches!(c, Component::CurDir))
            .is_some_and(|c| c.as_os_str() == STAGING_DIR_NAME);
        if reserved {
            return Err(SyncError::SecurityViolation {
                path: relative.to_path_buf(),
                root: self.extensions_root.clone(),
            });
        }
        resolve_under(&self.extensions_root, relative)
    }

    /// Validated, existing path `<extensions_root>/<relative_path>`.
    ///
    /// A regular file (an entry point) must be readable and executable; a
    /// directory must be readable. Every failure is reported as `NotFound`,
    /// with the specific permission problem logged.
    pub fn checked_path(
        &self,
        extension_name: &str,
        relative_path: &Path,
    ) -> Result<PathBuf, SyncError> {
        let not_found = || SyncError::not_found(format!("{extension_name}: {}", relative_path.display()));
        let path = match self.resolve_in_root(relative_path) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(extension = extension_name, error = %err, "rejected extension path");
                return Err(not_found());
            }
        };
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(
                    extension = extension_name,
                    path = %path.display(),
                    error = %err,
                    "extension path does not exist"
                );
                return Err(not_found());
            }
        };
        if !is_readable(&path, &meta) {
            tracing::warn!(
                extension = extension_name,
                path = %path.display(),
                "extension path is not readable"
            );
            return Err(not_found());
        }
        if meta.is_file() && !is_executable(&meta) {
            tracing::warn!(
                extension = extension_name,
                path = %path.display(),
                "extension entry point is not executable"
            );
            return Err(not_found());
        }
        Ok(path)
    }

    // -----------------------------------------------------------------------
    // Checksums
    // -----------------------------------------------------------------------

    /// Digest of every regular file under `<extensions_root>/<relative_path>`,
    /// keyed by `/`-separated path relative to that directory.
    ///
    /// - root cannot be resolved ⇒ `NotFound`
    /// - walk cannot start or fails midway ⇒ `Io`
    /// - any file fails to digest ⇒ `Checksum`, no partial map
    pub fn checksum_map(
        &self,
        extension_name: &str,
        relative_path: &Path,
    ) -> Result<FileChecksumMap, SyncError> {
        let root = self.resolve_in_root(relative_path).map_err(|err| {
            tracing::warn!(extension = extension_name, error = %err, "cannot resolve extension root");
            SyncError::not_found(format!("root path of extension {extension_name}"))
        })?;
        std::fs::metadata(&root).map_err(|e| io_err(&root, e))?;

        let mut map = FileChecksumMap::new();
        for entry in WalkDir::new(&root).min_depth(1) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                io_err(path, io::Error::other(e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let digest = self
                .digester
                .digest(entry.path())
                .map_err(|source| SyncError::Checksum {
                    path: entry.path().to_path_buf(),
                    source,
                })?;
            map.insert(relative_key(&root, entry.path()), digest);
        }
        tracing::debug!(
            extension = extension_name,
            files = map.len(),
            "computed checksum map"
        );
        Ok(map)
    }

    // -----------------------------------------------------------------------
    // Codec
    // -----------------------------------------------------------------------

    /// Pack `source_dir` into `dest_archive`. On `false` the destination must
    /// not be assumed to exist.
    pub fn pack_directory(
        &self,
        format: ArchiveFormat,
        source_dir: &Path,
        dest_archive: &Path,
        timeout: Duration,
    ) -> bool {
        self.codec.pack(format, source_dir, dest_archive, timeout)
    }

    pub fn unpack_archive(
        &self,
        format: ArchiveFormat,
        archive: &Path,
        dest_dir: &Path,
        timeout: Duration,
    ) -> bool {
        self.codec.unpack(format, archive, dest_dir, timeout)
    }

    // -----------------------------------------------------------------------
    // Staging
    // -----------------------------------------------------------------------

    /// `<extensions_root>/.staging/`, created if absent.
    ///
    /// Fails with `Io` if something other than a directory occupies it.
    pub fn staging_path(&self) -> Result<PathBuf, SyncError> {
        let path = self.extensions_root.join(STAGING_DIR_NAME);
        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => return Ok(path),
            Ok(_) => {
                return Err(io_err(
                    &path,
                    io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "staging path exists and is not a directory",
                    ),
                ))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&path, err)),
        }
        std::fs::create_dir_all(&path).map_err(|e| io_err(&path, e))?;
        Ok(path)
    }

    /// A fresh, uniquely named subdirectory of the staging area. It is
    /// removed when the returned guard drops.
    pub fn fresh_staging_dir(&self, prefix: &str) -> Result<TempDir, SyncError> {
        let staging = self.staging_path()?;
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&staging)
            .map_err(|e| io_err(&staging, e))
    }

    /// `<share_dir>`, created if absent.
    pub fn ensure_share_dir(&self) -> Result<&Path, SyncError> {
        std::fs::create_dir_all(&self.share_dir).map_err(|e| io_err(&self.share_dir, e))?;
        Ok(&self.share_dir)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Join `relative` onto `base`, refusing anything that could leave `base`.
///
/// Lexically, `relative` must be non-empty and made only of normal
/// components (`.` is ignored). If the joined path exists, its canonical
/// form must also sit under the canonical `base`, which catches symlinks
/// pointing elsewhere.
pub fn resolve_under(base: &Path, relative: &Path) -> Result<PathBuf, SyncError> {
    let violation = || SyncError::SecurityViolation {
        path: relative.to_path_buf(),
        root: base.to_path_buf(),
    };
    let mut resolved = base.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(violation())
            }
        }
    }
    if depth == 0 {
        return Err(violation());
    }

    if let (Ok(real), Ok(real_base)) = (resolved.canonicalize(), base.canonicalize()) {
        if !real.starts_with(&real_base) || real == real_base {
            return Err(violation());
        }
    }
    Ok(resolved)
}

/// `/`-joined path of `path` relative to `root`.
pub(crate) fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

fn is_readable(path: &Path, meta: &std::fs::Metadata) -> bool {
    if meta.is_dir() {
        std::fs::read_dir(path).is_ok()
    } else {
        std::fs::File::open(path).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    struct FailingDigester;

    impl Digester for FailingDigester {
        fn digest(&self, path: &Path) -> io::Result<String> {
            if path.ends_with("b.sh") {
                return Err(io::Error::other("disk on fire"));
            }
            Ok("ok".to_string())
        }
    }

    fn store(tmp: &TempDir) -> ExtensionStore {
        ExtensionStore::new(tmp.path().join("extensions"), tmp.path().join("share"))
    }

    fn demo(store: &ExtensionStore) -> Extension {
        let ext = Extension::new(1, "demo-orchestrator");
        let root = store.extensions_root().join(&ext.relative_path);
        std::fs::create_dir_all(root.join("lib")).unwrap();
        std::fs::write(root.join("a.sh"), "a").unwrap();
        std::fs::write(root.join("lib/b.sh"), "b").unwrap();
        ext
    }

    #[test]
    fn root_path_is_under_extensions_root() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let ext = demo(&store);
        let root = store.root_path_for(&ext).unwrap();
        assert_eq!(root, store.extensions_root().join("demo-orchestrator"));
    }

    #[rstest]
    #[case::parent("../outside")]
    #[case::nested_parent("demo/../../outside")]
    #[case::absolute("/etc")]
    #[case::empty("")]
    #[case::dot(".")]
    fn resolve_rejects_escapes(#[case] rel: &str) {
        let tmp = TempDir::new().unwrap();
        let err = resolve_under(tmp.path(), Path::new(rel)).unwrap_err();
        assert!(matches!(err, SyncError::SecurityViolation { .. }), "got {err}");
    }

    #[rstest]
    #[case::staging_root(".staging")]
    #[case::dotted_staging("./.staging")]
    #[case::inside_staging(".staging/apply-1")]
    fn extension_paths_never_reach_staging(#[case] rel: &str) {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.staging_path().unwrap();
        let ext = Extension {
            id: 9,
            name: ".staging".into(),
            relative_path: PathBuf::from(rel),
        };

        let err = store.root_path_for(&ext).unwrap_err();
        assert!(matches!(err, SyncError::SecurityViolation { .. }), "got {err}");
        let err = store.checksum_map(".staging", Path::new(rel)).unwrap_err();
        assert_eq!(err.kind(), extsync_core::ErrorKind::NotFound);
    }

    #[test]
    fn staging_prefixed_names_are_ordinary_extensions() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let ext = Extension::new(9, ".staging-tools");
        let root = store.root_path_for(&ext).unwrap();
        assert_eq!(root, store.extensions_root().join(".staging-tools"));
    }

    #[test]
    #[cfg(unix)]
    fn resolve_rejects_symlink_out_of_root() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("base");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, base.join("link")).unwrap();

        let err = resolve_under(&base, Path::new("link")).unwrap_err();
        assert!(matches!(err, SyncError::SecurityViolation { .. }));
    }

    #[test]
    fn checksum_map_has_one_entry_per_file() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let ext = demo(&store);

        let map = store
            .checksum_map("demo-orchestrator", &ext.relative_path)
            .unwrap();
        let keys: Vec<_> = map.keys().cloned().collect();
        assert_eq!(keys, vec!["a.sh".to_string(), "lib/b.sh".to_string()]);
    }

    #[test]
    fn checksum_map_of_empty_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        std::fs::create_dir_all(store.extensions_root().join("empty")).unwrap();

        let map = store.checksum_map("empty", Path::new("empty")).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn checksum_map_of_missing_dir_is_io_failure() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let err = store.checksum_map("ghost", Path::new("ghost")).unwrap_err();
        assert_eq!(err.kind(), extsync_core::ErrorKind::IoFailure);
    }

    #[test]
    fn checksum_map_of_unresolvable_root_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let err = store.checksum_map("evil", Path::new("../evil")).unwrap_err();
        assert_eq!(err.kind(), extsync_core::ErrorKind::NotFound);
    }

    #[test]
    fn checksum_failure_aborts_whole_map() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).with_digester(Arc::new(FailingDigester));
        let ext = demo(&store);

        let err = store
            .checksum_map("demo-orchestrator", &ext.relative_path)
            .unwrap_err();
        assert_eq!(err.kind(), extsync_core::ErrorKind::ChecksumFailure);
    }

    #[test]
    fn checked_path_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let err = store
            .checked_path("demo", Path::new("demo/demo.sh"))
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[test]
    #[cfg(unix)]
    fn checked_path_requires_executable_entry_point() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let ext = demo(&store);
        let entry = store.extensions_root().join(&ext.relative_path).join("a.sh");

        std::fs::set_permissions(&entry, std::fs::Permissions::from_mode(0o644)).unwrap();
        let err = store
            .checked_path("demo-orchestrator", Path::new("demo-orchestrator/a.sh"))
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));

        std::fs::set_permissions(&entry, std::fs::Permissions::from_mode(0o755)).unwrap();
        let path = store
            .checked_path("demo-orchestrator", Path::new("demo-orchestrator/a.sh"))
            .unwrap();
        assert_eq!(path, entry);
    }

    #[test]
    fn staging_path_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let first = store.staging_path().unwrap();
        let second = store.staging_path().unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
        assert!(first.ends_with(".staging"));
    }

    #[test]
    fn staging_path_occupied_by_file_fails() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        std::fs::create_dir_all(store.extensions_root()).unwrap();
        std::fs::write(store.extensions_root().join(".staging"), "oops").unwrap();

        let err = store.staging_path().unwrap_err();
        assert_eq!(err.kind(), extsync_core::ErrorKind::IoFailure);
    }

    #[test]
    fn fresh_staging_dirs_are_distinct_and_cleaned_up() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let a = store.fresh_staging_dir("apply-").unwrap();
        let b = store.fresh_staging_dir("apply-").unwrap();
        assert_ne!(a.path(), b.path());
        let kept = a.path().to_path_buf();
        drop(a);
        assert!(!kept.exists());
    }

    #[test]
    fn relative_key_uses_forward_slashes() {
        let root = Path::new("/x/root");
        assert_eq!(relative_key(root, &root.join("lib").join("b.sh")), "lib/b.sh");
    }
}
