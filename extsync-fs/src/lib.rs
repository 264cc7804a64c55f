//! # extsync-fs
//!
//! Local filesystem side of extension synchronization: path resolution and
//! checksums ([`ExtensionStore`]), the tar+gzip [`codec`], archive
//! publishing ([`ArchivePublisher`]), the apply engine ([`ApplyEngine`]),
//! and retention of the shared archive directory.

pub mod apply;
pub mod checksum;
pub mod codec;
pub mod payload;
pub mod publisher;
pub mod retention;
pub mod store;

pub use apply::{atomic_replace, copy_tree, overlay, ApplyEngine};
pub use checksum::{Digester, Sha256Digester};
pub use codec::{ArchiveCodec, ArchiveFormat, TarGzCodec};
pub use payload::write_payload_file;
pub use publisher::ArchivePublisher;
pub use retention::{cleanup_expired, cleanup_share_files, SweepReport};
pub use store::ExtensionStore;
