//! Cluster side of extension synchronization: signed distribution, the
//! sync coordinator and its peer fan-out, the receiving-peer command
//! handler, and the periodic share sweeper.

mod error;
pub mod coordinator;
pub mod download;
pub mod handler;
pub mod locks;
pub mod signing;
pub mod sweeper;
pub mod transport;

pub use coordinator::{PeerResult, SyncCoordinator, SyncOutcome, SyncState};
pub use download::{download_to, DownloadError, Downloader, HttpDownloader};
pub use error::ClusterError;
pub use handler::{ExtensionCatalog, SyncCommandHandler};
pub use locks::{ExtensionGuard, ExtensionLocks};
pub use signing::{share_url_path, UrlSigner};
pub use sweeper::run_share_sweeper;
pub use transport::ClusterTransport;
