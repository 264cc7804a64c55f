//! One synchronization round, driven from the node where the extension
//! changed.
//!
//! ```text
//! Publishing ──▶ Distributing ──▶ AwaitingPeerResults ──▶ Succeeded
//!     │               │                                └─▶ PartiallyFailed
//!     └───────────────┴──▶ Aborted
//! ```
//!
//! Every target peer is attempted, concurrently, one scoped thread per
//! peer. Results are aggregated in target order, so the reported failure is
//! always the first failing peer in the caller's list regardless of which
//! RPC finished first.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;

use extsync_core::{
    ArchiveInfo, Extension, ManagementServerHost, SyncAnswer, SyncCommand, SyncConfig, SyncError,
};
use extsync_fs::ArchivePublisher;

use crate::locks::ExtensionLocks;
use crate::signing::{share_url_path, UrlSigner};
use crate::transport::ClusterTransport;

pub const MSG_CREATE_ARCHIVE_FAILED: &str = "Failed to create archive";
pub const MSG_SIGN_URL_FAILED: &str = "Failed to generate signed URL";
pub const MSG_UNKNOWN_ERROR: &str = "Unknown error";
const MSG_PEER_FAILED_PREFIX: &str = "Sync failed on management server: ";

/// Where a round ended up. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Publishing,
    Distributing,
    AwaitingPeerResults,
    Succeeded,
    PartiallyFailed,
    Aborted,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Publishing => "publishing",
            SyncState::Distributing => "distributing",
            SyncState::AwaitingPeerResults => "awaiting_peer_results",
            SyncState::Succeeded => "succeeded",
            SyncState::PartiallyFailed => "partially_failed",
            SyncState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// One peer's answer to the round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerResult {
    pub peer: ManagementServerHost,
    pub success: bool,
    pub details: String,
}

impl PeerResult {
    /// The peer's failure as [`SyncError::Remote`], or `None` if it applied
    /// the archive.
    pub fn error(&self) -> Option<SyncError> {
        (!self.success).then(|| SyncError::Remote {
            peer: self.peer.name.clone(),
            message: self.details.clone(),
        })
    }
}

/// Aggregated result of [`SyncCoordinator::sync_extension`].
///
/// `message` is empty on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub state: SyncState,
    pub success: bool,
    pub message: String,
    pub archive: Option<ArchiveInfo>,
    pub peers: Vec<PeerResult>,
}

impl SyncOutcome {
    fn aborted(message: &str, archive: Option<ArchiveInfo>) -> Self {
        Self {
            state: SyncState::Aborted,
            success: false,
            message: message.to_string(),
            archive,
            peers: Vec::new(),
        }
    }
}

pub struct SyncCoordinator {
    publisher: ArchivePublisher,
    signer: UrlSigner,
    transport: Arc<dyn ClusterTransport>,
    url_ttl: Duration,
    locks: ExtensionLocks,
}

impl SyncCoordinator {
    pub fn new(
        publisher: ArchivePublisher,
        signer: UrlSigner,
        transport: Arc<dyn ClusterTransport>,
    ) -> Self {
        Self {
            publisher,
            signer,
            transport,
            url_ttl: SyncConfig::default().url_ttl(),
            locks: ExtensionLocks::new(),
        }
    }

    pub fn with_url_ttl(mut self, ttl: Duration) -> Self {
        self.url_ttl = ttl;
        self
    }

    pub fn with_locks(mut self, locks: ExtensionLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Publish `extension` on `source`, then have every peer in `targets`
    /// fetch and apply it.
    ///
    /// Empty `files` distributes the whole tree; otherwise only the listed
    /// paths (relative to the extension root). Rounds for the same
    /// extension are serialized on this node.
    pub fn sync_extension(
        &self,
        extension: &Extension,
        source: &ManagementServerHost,
        targets: &[ManagementServerHost],
        files: &[PathBuf],
    ) -> SyncOutcome {
        let _guard = self.locks.acquire(extension.id);
        let span = tracing::info_span!(
            "sync_round",
            extension = %extension.name,
            source = %source.name
        );
        let _entered = span.enter();

        transition(SyncState::Publishing);
        let archive = match self.publisher.create_archive_for_sync(extension, files) {
            Ok(archive) => archive,
            Err(err) => {
                tracing::warn!(kind = %err.kind(), error = %err, "publishing failed");
                return SyncOutcome::aborted(MSG_CREATE_ARCHIVE_FAILED, None);
            }
        };

        let url = match share_url_path(&archive.path)
            .and_then(|path| self.signer.signed_url(source, &path, self.url_ttl))
        {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(error = %err, "signing failed");
                return SyncOutcome::aborted(MSG_SIGN_URL_FAILED, Some(archive));
            }
        };

        let command = SyncCommand {
            ms_id: source.id,
            extension_id: extension.id,
            extension_name: extension.name.clone(),
            download_url: url,
            size: archive.size,
            checksum: archive.checksum.clone(),
            sync_type: archive.sync_type,
        };

        transition(SyncState::Distributing);
        let peers = self.fan_out(targets, &command);

        transition(SyncState::AwaitingPeerResults);
        let outcome = aggregate(peers, archive);
        transition(outcome.state);
        if outcome.success {
            tracing::info!(peers = outcome.peers.len(), "extension synchronized");
        } else {
            tracing::warn!(message = %outcome.message, "extension sync incomplete");
        }
        outcome
    }

    fn fan_out(&self, targets: &[ManagementServerHost], command: &SyncCommand) -> Vec<PeerResult> {
        let transport = self.transport.as_ref();
        thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|peer| scope.spawn(move || dispatch(transport, peer, command)))
                .collect();
            handles
                .into_iter()
                .zip(targets)
                .map(|(handle, peer)| {
                    handle.join().unwrap_or_else(|_| {
                        tracing::warn!(peer = %peer, "peer dispatch panicked");
                        PeerResult {
                            peer: peer.clone(),
                            success: false,
                            details: MSG_UNKNOWN_ERROR.to_string(),
                        }
                    })
                })
                .collect()
        })
    }
}

fn transition(state: SyncState) {
    tracing::debug!(%state, "sync round state");
}

fn dispatch(
    transport: &dyn ClusterTransport,
    peer: &ManagementServerHost,
    command: &SyncCommand,
) -> PeerResult {
    let (success, details) = match transport.execute(peer, command) {
        Ok(raw) => parse_answer(&raw),
        Err(err) => {
            tracing::warn!(peer = %peer, error = %err, "peer RPC failed");
            (false, MSG_UNKNOWN_ERROR.to_string())
        }
    };
    let result = PeerResult {
        peer: peer.clone(),
        success,
        details,
    };
    match result.error() {
        Some(err) => tracing::warn!(kind = %err.kind(), error = %err, "peer reported failure"),
        None => tracing::debug!(peer = %peer, "peer applied archive"),
    }
    result
}

/// First answer wins; empty or unparsable lists are failures.
fn parse_answer(raw: &str) -> (bool, String) {
    match serde_json::from_str::<Vec<SyncAnswer>>(raw) {
        Ok(answers) => match answers.into_iter().next() {
            Some(first) => (first.result, first.details),
            None => (false, MSG_UNKNOWN_ERROR.to_string()),
        },
        Err(err) => {
            tracing::debug!(error = %err, "unparsable peer answer");
            (false, MSG_UNKNOWN_ERROR.to_string())
        }
    }
}

fn aggregate(peers: Vec<PeerResult>, archive: ArchiveInfo) -> SyncOutcome {
    let first_failure = peers.iter().find(|p| !p.success);
    let (state, message) = match first_failure {
        Some(failed) => (
            SyncState::PartiallyFailed,
            format!("{MSG_PEER_FAILED_PREFIX}{}", failed.peer.name),
        ),
        None => (SyncState::Succeeded, String::new()),
    };
    SyncOutcome {
        success: state == SyncState::Succeeded,
        state,
        message,
        archive: Some(archive),
        peers,
    }
}
