//! Full sync rounds across in-process peers: coordinator on one node,
//! command handlers on the others, wired through a loopback transport and a
//! downloader that serves the source node's share directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use extsync_cluster::{
    ClusterError, ClusterTransport, DownloadError, Downloader, ExtensionCatalog, SyncCommandHandler,
    SyncCoordinator, SyncState, UrlSigner,
};
use extsync_core::config::SHARE_DIR_NAME;
use extsync_core::{Extension, ManagementServerHost, SyncCommand};
use extsync_fs::{ApplyEngine, ArchivePublisher, ExtensionStore};
use tempfile::TempDir;

const SECRET: &str = "cluster-secret";

/// Serves `/extensions-share/<name>` from one directory after checking the
/// URL signature.
struct ShareServer {
    share_dir: PathBuf,
    verifier: UrlSigner,
}

impl Downloader for ShareServer {
    fn download(&self, url: &str, dest: &Path) -> Result<(), DownloadError> {
        self.verifier
            .verify_signed_url(url)
            .map_err(|e| DownloadError::HttpError {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let prefix = format!("/{SHARE_DIR_NAME}/");
        let name = url
            .split_once(&prefix)
            .and_then(|(_, rest)| rest.split('?').next())
            .ok_or_else(|| DownloadError::NotFound {
                url: url.to_string(),
            })?;
        fs::copy(self.share_dir.join(name), dest)?;
        Ok(())
    }
}

struct Catalog(Vec<Extension>);

impl ExtensionCatalog for Catalog {
    fn find_extension(&self, extension_id: u64) -> Option<Extension> {
        self.0.iter().find(|e| e.id == extension_id).cloned()
    }
}

/// Routes each command to the target peer's handler as JSON.
#[derive(Default)]
struct Loopback {
    handlers: HashMap<u64, SyncCommandHandler>,
}

impl ClusterTransport for Loopback {
    fn execute(
        &self,
        peer: &ManagementServerHost,
        command: &SyncCommand,
    ) -> Result<String, ClusterError> {
        let handler = self
            .handlers
            .get(&peer.id)
            .ok_or_else(|| ClusterError::Transport(format!("no route to {}", peer.name)))?;
        handler.handle_json(&serde_json::to_string(command)?)
    }
}

struct Node {
    tmp: TempDir,
    host: ManagementServerHost,
}

impl Node {
    fn new(id: u64) -> Self {
        Self {
            tmp: TempDir::new().expect("tempdir"),
            host: ManagementServerHost {
                id,
                uuid: format!("uuid-{id}"),
                name: format!("ms-{id}"),
                service_ip: format!("10.1.0.{id}"),
            },
        }
    }

    fn store(&self) -> ExtensionStore {
        ExtensionStore::new(self.tmp.path().join("extensions"), self.tmp.path().join("share"))
    }

    fn file(&self, ext: &Extension, rel: &str) -> PathBuf {
        self.tmp
            .path()
            .join("extensions")
            .join(&ext.relative_path)
            .join(rel)
    }

    fn write(&self, ext: &Extension, rel: &str, content: &str) {
        let path = self.file(ext, rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    fn read(&self, ext: &Extension, rel: &str) -> String {
        fs::read_to_string(self.file(ext, rel)).expect("read")
    }
}

fn demo() -> Extension {
    Extension::new(21, "demo-orchestrator")
}

struct Cluster {
    source: Node,
    peers: Vec<Node>,
    coordinator: SyncCoordinator,
}

/// `peer_count` receiving peers; peers listed in `unaware` do not know the
/// extension and will answer with a failure.
fn cluster(peer_count: u64, unaware: &[u64]) -> Cluster {
    let source = Node::new(1);
    let peers: Vec<Node> = (2..2 + peer_count).map(Node::new).collect();

    let mut transport = Loopback::default();
    for peer in &peers {
        let known = if unaware.contains(&peer.host.id) {
            vec![]
        } else {
            vec![demo()]
        };
        let server = ShareServer {
            share_dir: source.store().share_dir().to_path_buf(),
            verifier: UrlSigner::default().with_secret(SECRET),
        };
        let handler = SyncCommandHandler::new(
            ApplyEngine::new(peer.store()),
            Arc::new(server),
            Arc::new(Catalog(known)),
        );
        transport.handlers.insert(peer.host.id, handler);
    }

    let coordinator = SyncCoordinator::new(
        ArchivePublisher::new(source.store()),
        UrlSigner::default().with_secret(SECRET),
        Arc::new(transport),
    );
    Cluster {
        source,
        peers,
        coordinator,
    }
}

impl Cluster {
    fn targets(&self) -> Vec<ManagementServerHost> {
        self.peers.iter().map(|p| p.host.clone()).collect()
    }
}

#[test]
fn complete_round_converges_every_peer() {
    let c = cluster(3, &[]);
    let ext = demo();
    c.source.write(&ext, "a.sh", "#!/bin/sh\necho a\n");
    c.source.write(&ext, "lib/b.sh", "#!/bin/sh\necho b\n");
    c.peers[0].write(&ext, "stale.sh", "old");

    let outcome = c
        .coordinator
        .sync_extension(&ext, &c.source.host, &c.targets(), &[]);

    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.state, SyncState::Succeeded);
    for peer in &c.peers {
        assert_eq!(peer.read(&ext, "a.sh"), "#!/bin/sh\necho a\n");
        assert_eq!(peer.read(&ext, "lib/b.sh"), "#!/bin/sh\necho b\n");
    }
    assert!(!c.peers[0].file(&ext, "stale.sh").exists());

    let source_map = c
        .source
        .store()
        .checksum_map("demo-orchestrator", &ext.relative_path)
        .expect("source map");
    let peer_map = c.peers[2]
        .store()
        .checksum_map("demo-orchestrator", &ext.relative_path)
        .expect("peer map");
    assert_eq!(source_map, peer_map);
}

#[test]
fn partial_round_overlays_only_listed_files() {
    let c = cluster(2, &[]);
    let ext = demo();
    c.source.write(&ext, "a.sh", "new a");
    c.source.write(&ext, "lib/b.sh", "source b");
    for peer in &c.peers {
        peer.write(&ext, "a.sh", "old a");
        peer.write(&ext, "lib/b.sh", "peer b");
    }

    let outcome = c.coordinator.sync_extension(
        &ext,
        &c.source.host,
        &c.targets(),
        &[PathBuf::from("a.sh")],
    );

    assert!(outcome.success, "{}", outcome.message);
    for peer in &c.peers {
        assert_eq!(peer.read(&ext, "a.sh"), "new a");
        assert_eq!(peer.read(&ext, "lib/b.sh"), "peer b");
    }
}

#[test]
fn single_failing_peer_is_named_and_others_still_converge() {
    let c = cluster(4, &[4]);
    let ext = demo();
    c.source.write(&ext, "a.sh", "v2");

    let outcome = c
        .coordinator
        .sync_extension(&ext, &c.source.host, &c.targets(), &[]);

    assert!(!outcome.success);
    assert_eq!(outcome.state, SyncState::PartiallyFailed);
    assert_eq!(outcome.message, "Sync failed on management server: ms-4");
    assert_eq!(outcome.peers.iter().filter(|p| !p.success).count(), 1);
    for peer in c.peers.iter().filter(|p| p.host.id != 4) {
        assert_eq!(peer.read(&ext, "a.sh"), "v2");
    }
    assert!(!c.peers[2].file(&ext, "a.sh").exists());
}

#[test]
fn unsigned_urls_are_rejected_by_a_signing_cluster() {
    let source = Node::new(1);
    let peer = Node::new(2);
    let ext = demo();
    source.write(&ext, "a.sh", "v1");

    let mut transport = Loopback::default();
    transport.handlers.insert(
        peer.host.id,
        SyncCommandHandler::new(
            ApplyEngine::new(peer.store()),
            Arc::new(ShareServer {
                share_dir: source.store().share_dir().to_path_buf(),
                verifier: UrlSigner::default().with_secret(SECRET),
            }),
            Arc::new(Catalog(vec![demo()])),
        ),
    );
    let coordinator = SyncCoordinator::new(
        ArchivePublisher::new(source.store()),
        UrlSigner::default(),
        Arc::new(transport),
    );

    let outcome = coordinator.sync_extension(&ext, &source.host, &[peer.host.clone()], &[]);
    assert!(!outcome.success);
    assert!(outcome.peers[0].details.contains("missing signature"));
    assert!(!peer.file(&ext, "a.sh").exists());
}
