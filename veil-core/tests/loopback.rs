//! End-to-end scenarios over loopback TCP: server, router and client roles together.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use veil_core::command::Command;
use veil_core::connection::Connection;
use veil_core::machine::start;
use veil_core::scheduler::Job;
use veil_core::transfer::transfer_queue;
use veil_core::{
    Client, ClientMachine, Code, CommandError, Demon, Endpoint, FileRef, Group, Journal, Options,
    Peer, RelayService, Role, Server, ShareService, Status, TransferError, TransferJob,
};

const PASSPHRASE: &str = "orchard";
const WAIT: Duration = Duration::from_secs(10);

struct Site {
    share: TempDir,
    uploads: TempDir,
    downloads: TempDir,
}

impl Site {
    fn new() -> Self {
        let share = TempDir::new().unwrap();
        std::fs::create_dir(share.path().join("music")).unwrap();
        std::fs::write(share.path().join("notes.txt"), b"hello veil").unwrap();
        std::fs::write(share.path().join("empty.bin"), b"").unwrap();
        std::fs::write(share.path().join("music").join("Song.ogg"), pattern(70_000)).unwrap();
        Self {
            share,
            uploads: TempDir::new().unwrap(),
            downloads: TempDir::new().unwrap(),
        }
    }

    fn options(&self) -> Options {
        Options {
            chunk_size: 16 * 1024,
            max_chunks: 4,
            share_folder: self.share.path().to_path_buf(),
            upload_folder: self.uploads.path().to_path_buf(),
            download_folder: self.downloads.path().to_path_buf(),
            retry_interval_ms: 10,
            ping_interval_secs: 1,
            restart_interval_secs: 1,
            ..Options::default()
        }
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn bound<S: veil_core::Service>(server: &Arc<Server<S>>) -> u16 {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(addr) = server.local_addr() {
                return addr.port();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}

async fn share_server(site: &Site) -> (Arc<Server<ShareService>>, u16) {
    let mut peer = Peer::new("srv", Role::Server, "127.0.0.1", 0);
    peer.passphrase = Some(PASSPHRASE.into());
    peer.options = site.options();
    let service = ShareService::new(&peer);
    let server = Arc::new(Server::new(peer.clone(), service, Journal::disabled()));
    start(&server);
    let port = bound(&server).await;
    (server, port)
}

fn client(port: u16, passphrase: &str, site: &Site) -> Client {
    Client::new(
        "cli",
        &Endpoint::new("127.0.0.1", port),
        Group::from_passphrase(passphrase),
        site.options(),
        Journal::disabled(),
    )
}

async fn song(client: &Client) -> FileRef {
    let found = client.search("song").await.unwrap();
    assert_eq!(found.len(), 1);
    found[0].clone()
}

#[tokio::test]
async fn handshake_opens_a_session() {
    let site = Site::new();
    let (server, port) = share_server(&site).await;
    let conn = Connection::new("127.0.0.1", port, WAIT);
    let journal = Journal::disabled();
    let mut cmd = Command::new(&conn, &journal, "cli");

    let session = cmd.handshake().await.unwrap();
    assert!(!session.id.is_empty());
    assert!(server.sessions().contains(&session.id));

    let info = cmd.info(&session).await.unwrap();
    assert_eq!(info.role, Role::Server);
    server.machine().stop();
}

#[tokio::test]
async fn browse_and_search_through_the_group_layer() {
    let site = Site::new();
    let (server, port) = share_server(&site).await;
    let client = client(port, PASSPHRASE, &site);

    let root = client.browse(&FileRef::root()).await.unwrap();
    let files: Vec<_> = root.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(files, ["empty.bin", "notes.txt"]);
    assert_eq!(root.folders.len(), 1);

    let music = client.browse(&root.folders[0]).await.unwrap();
    assert_eq!(music.files[0].id, "music/Song.ogg");
    assert_eq!(music.files[0].size, 70_000);

    let missing = FileRef {
        id: "nowhere".into(),
        ..FileRef::default()
    };
    let err = client.browse(&missing).await.unwrap_err();
    assert_eq!(err.code(), Some(Code::NotFound));
    server.machine().stop();
}

#[tokio::test]
async fn another_group_is_unauthorized() {
    let site = Site::new();
    let (server, port) = share_server(&site).await;
    let outsider = client(port, "different", &site);

    let err = outsider.search("song").await.unwrap_err();
    assert!(matches!(err, CommandError::Status(Code::Unauthorized)));
    server.machine().stop();
}

#[tokio::test]
async fn removed_session_is_unauthorized() {
    let site = Site::new();
    let (server, port) = share_server(&site).await;
    let conn = Connection::new("127.0.0.1", port, WAIT);
    let journal = Journal::disabled();
    let mut cmd = Command::new(&conn, &journal, "cli");

    let session = cmd.handshake().await.unwrap();
    server.sessions().remove(&session.id);
    let err = cmd.ping(&session).await.unwrap_err();
    assert_eq!(err.code(), Some(Code::Unauthorized));
    server.machine().stop();
}

#[tokio::test]
async fn download_end_to_end() {
    let site = Site::new();
    let (server, port) = share_server(&site).await;
    let client = client(port, PASSPHRASE, &site);
    let file = song(&client).await;

    let dest = site.downloads.path().join("Song.ogg");
    let bytes = client.download(&file, &dest).await.unwrap();
    assert_eq!(bytes, 70_000);
    assert_eq!(std::fs::read(&dest).unwrap(), pattern(70_000));
    assert_eq!(server.service().open_downloads(), 0);
    server.machine().stop();
}

#[tokio::test]
async fn empty_file_downloads_without_a_transfer() {
    let site = Site::new();
    let (server, port) = share_server(&site).await;
    let client = client(port, PASSPHRASE, &site);
    let file = client.search("empty").await.unwrap().remove(0);

    let dest = site.downloads.path().join("empty.bin");
    assert_eq!(client.download(&file, &dest).await.unwrap(), 0);
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
    server.machine().stop();
}

#[tokio::test]
async fn missing_file_is_not_found() {
    let site = Site::new();
    let (server, port) = share_server(&site).await;
    let client = client(port, PASSPHRASE, &site);
    let ghost = FileRef {
        id: "ghost.txt".into(),
        name: "ghost.txt".into(),
        size: 3,
    };
    let err = client
        .download(&ghost, &site.downloads.path().join("ghost.txt"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransferError::Command(CommandError::Status(Code::NotFound))
    ));
    server.machine().stop();
}

async fn wait_for_uploads(server: &Server<ShareService>) {
    tokio::time::timeout(WAIT, async {
        while server.service().open_uploads() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn upload_end_to_end() {
    let site = Site::new();
    let (server, port) = share_server(&site).await;
    let client = client(port, PASSPHRASE, &site);

    let local = TempDir::new().unwrap();
    let source = local.path().join("report.pdf");
    std::fs::write(&source, pattern(50_000)).unwrap();

    assert_eq!(client.upload(&source).await.unwrap(), 50_000);
    wait_for_uploads(&server).await;
    let stored = std::fs::read(site.uploads.path().join("report.pdf")).unwrap();
    assert_eq!(stored, pattern(50_000));
    server.machine().stop();
}

#[tokio::test]
async fn upload_follows_the_server_piece_size() {
    let site = Site::new();
    let (server, port) = share_server(&site).await;
    let options = Options {
        chunk_size: 5_000,
        ..site.options()
    };
    let client = Client::new(
        "cli",
        &Endpoint::new("127.0.0.1", port),
        Group::from_passphrase(PASSPHRASE),
        options,
        Journal::disabled(),
    );

    let local = TempDir::new().unwrap();
    let source = local.path().join("odd.bin");
    std::fs::write(&source, pattern(40_001)).unwrap();
    assert_eq!(client.upload(&source).await.unwrap(), 40_001);
    wait_for_uploads(&server).await;
    let stored = std::fs::read(site.uploads.path().join("odd.bin")).unwrap();
    assert_eq!(stored, pattern(40_001));
    server.machine().stop();
}

async fn router(server_port: u16) -> (Arc<Server<RelayService>>, u16) {
    let upstream = Endpoint::new("127.0.0.1", server_port);
    let mut peer = Peer::new("rt", Role::Router, "127.0.0.1", 0);
    peer.upstream = Some(upstream.clone());
    let relay = RelayService::new("rt", &upstream, WAIT, Journal::disabled());
    let router = Arc::new(Server::new(peer, relay, Journal::disabled()));
    start(&router);
    let port = bound(&router).await;
    (router, port)
}

#[tokio::test]
async fn router_relays_to_the_upstream_server() {
    let site = Site::new();
    let (server, server_port) = share_server(&site).await;
    let (router, router_port) = router(server_port).await;

    let client = client(router_port, PASSPHRASE, &site);
    let file = song(&client).await;
    let dest = site.downloads.path().join("relayed.ogg");
    client.download(&file, &dest).await.unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), pattern(70_000));

    // The router talks to the server over its own session.
    assert_eq!(server.sessions().len(), 1);

    router.machine().stop();
    server.machine().stop();
}

#[tokio::test]
async fn outsider_through_router_keeps_the_upstream_session() {
    let site = Site::new();
    let (server, server_port) = share_server(&site).await;
    let (router, router_port) = router(server_port).await;
    let member = client(router_port, PASSPHRASE, &site);
    song(&member).await;
    assert_eq!(server.sessions().len(), 1);

    let outsider = client(router_port, "different", &site);
    for _ in 0..3 {
        let err = outsider.search("song").await.unwrap_err();
        assert_eq!(err.code(), Some(Code::Unauthorized));
    }
    assert_eq!(server.sessions().len(), 1);
    song(&member).await;
    assert_eq!(server.sessions().len(), 1);

    router.machine().stop();
    server.machine().stop();
}

#[tokio::test]
async fn router_replaces_an_expired_upstream_session() {
    let site = Site::new();
    let (server, server_port) = share_server(&site).await;
    let (router, router_port) = router(server_port).await;
    let member = client(router_port, PASSPHRASE, &site);
    song(&member).await;

    server.sessions().clear();
    song(&member).await;
    assert_eq!(server.sessions().len(), 1);

    router.machine().stop();
    server.machine().stop();
}

#[tokio::test]
async fn heartbeat_reports_success() {
    let site = Site::new();
    let (server, port) = share_server(&site).await;
    let heartbeat = Arc::new(ClientMachine::new(
        "cli",
        Endpoint::new("127.0.0.1", port),
        site.options(),
        Journal::disabled(),
    ));
    let mut status = heartbeat.machine().subscribe();
    start(&heartbeat);
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == Status::Success))
        .await
        .unwrap()
        .unwrap();
    heartbeat.machine().stop();
    server.machine().stop();
}

#[tokio::test]
async fn heartbeat_to_nowhere_reports_error() {
    let site = Site::new();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let heartbeat = Arc::new(ClientMachine::new(
        "cli",
        Endpoint::new("127.0.0.1", port),
        site.options(),
        Journal::disabled(),
    ));
    let mut status = heartbeat.machine().subscribe();
    start(&heartbeat);
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == Status::Error))
        .await
        .unwrap()
        .unwrap();
    heartbeat.machine().stop();
}

#[tokio::test]
async fn transfer_queue_runs_every_job() {
    let site = Site::new();
    let (server, port) = share_server(&site).await;
    let lookup = client(port, PASSPHRASE, &site);
    let mut files = lookup.browse(&FileRef::root()).await.unwrap().files;
    files.push(song(&lookup).await);
    assert_eq!(files.len(), 3);

    let queue = Arc::new(transfer_queue(
        "cli",
        Endpoint::new("127.0.0.1", port),
        Group::from_passphrase(PASSPHRASE),
        site.options(),
        Journal::disabled(),
        2,
    ));
    start(&queue);
    let jobs: Vec<_> = files
        .into_iter()
        .map(|file| Arc::new(TransferJob::download(file, site.downloads.path())))
        .collect();
    for job in &jobs {
        queue.add(job.clone());
    }

    tokio::time::timeout(WAIT, async {
        while jobs.iter().any(|job| job.status() != Status::Success) {
            assert!(queue.queue().active() <= 2);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(
        std::fs::read(site.downloads.path().join("Song.ogg")).unwrap(),
        pattern(70_000)
    );
    assert_eq!(
        std::fs::read(site.downloads.path().join("notes.txt")).unwrap(),
        b"hello veil"
    );
    queue.machine().stop();
    server.machine().stop();
}
