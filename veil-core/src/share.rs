//! Server role: serves a shared folder to group members.
//!
//! Browse, Search and transfer payloads are group-sealed. Downloads are
//! pulled: the open request starts a reader that fills a chunk coordinator,
//! and every follow-up request pops one buffered piece. Uploads are pushed:
//! each request deposits a piece, refused while the buffer is full, and a
//! writer drains the buffer to disk.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::chunk::{ChunkCoordinator, Piece};
use crate::crypto::Group;
use crate::dispatch::{Reply, Service};
use crate::envelope::{self, EnvelopeError};
use crate::options::Options;
use crate::peer::Peer;
use crate::protocol::{
    BrowseRequestData, BrowseResponseData, Code, DownloadRequestData, FileRef, Message,
    MessageKind, SearchRequestData, SearchResponseData, UploadRequestData,
};
use crate::session::Session;

/// Search stops collecting after this many hits.
pub const MAX_SEARCH_RESULTS: usize = 256;

/// Numbered variants tried before an upload name is refused.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Read-only view of the share root. Ids are `/`-separated paths relative to it.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an id onto the root. Anything but plain path segments is refused.
    pub fn resolve(&self, id: &str) -> Option<PathBuf> {
        let mut path = self.root.clone();
        for part in id.split('/').filter(|p| !p.is_empty()) {
            let mut components = Path::new(part).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(name)), None) => path.push(name),
                _ => return None,
            }
        }
        Some(path)
    }

    fn child_id(parent: &str, name: &str) -> String {
        let parent = parent.trim_matches('/');
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}/{name}")
        }
    }

    /// List one folder. None if the folder does not exist.
    pub async fn browse(&self, folder: &FileRef) -> std::io::Result<Option<BrowseResponseData>> {
        let Some(path) = self.resolve(&folder.id) else {
            return Ok(None);
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }
        let mut listing = BrowseResponseData::default();
        let mut entries = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata().await?;
            let item = FileRef {
                id: Self::child_id(&folder.id, &name),
                name,
                size: if meta.is_file() { meta.len() } else { 0 },
            };
            if meta.is_dir() {
                listing.folders.push(item);
            } else if meta.is_file() {
                listing.files.push(item);
            }
        }
        listing.files.sort_by(|a, b| a.name.cmp(&b.name));
        listing.folders.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(listing))
    }

    /// Case-insensitive substring match over file names, whole tree.
    pub async fn search(&self, keyword: &str) -> std::io::Result<Vec<FileRef>> {
        let needle = keyword.trim().to_lowercase();
        let mut found = Vec::new();
        if needle.is_empty() {
            return Ok(found);
        }
        let mut stack = vec![String::new()];
        while let Some(folder) = stack.pop() {
            let Some(path) = self.resolve(&folder) else {
                continue;
            };
            let mut entries = match tokio::fs::read_dir(&path).await {
                Ok(entries) => entries,
                Err(e) if folder.is_empty() => return Err(e),
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let meta = entry.metadata().await?;
                let id = Self::child_id(&folder, &name);
                if meta.is_dir() {
                    stack.push(id);
                } else if meta.is_file() && name.to_lowercase().contains(&needle) {
                    found.push(FileRef {
                        id,
                        name,
                        size: meta.len(),
                    });
                    if found.len() >= MAX_SEARCH_RESULTS {
                        return Ok(found);
                    }
                }
            }
        }
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    /// Path and size of a shared regular file.
    pub async fn open(&self, file: &FileRef) -> std::io::Result<Option<(PathBuf, u64)>> {
        let Some(path) = self.resolve(&file.id) else {
            return Ok(None);
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some((path, meta.len()))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// One open transfer: the coordinator plus the disk task feeding or draining it.
struct Transfer {
    name: String,
    coordinator: Arc<ChunkCoordinator>,
    failed: Arc<AtomicBool>,
    touched: Mutex<Instant>,
    task: JoinHandle<()>,
}

impl Transfer {
    fn touch(&self) {
        *self.touched.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle(&self) -> std::time::Duration {
        self.touched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

type Transfers = Arc<DashMap<String, Arc<Transfer>>>;

pub struct ShareService {
    name: String,
    store: FileStore,
    upload_folder: PathBuf,
    group: Group,
    options: Options,
    downloads: Transfers,
    uploads: Transfers,
}

/// Group-layer failures mean the caller is not a member; anything else is malformed.
fn reject(e: EnvelopeError) -> Reply {
    match e {
        EnvelopeError::Crypto(_) => Reply::Status(Code::Unauthorized),
        _ => Reply::Status(Code::BadRequest),
    }
}

impl ShareService {
    pub fn new(peer: &Peer) -> Self {
        Self {
            name: peer.name.clone(),
            store: FileStore::new(&peer.options.share_folder),
            upload_folder: peer.options.upload_folder.clone(),
            group: peer.group(),
            options: peer.options.clone(),
            downloads: Arc::new(DashMap::new()),
            uploads: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn open_downloads(&self) -> usize {
        self.downloads.len()
    }

    pub fn open_uploads(&self) -> usize {
        self.uploads.len()
    }

    async fn open_download(&self, message: Message, data: Option<String>) -> anyhow::Result<Reply> {
        let opened = envelope::open_user_data(&self.group, data.as_deref());
        let request: DownloadRequestData = match opened {
            Ok(request) => request,
            Err(e) => return Ok(reject(e)),
        };
        let Some((path, size)) = self.store.open(&request.file).await? else {
            return Ok(Reply::Status(Code::NotFound));
        };
        if size == 0 {
            let reply = message.reply(MessageKind::Download {
                transfer: None,
                chunk: None,
                size: Some(0),
            });
            return Ok(Reply::ok(reply, None));
        }

        let coordinator = Arc::new(ChunkCoordinator::new(
            size,
            self.options.chunk_size,
            self.options.max_chunks,
        ));
        let failed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(read_pieces(path, coordinator.clone(), failed.clone()));
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.downloads.insert(
            id.clone(),
            Arc::new(Transfer {
                name: request.file.name.clone(),
                coordinator,
                failed,
                touched: Mutex::new(Instant::now()),
                task,
            }),
        );
        tracing::info!(
            peer = %self.name,
            file = %request.file.id,
            size,
            transfer = %id,
            "download opened"
        );
        let reply = message.reply(MessageKind::Download {
            transfer: Some(id),
            chunk: None,
            size: Some(size),
        });
        Ok(Reply::ok(reply, None))
    }

    fn next_piece(&self, message: Message, id: &str) -> anyhow::Result<Reply> {
        let Some(transfer) = self.downloads.get(id).map(|t| Arc::clone(t.value())) else {
            return Ok(Reply::Status(Code::NotFound));
        };
        transfer.touch();
        if transfer.failed.load(Ordering::SeqCst) {
            self.downloads.remove(id);
            anyhow::bail!("reading {} failed", transfer.name);
        }
        let Some(piece) = transfer.coordinator.pop_data() else {
            let reply = message.reply(MessageKind::Download {
                transfer: Some(id.to_string()),
                chunk: None,
                size: None,
            });
            return Ok(Reply::ok(reply, None));
        };
        let data = envelope::seal_user_bytes(&self.group, &piece.data)?;
        if transfer.coordinator.finished() {
            self.downloads.remove(id);
            tracing::info!(
                peer = %self.name,
                transfer = %id,
                file = %transfer.name,
                "download complete"
            );
        }
        let reply = message.reply(MessageKind::Download {
            transfer: Some(id.to_string()),
            chunk: Some(piece.chunk),
            size: None,
        });
        Ok(Reply::ok(reply, Some(data)))
    }

    async fn open_upload(&self, message: Message, data: Option<String>) -> anyhow::Result<Reply> {
        let opened = envelope::open_user_data(&self.group, data.as_deref());
        let request: UploadRequestData = match opened {
            Ok(request) => request,
            Err(e) => return Ok(reject(e)),
        };
        let Some(name) = Path::new(&request.file.name).file_name() else {
            return Ok(Reply::Status(Code::BadRequest));
        };
        let name = name.to_string_lossy().into_owned();
        tokio::fs::create_dir_all(&self.upload_folder).await?;
        let (path, file) = create_unique(&self.upload_folder, &name).await?;
        file.set_len(request.file.size).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(name);

        let coordinator = Arc::new(ChunkCoordinator::new(
            request.file.size,
            self.options.chunk_size,
            self.options.max_chunks,
        ));
        let first = coordinator.chunk_at(0);
        let failed = Arc::new(AtomicBool::new(false));
        let id = uuid::Uuid::new_v4().simple().to_string();
        let task = tokio::spawn(write_pieces(
            file,
            coordinator.clone(),
            failed.clone(),
            self.uploads.clone(),
            id.clone(),
        ));
        self.uploads.insert(
            id.clone(),
            Arc::new(Transfer {
                name: name.clone(),
                coordinator,
                failed,
                touched: Mutex::new(Instant::now()),
                task,
            }),
        );
        tracing::info!(
            peer = %self.name,
            file = %name,
            size = request.file.size,
            transfer = %id,
            "upload opened"
        );
        let reply = message.reply(MessageKind::Upload {
            transfer: Some(id),
            chunk: first,
            accepted: None,
        });
        Ok(Reply::ok(reply, None))
    }

    fn accept_piece(
        &self,
        message: Message,
        id: &str,
        chunk: Option<crate::protocol::Chunk>,
        data: Option<String>,
    ) -> anyhow::Result<Reply> {
        let Some(transfer) = self.uploads.get(id).map(|t| Arc::clone(t.value())) else {
            return Ok(Reply::Status(Code::NotFound));
        };
        transfer.touch();
        if transfer.failed.load(Ordering::SeqCst) {
            self.uploads.remove(id);
            anyhow::bail!("writing {} failed", transfer.name);
        }
        let Some(chunk) = chunk else {
            return Ok(Reply::Status(Code::BadRequest));
        };
        let bytes = match envelope::open_user_bytes(&self.group, data.as_deref()) {
            Ok(bytes) => bytes,
            Err(e) => return Ok(reject(e)),
        };
        let coordinator = &transfer.coordinator;
        if bytes.len() != chunk.size as usize || !coordinator.claim(chunk) {
            return Ok(Reply::Status(Code::BadRequest));
        }
        let accepted = match coordinator.push_data(Piece { chunk, data: bytes }) {
            Ok(()) => true,
            Err(piece) => {
                coordinator.release(piece.chunk);
                false
            }
        };
        let reply = message.reply(MessageKind::Upload {
            transfer: Some(id.to_string()),
            chunk: Some(chunk),
            accepted: Some(accepted),
        });
        Ok(Reply::ok(reply, None))
    }

    fn expire(table: &Transfers, idle: std::time::Duration) -> usize {
        let stale: Vec<String> = table
            .iter()
            .filter(|t| t.value().idle() > idle)
            .map(|t| t.key().clone())
            .collect();
        for id in &stale {
            if let Some((_, transfer)) = table.remove(id) {
                transfer.task.abort();
            }
        }
        stale.len()
    }
}

/// Create `name` in `folder` without replacing anything; a taken name becomes
/// `stem (n).ext`.
async fn create_unique(folder: &Path, name: &str) -> std::io::Result<(PathBuf, tokio::fs::File)> {
    let base = Path::new(name);
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = base.extension().map(|e| e.to_string_lossy().into_owned());
    for n in 0..MAX_NAME_ATTEMPTS {
        let candidate = match (n, &ext) {
            (0, _) => name.to_string(),
            (n, Some(ext)) => format!("{stem} ({n}).{ext}"),
            (n, None) => format!("{stem} ({n})"),
        };
        let path = folder.join(candidate);
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match opened {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name for {name}"),
    ))
}

async fn read_pieces(path: PathBuf, coordinator: Arc<ChunkCoordinator>, failed: Arc<AtomicBool>) {
    let result: std::io::Result<()> = async {
        let mut file = tokio::fs::File::open(&path).await?;
        while let Some(chunk) = coordinator.pop_chunk() {
            coordinator.reserve().await;
            let mut data = vec![0u8; chunk.size as usize];
            file.seek(SeekFrom::Start(chunk.offset)).await?;
            file.read_exact(&mut data).await?;
            if let Err(piece) = coordinator.push_data(Piece { chunk, data }) {
                coordinator.push_chunk(piece.chunk);
            }
        }
        Ok(())
    }
    .await;
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "download reader failed");
        failed.store(true, Ordering::SeqCst);
    }
}

async fn write_pieces(
    mut file: tokio::fs::File,
    coordinator: Arc<ChunkCoordinator>,
    failed: Arc<AtomicBool>,
    table: Transfers,
    id: String,
) {
    let result: std::io::Result<()> = async {
        while let Some(piece) = coordinator.next_data().await {
            file.seek(SeekFrom::Start(piece.chunk.offset)).await?;
            file.write_all(&piece.data).await?;
        }
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    match result {
        Ok(()) => {
            table.remove(&id);
            tracing::info!(transfer = %id, "upload complete");
        }
        Err(e) => {
            tracing::warn!(transfer = %id, error = %e, "upload writer failed");
            failed.store(true, Ordering::SeqCst);
        }
    }
}

impl Service for ShareService {
    async fn search(
        &self,
        _session: &Session,
        message: Message,
        data: Option<String>,
    ) -> anyhow::Result<Reply> {
        let opened = envelope::open_user_data(&self.group, data.as_deref());
        let request: SearchRequestData = match opened {
            Ok(request) => request,
            Err(e) => return Ok(reject(e)),
        };
        let files = self.store.search(&request.keyword).await?;
        tracing::debug!(peer = %self.name, hits = files.len(), "search");
        let data = envelope::seal_user_data(&self.group, &SearchResponseData { files })?;
        Ok(Reply::ok(message, Some(data)))
    }

    async fn browse(
        &self,
        _session: &Session,
        message: Message,
        data: Option<String>,
    ) -> anyhow::Result<Reply> {
        let opened = envelope::open_user_data(&self.group, data.as_deref());
        let request: BrowseRequestData = match opened {
            Ok(request) => request,
            Err(e) => return Ok(reject(e)),
        };
        let Some(listing) = self.store.browse(&request.folder).await? else {
            return Ok(Reply::Status(Code::NotFound));
        };
        let data = envelope::seal_user_data(&self.group, &listing)?;
        Ok(Reply::ok(message, Some(data)))
    }

    async fn download(
        &self,
        _session: &Session,
        message: Message,
        data: Option<String>,
    ) -> anyhow::Result<Reply> {
        match &message.kind {
            MessageKind::Download {
                transfer: Some(id), ..
            } => {
                let id = id.clone();
                self.next_piece(message, &id)
            }
            _ => self.open_download(message, data).await,
        }
    }

    async fn upload(
        &self,
        _session: &Session,
        message: Message,
        data: Option<String>,
    ) -> anyhow::Result<Reply> {
        match &message.kind {
            MessageKind::Upload {
                transfer: Some(id),
                chunk,
                ..
            } => {
                let (id, chunk) = (id.clone(), *chunk);
                self.accept_piece(message, &id, chunk, data)
            }
            _ => self.open_upload(message, data).await,
        }
    }

    fn tick(&self) {
        let idle = self.options.idle_timeout();
        let expired = Self::expire(&self.downloads, idle) + Self::expire(&self.uploads, idle);
        if expired > 0 {
            tracing::debug!(peer = %self.name, expired, "idle transfers dropped");
        }
    }

    fn shutdown(&self) {
        for table in [&self.downloads, &self.uploads] {
            for entry in table.iter() {
                entry.value().task.abort();
            }
            table.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Chunk;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("music/live")).unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("music/Song.OGG"), vec![1u8; 10]).unwrap();
        std::fs::write(dir.path().join("music/live/song-live.ogg"), vec![2u8; 20]).unwrap();
        dir
    }

    #[test]
    fn resolve_rejects_traversal() {
        let store = FileStore::new("/srv/share");
        assert_eq!(store.resolve(""), Some(PathBuf::from("/srv/share")));
        assert_eq!(
            store.resolve("music/a.ogg"),
            Some(PathBuf::from("/srv/share/music/a.ogg"))
        );
        assert_eq!(store.resolve("../etc/passwd"), None);
        assert_eq!(store.resolve("music/../../x"), None);
        assert_eq!(store.resolve("./x"), None);
    }

    #[tokio::test]
    async fn browse_lists_folders_and_files() {
        let dir = tree();
        let store = FileStore::new(dir.path());
        let root = store.browse(&FileRef::root()).await.unwrap().unwrap();
        assert_eq!(root.files.len(), 1);
        assert_eq!(root.files[0].id, "readme.txt");
        assert_eq!(root.files[0].size, 5);
        assert_eq!(root.folders[0].id, "music");

        let music = store.browse(&root.folders[0]).await.unwrap().unwrap();
        assert_eq!(music.files[0].id, "music/Song.OGG");
        assert_eq!(music.folders[0].id, "music/live");

        let missing = FileRef {
            id: "nope".into(),
            name: "nope".into(),
            size: 0,
        };
        assert!(store.browse(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_is_case_insensitive_and_recursive() {
        let dir = tree();
        let store = FileStore::new(dir.path());
        let hits = store.search("song").await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["music/Song.OGG", "music/live/song-live.ogg"]);
        assert!(store.search("   ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_only_regular_files() {
        let dir = tree();
        let store = FileStore::new(dir.path());
        let file = FileRef {
            id: "music/Song.OGG".into(),
            name: "Song.OGG".into(),
            size: 0,
        };
        let (_, size) = store.open(&file).await.unwrap().unwrap();
        assert_eq!(size, 10);
        let folder = FileRef {
            id: "music".into(),
            name: "music".into(),
            size: 0,
        };
        assert!(store.open(&folder).await.unwrap().is_none());
    }

    fn upload_service(folder: &Path) -> ShareService {
        let mut peer = Peer::new("srv", crate::peer::Role::Server, "127.0.0.1", 0);
        peer.passphrase = Some("orchard".into());
        peer.options.upload_folder = folder.to_path_buf();
        peer.options.chunk_size = 4;
        peer.options.max_chunks = 4;
        ShareService::new(&peer)
    }

    fn session() -> Session {
        let key = crate::crypto::SessionKey::from_bytes([7; 32]);
        Session::new(key, "cli".into(), "127.0.0.1:1".parse().unwrap())
    }

    async fn open_upload(service: &ShareService, name: &str, size: u64) -> String {
        let request = UploadRequestData {
            file: FileRef {
                id: name.into(),
                name: name.into(),
                size,
            },
        };
        let data = envelope::seal_user_data(&Group::from_passphrase("orchard"), &request).unwrap();
        let message = Message::new(MessageKind::Upload {
            transfer: None,
            chunk: None,
            accepted: None,
        });
        match service.upload(&session(), message, Some(data)).await.unwrap() {
            Reply::Ok { message, .. } => match message.kind {
                MessageKind::Upload {
                    transfer: Some(id), ..
                } => id,
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn send_piece(service: &ShareService, id: &str, chunk: Chunk, bytes: &[u8]) -> Reply {
        let data = envelope::seal_user_bytes(&Group::from_passphrase("orchard"), bytes).unwrap();
        let message = Message::new(MessageKind::Upload {
            transfer: Some(id.into()),
            chunk: Some(chunk),
            accepted: None,
        });
        service.upload(&session(), message, Some(data)).await.unwrap()
    }

    fn accepted(reply: &Reply) -> Option<bool> {
        match reply {
            Reply::Ok { message, .. } => match message.kind {
                MessageKind::Upload { accepted, .. } => accepted,
                _ => None,
            },
            Reply::Status(_) => None,
        }
    }

    #[tokio::test]
    async fn upload_takes_each_expected_piece_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let service = upload_service(dir.path());
        let id = open_upload(&service, "a.bin", 8).await;

        let first = Chunk { offset: 0, size: 4 };
        assert_eq!(accepted(&send_piece(&service, &id, first, b"AAAA").await), Some(true));
        let again = send_piece(&service, &id, first, b"AAAA").await;
        assert_eq!(again, Reply::Status(Code::BadRequest));
        let misaligned = Chunk { offset: 2, size: 4 };
        let reply = send_piece(&service, &id, misaligned, b"CCCC").await;
        assert_eq!(reply, Reply::Status(Code::BadRequest));
        let past_end = Chunk {
            offset: u64::MAX,
            size: 1,
        };
        let reply = send_piece(&service, &id, past_end, b"D").await;
        assert_eq!(reply, Reply::Status(Code::BadRequest));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(service.open_uploads(), 1);

        let second = Chunk { offset: 4, size: 4 };
        assert_eq!(accepted(&send_piece(&service, &id, second, b"BBBB").await), Some(true));
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while service.open_uploads() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), b"AAAABBBB");
    }

    #[tokio::test]
    async fn uploads_never_replace_existing_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"old").unwrap();
        let service = upload_service(dir.path());
        open_upload(&service, "a.bin", 4).await;
        open_upload(&service, "a.bin", 4).await;

        assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), b"old");
        assert!(dir.path().join("a (1).bin").exists());
        assert!(dir.path().join("a (2).bin").exists());
        assert_eq!(service.open_uploads(), 2);
    }
}
