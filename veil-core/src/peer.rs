//! Peers and the registry that runs them.
//!
//! A `Peer` is a configured node. The registry owns the descriptors and, for
//! each started peer, the machines implementing its role:
//!   - server: `Server<ShareService>`
//!   - router: `Server<RelayService>` plus a heartbeat to its upstream
//!   - client: heartbeat plus download and upload queues

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::client::{Client, ClientMachine};
use crate::crypto::Group;
use crate::dispatch::Server;
use crate::journal::Journal;
use crate::machine::{self, Demon, Machine, Status};
use crate::options::Options;
use crate::protocol::FileRef;
use crate::relay::RelayService;
use crate::share::ShareService;
use crate::transfer::{transfer_queue, TransferJob, TransferQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Server,
    Router,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Dialable: needs an address and a non-zero port.
    pub fn is_valid(&self) -> bool {
        !self.address.trim().is_empty() && self.port != 0
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_enabled() -> bool {
    true
}

/// Configured node. For servers and routers `address:port` is where they
/// listen; for clients it is the server or router they talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    pub role: Role,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Where a router forwards to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Endpoint>,
    #[serde(default)]
    pub options: Options,
}

impl Peer {
    pub fn new(name: impl Into<String>, role: Role, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            role,
            address: address.into(),
            port,
            enabled: true,
            passphrase: None,
            upstream: None,
            options: Options::default(),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address.clone(), self.port)
    }

    pub fn group(&self) -> Group {
        Group::from_passphrase(self.passphrase.as_deref().unwrap_or_default())
    }

    /// Well-formed for its role. Listeners may use port 0; clients and
    /// upstreams must be dialable.
    pub fn is_valid(&self) -> bool {
        if self.name.trim().is_empty() || self.address.trim().is_empty() {
            return false;
        }
        match self.role {
            Role::Client => self.port != 0,
            Role::Server => true,
            Role::Router => self.upstream.as_ref().is_some_and(Endpoint::is_valid),
        }
    }
}

/// Peer-list mutations, for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Added(Peer),
    Removed(String),
    Changed(Peer),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown peer {0}")]
    Unknown(String),
    #[error("peer {0} already registered")]
    Duplicate(String),
    #[error("peer {0} is not a client")]
    NotClient(String),
}

/// Machines implementing one started peer.
enum Runner {
    Server(Arc<Server<ShareService>>),
    Router {
        server: Arc<Server<RelayService>>,
        heartbeat: Arc<ClientMachine>,
    },
    Client {
        heartbeat: Arc<ClientMachine>,
        downloads: Arc<TransferQueue>,
        uploads: Arc<TransferQueue>,
    },
}

impl Runner {
    fn launch(peer: &Peer, journal: &Journal) -> (Self, Vec<JoinHandle<()>>) {
        match peer.role {
            Role::Server => {
                let service = ShareService::new(peer);
                let server = Arc::new(Server::new(peer.clone(), service, journal.clone()));
                let handles = vec![machine::start(&server)];
                (Runner::Server(server), handles)
            }
            Role::Router => {
                let upstream = peer.upstream.clone().unwrap_or_else(|| Endpoint::new("", 0));
                let relay = RelayService::new(
                    peer.name.clone(),
                    &upstream,
                    peer.options.request_timeout(),
                    journal.clone(),
                );
                let server = Arc::new(Server::new(peer.clone(), relay, journal.clone()));
                let heartbeat = Arc::new(ClientMachine::new(
                    peer.name.clone(),
                    upstream,
                    peer.options.clone(),
                    journal.clone(),
                ));
                let handles = vec![machine::start(&server), machine::start(&heartbeat)];
                (Runner::Router { server, heartbeat }, handles)
            }
            Role::Client => {
                let heartbeat = Arc::new(ClientMachine::for_peer(peer, journal.clone()));
                let queue = |max| {
                    Arc::new(transfer_queue(
                        &peer.name,
                        peer.endpoint(),
                        peer.group(),
                        peer.options.clone(),
                        journal.clone(),
                        max,
                    ))
                };
                let downloads = queue(peer.options.max_downloads);
                let uploads = queue(peer.options.max_uploads);
                let handles = vec![
                    machine::start(&heartbeat),
                    machine::start(&downloads),
                    machine::start(&uploads),
                ];
                (
                    Runner::Client {
                        heartbeat,
                        downloads,
                        uploads,
                    },
                    handles,
                )
            }
        }
    }

    /// The machine whose status stands for the peer.
    fn primary(&self) -> &Machine {
        match self {
            Runner::Server(server) => server.machine(),
            Runner::Router { server, .. } => server.machine(),
            Runner::Client { heartbeat, .. } => heartbeat.machine(),
        }
    }

    fn machines(&self) -> Vec<&Machine> {
        match self {
            Runner::Server(server) => vec![server.machine()],
            Runner::Router { server, heartbeat } => vec![server.machine(), heartbeat.machine()],
            Runner::Client {
                heartbeat,
                downloads,
                uploads,
            } => vec![heartbeat.machine(), downloads.machine(), uploads.machine()],
        }
    }

    fn stop(&self) {
        for machine in self.machines() {
            machine.stop();
        }
    }

    fn restart(&self) {
        for machine in self.machines() {
            machine.restart();
        }
    }
}

struct Entry {
    peer: Peer,
    runner: Option<Runner>,
    handles: Vec<JoinHandle<()>>,
}

/// Owns the configured peers and their running machines. Pass it explicitly
/// to whatever needs to drive peers.
pub struct PeerRegistry {
    entries: Mutex<Vec<Entry>>,
    journal: Journal,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerRegistry {
    pub fn new(journal: Journal) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            entries: Mutex::new(Vec::new()),
            journal,
            events,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn with_entry<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Entry) -> T,
    ) -> Result<T, RegistryError> {
        let mut entries = self.entries();
        let entry = entries
            .iter_mut()
            .find(|e| e.peer.id == id)
            .ok_or_else(|| RegistryError::Unknown(id.to_string()))?;
        Ok(f(entry))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn add(&self, peer: Peer) -> Result<(), RegistryError> {
        {
            let mut entries = self.entries();
            if entries.iter().any(|e| e.peer.id == peer.id) {
                return Err(RegistryError::Duplicate(peer.id));
            }
            entries.push(Entry {
                peer: peer.clone(),
                runner: None,
                handles: Vec::new(),
            });
        }
        tracing::debug!(peer = %peer.name, role = ?peer.role, "added");
        self.emit(PeerEvent::Added(peer));
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<Peer, RegistryError> {
        let entry = {
            let mut entries = self.entries();
            let index = entries
                .iter()
                .position(|e| e.peer.id == id)
                .ok_or_else(|| RegistryError::Unknown(id.to_string()))?;
            entries.remove(index)
        };
        if let Some(runner) = &entry.runner {
            runner.stop();
        }
        self.emit(PeerEvent::Removed(id.to_string()));
        Ok(entry.peer)
    }

    /// Replace a peer's descriptor. A running peer is restarted on the new one.
    pub fn update(&self, peer: Peer) -> Result<(), RegistryError> {
        let running = self.with_entry(&peer.id, |entry| {
            entry.peer = peer.clone();
            entry.runner.is_some()
        })?;
        if running {
            self.stop(&peer.id)?;
            self.start(&peer.id)?;
        } else {
            self.emit(PeerEvent::Changed(peer));
        }
        Ok(())
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.entries().iter().map(|e| e.peer.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.entries()
            .iter()
            .find(|e| e.peer.id == id)
            .map(|e| e.peer.clone())
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.with_entry(id, |e| e.runner.is_some()).unwrap_or(false)
    }

    /// Status of a started peer.
    pub fn status(&self, id: &str) -> Option<Status> {
        self.with_entry(id, |e| e.runner.as_ref().map(|r| r.primary().status()))
            .ok()
            .flatten()
    }

    pub fn watch(&self, id: &str) -> Option<watch::Receiver<Status>> {
        self.with_entry(id, |e| e.runner.as_ref().map(|r| r.primary().subscribe()))
            .ok()
            .flatten()
    }

    /// Start the peer's machines. A no-op when already running.
    pub fn start(&self, id: &str) -> Result<(), RegistryError> {
        let journal = self.journal.clone();
        let started = self.with_entry(id, |entry| {
            if entry.runner.is_some() {
                return None;
            }
            let (runner, handles) = Runner::launch(&entry.peer, &journal);
            entry.runner = Some(runner);
            entry.handles = handles;
            Some(entry.peer.clone())
        })?;
        if let Some(peer) = started {
            tracing::info!(peer = %peer.name, role = ?peer.role, "started");
            self.emit(PeerEvent::Changed(peer));
        }
        Ok(())
    }

    pub fn stop(&self, id: &str) -> Result<(), RegistryError> {
        let stopped = self.with_entry(id, |entry| {
            let runner = entry.runner.take()?;
            runner.stop();
            Some(entry.peer.clone())
        })?;
        if let Some(peer) = stopped {
            tracing::info!(peer = %peer.name, "stopped");
            self.emit(PeerEvent::Changed(peer));
        }
        Ok(())
    }

    /// Restart a running peer's machines, or start it.
    pub fn restart(&self, id: &str) -> Result<(), RegistryError> {
        let running = self.with_entry(id, |entry| match &entry.runner {
            Some(runner) => {
                runner.restart();
                true
            }
            None => false,
        })?;
        if !running {
            self.start(id)?;
        }
        Ok(())
    }

    /// Flip `enabled`, starting or stopping the peer to match.
    pub fn toggle(&self, id: &str) -> Result<bool, RegistryError> {
        let peer = self.with_entry(id, |entry| {
            entry.peer.enabled = !entry.peer.enabled;
            entry.peer.clone()
        })?;
        if peer.enabled {
            self.start(id)?;
        } else {
            self.stop(id)?;
        }
        Ok(peer.enabled)
    }

    /// Start every enabled peer.
    pub fn start_enabled(&self) {
        let ids: Vec<String> = self
            .entries()
            .iter()
            .filter(|e| e.peer.enabled)
            .map(|e| e.peer.id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.start(&id) {
                tracing::warn!(peer = %id, error = %e, "start failed");
            }
        }
    }

    /// One-shot request API bound to a client peer.
    pub fn client(&self, id: &str) -> Result<Client, RegistryError> {
        let peer = self.get(id).ok_or_else(|| RegistryError::Unknown(id.to_string()))?;
        if peer.role != Role::Client {
            return Err(RegistryError::NotClient(id.to_string()));
        }
        Ok(Client::for_peer(&peer, self.journal.clone()))
    }

    /// Queue a download on a running client peer.
    pub fn download(&self, id: &str, file: FileRef) -> Result<Arc<TransferJob>, RegistryError> {
        self.with_entry(id, |entry| match &entry.runner {
            Some(Runner::Client { downloads, .. }) => {
                let folder = &entry.peer.options.download_folder;
                let job = Arc::new(TransferJob::download(file, folder));
                downloads.add(job.clone());
                Ok(job)
            }
            _ => Err(RegistryError::NotClient(id.to_string())),
        })?
    }

    /// Queue an upload of a local file on a running client peer.
    pub fn upload(
        &self,
        id: &str,
        path: PathBuf,
        size: u64,
    ) -> Result<Arc<TransferJob>, RegistryError> {
        self.with_entry(id, |entry| match &entry.runner {
            Some(Runner::Client { uploads, .. }) => {
                let job = Arc::new(TransferJob::upload(path, size));
                uploads.add(job.clone());
                Ok(job)
            }
            _ => Err(RegistryError::NotClient(id.to_string())),
        })?
    }

    /// Stop every peer and wait up to `grace` for their machines to finish.
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<JoinHandle<()>> = {
            let mut entries = self.entries();
            entries
                .iter_mut()
                .flat_map(|entry| {
                    if let Some(runner) = entry.runner.take() {
                        runner.stop();
                    }
                    std::mem::take(&mut entry.handles)
                })
                .collect()
        };
        let all = join_machines(handles);
        if tokio::time::timeout(grace, all).await.is_err() {
            tracing::warn!("machines still running after shutdown grace period");
        }
    }
}

async fn join_machines(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}
