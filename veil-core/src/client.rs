//! Client role.
//!
//! `ClientMachine` is the heartbeat: `Init -> Handshake -> Ping -> Quit`, then
//! sleep the ping interval and start over. Any failure goes to `Restart`,
//! which sleeps the restart interval before `Init`. `Client` offers one-shot
//! requests (handshake, one command, quit) for front-ends.

use std::path::Path;
use std::sync::Arc;

use crate::command::{ClientSession, Command, CommandError};
use crate::connection::Connection;
use crate::crypto::Group;
use crate::journal::Journal;
use crate::machine::{Demon, Machine, MachineState, Status, TICK};
use crate::options::Options;
use crate::peer::{Endpoint, Peer};
use crate::protocol::{BrowseResponseData, FileRef, InfoData};
use crate::transfer::{self, TransferError};

pub struct ClientMachine {
    machine: Machine,
    name: String,
    endpoint: Endpoint,
    connection: Connection,
    options: Options,
    journal: Journal,
}

impl ClientMachine {
    pub fn new(
        name: impl Into<String>,
        endpoint: Endpoint,
        options: Options,
        journal: Journal,
    ) -> Self {
        let name = name.into();
        let connection = Connection::new(
            endpoint.address.clone(),
            endpoint.port,
            options.request_timeout(),
        );
        Self {
            machine: Machine::new(name.clone()),
            name,
            endpoint,
            connection,
            options,
            journal,
        }
    }

    /// Heartbeat towards the peer's configured server or router.
    pub fn for_peer(peer: &Peer, journal: Journal) -> Self {
        Self::new(peer.name.clone(), peer.endpoint(), peer.options.clone(), journal)
    }

    fn command(&self) -> Command<'_> {
        Command::new(&self.connection, &self.journal, &self.name)
    }

    fn fail(&self, step: &str, e: &CommandError) {
        tracing::warn!(
            peer = %self.name,
            server = %self.connection.endpoint(),
            step,
            error = %e,
            "heartbeat failed"
        );
        self.machine.set_status(Status::Error);
        self.machine.set_state(MachineState::Restart);
    }
}

impl Demon for ClientMachine {
    fn machine(&self) -> &Machine {
        &self.machine
    }

    async fn run(self: Arc<Self>) {
        let mut session: Option<ClientSession> = None;
        loop {
            match self.next_state() {
                MachineState::None => break,
                MachineState::Init => {
                    if self.name.is_empty() || !self.endpoint.is_valid() {
                        tracing::warn!(peer = %self.name, "invalid peer; restarting");
                        self.machine.set_status(Status::Warning);
                        self.machine.set_state(MachineState::Restart);
                    } else {
                        self.machine.set_state(MachineState::Handshake);
                    }
                }
                MachineState::Handshake => match self.command().handshake().await {
                    Ok(established) => {
                        session = Some(established);
                        self.machine.set_state(MachineState::Ping);
                    }
                    Err(e) => self.fail("handshake", &e),
                },
                MachineState::Ping => match session.as_ref() {
                    Some(s) => match self.command().ping(s).await {
                        Ok(()) => {
                            self.machine.set_status(Status::Success);
                            self.machine.set_state(MachineState::Quit);
                        }
                        Err(e) => self.fail("ping", &e),
                    },
                    None => self.machine.set_state(MachineState::Restart),
                },
                MachineState::Quit => {
                    if let Some(s) = session.take() {
                        if let Err(e) = self.command().quit(&s).await {
                            self.fail("quit", &e);
                            tokio::time::sleep(TICK).await;
                            continue;
                        }
                    }
                    self.machine
                        .sleep(self.options.ping_interval(), MachineState::Init);
                }
                MachineState::Restart => {
                    session = None;
                    self.machine
                        .sleep(self.options.restart_interval(), MachineState::Init);
                }
                MachineState::Shutdown => {
                    if let Some(s) = session.take() {
                        if let Err(e) = self.command().quit(&s).await {
                            tracing::debug!(peer = %self.name, error = %e, "quit failed");
                        }
                    }
                    self.machine.set_state(MachineState::None);
                }
                _ => {}
            }
            tokio::time::sleep(TICK).await;
        }
        self.machine.set_status(Status::None);
    }
}

/// One-shot requests against a server or router.
pub struct Client {
    name: String,
    connection: Connection,
    group: Group,
    options: Options,
    journal: Journal,
}

impl Client {
    pub fn new(
        name: impl Into<String>,
        endpoint: &Endpoint,
        group: Group,
        options: Options,
        journal: Journal,
    ) -> Self {
        let timeout = options.request_timeout();
        Self {
            name: name.into(),
            connection: Connection::new(endpoint.address.clone(), endpoint.port, timeout),
            group,
            options,
            journal,
        }
    }

    pub fn for_peer(peer: &Peer, journal: Journal) -> Self {
        Self::new(
            peer.name.clone(),
            &peer.endpoint(),
            peer.group(),
            peer.options.clone(),
            journal,
        )
    }

    fn command(&self) -> Command<'_> {
        Command::new(&self.connection, &self.journal, &self.name)
    }

    async fn close(&self, session: &ClientSession) {
        if let Err(e) = self.command().quit(session).await {
            tracing::debug!(peer = %self.name, error = %e, "quit failed");
        }
    }

    pub async fn info(&self) -> Result<InfoData, CommandError> {
        let session = self.command().handshake().await?;
        let result = self.command().info(&session).await;
        self.close(&session).await;
        result
    }

    pub async fn search(&self, keyword: &str) -> Result<Vec<FileRef>, CommandError> {
        let session = self.command().handshake().await?;
        let result = self.command().search(&session, &self.group, keyword).await;
        self.close(&session).await;
        result
    }

    pub async fn browse(&self, folder: &FileRef) -> Result<BrowseResponseData, CommandError> {
        let session = self.command().handshake().await?;
        let result = self.command().browse(&session, &self.group, folder).await;
        self.close(&session).await;
        result
    }

    /// Pull `file` into `dest`. Returns the number of bytes written.
    pub async fn download(&self, file: &FileRef, dest: &Path) -> Result<u64, TransferError> {
        let session = self.command().handshake().await?;
        let mut command = self.command();
        let result = transfer::download(
            &mut command,
            &session,
            &self.group,
            file,
            dest,
            &self.options,
            None,
        )
        .await;
        self.close(&session).await;
        result
    }

    /// Push the local file at `source`. Returns the number of bytes sent.
    pub async fn upload(&self, source: &Path) -> Result<u64, TransferError> {
        let session = self.command().handshake().await?;
        let mut command = self.command();
        let result = transfer::upload(
            &mut command,
            &session,
            &self.group,
            source,
            &self.options,
            None,
        )
        .await;
        self.close(&session).await;
        result
    }
}
