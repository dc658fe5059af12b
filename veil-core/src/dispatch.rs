//! Connection dispatch engine.
//!
//! `Server` is the listening role shared by servers and routers. Each accepted
//! stream gets its own task that reads one request, authenticates it against
//! the session table, routes it by message type and writes exactly one reply.
//! The stream is shut down on every path.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;

use crate::connection::{self, Channel, Responder};
use crate::crypto::SessionKey;
use crate::envelope;
use crate::identity::Keypair;
use crate::journal::{Exchange, Journal};
use crate::machine::{Demon, Machine, MachineState, Status, TICK};
use crate::peer::Peer;
use crate::protocol::{
    Code, InfoData, Message, MessageKind, Packet, Request, Response, PROTOCOL_VERSION,
};
use crate::session::{Session, SessionTable};
use crate::wire::FrameIoError;

/// How long one `Listen` tick waits for a connection before re-checking state.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Handler result. Only `Ok` replies carry a message and data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok {
        message: Message,
        data: Option<String>,
    },
    Status(Code),
}

impl Reply {
    pub fn ok(message: Message, data: Option<String>) -> Self {
        Reply::Ok { message, data }
    }

    pub fn code(&self) -> Code {
        match self {
            Reply::Ok { .. } => Code::Ok,
            Reply::Status(code) => *code,
        }
    }
}

/// Role-specific handlers for the user-data message types.
/// Anything a role does not handle is a bad request.
pub trait Service: Send + Sync + 'static {
    fn search(
        &self,
        session: &Session,
        message: Message,
        data: Option<String>,
    ) -> impl Future<Output = anyhow::Result<Reply>> + Send {
        let _ = (session, message, data);
        async { Ok(Reply::Status(Code::BadRequest)) }
    }

    fn browse(
        &self,
        session: &Session,
        message: Message,
        data: Option<String>,
    ) -> impl Future<Output = anyhow::Result<Reply>> + Send {
        let _ = (session, message, data);
        async { Ok(Reply::Status(Code::BadRequest)) }
    }

    fn download(
        &self,
        session: &Session,
        message: Message,
        data: Option<String>,
    ) -> impl Future<Output = anyhow::Result<Reply>> + Send {
        let _ = (session, message, data);
        async { Ok(Reply::Status(Code::BadRequest)) }
    }

    fn upload(
        &self,
        session: &Session,
        message: Message,
        data: Option<String>,
    ) -> impl Future<Output = anyhow::Result<Reply>> + Send {
        let _ = (session, message, data);
        async { Ok(Reply::Status(Code::BadRequest)) }
    }

    /// Periodic housekeeping, run on every `Listen` tick.
    fn tick(&self) {}

    /// Drop transient state when the server restarts or stops.
    fn shutdown(&self) {}
}

/// Handlers for a peer that only answers the built-in types.
#[derive(Debug, Default)]
pub struct NoService;

impl Service for NoService {}

struct Outcome {
    response: Response,
    decoded_request: Option<Packet>,
    decoded_response: Option<Packet>,
}

impl Outcome {
    fn status(code: Code, decoded_request: Option<Packet>) -> Self {
        Self {
            response: Response::status(code),
            decoded_request,
            decoded_response: None,
        }
    }
}

pub struct Server<S> {
    machine: Machine,
    peer: Peer,
    service: Arc<S>,
    sessions: SessionTable,
    journal: Journal,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<S: Service> Server<S> {
    pub fn new(peer: Peer, service: S, journal: Journal) -> Self {
        Self {
            machine: Machine::new(peer.name.clone()),
            peer,
            service: Arc::new(service),
            sessions: SessionTable::new(),
            journal,
            local_addr: Mutex::new(None),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Bound address once listening. Useful when configured with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = addr;
    }

    async fn init(&self) -> Option<TcpListener> {
        if !self.peer.is_valid() {
            tracing::warn!(peer = %self.peer.name, "invalid peer; restarting");
            self.machine.set_status(Status::Warning);
            self.machine.set_state(MachineState::Restart);
            return None;
        }
        match connection::listen(&self.peer.address, self.peer.port).await {
            Ok(listener) => {
                let addr = listener.local_addr().ok();
                self.set_local_addr(addr);
                tracing::info!(peer = %self.peer.name, addr = ?addr, "listening");
                self.machine.set_status(Status::Success);
                self.machine.set_state(MachineState::Listen);
                Some(listener)
            }
            Err(e) => {
                tracing::error!(peer = %self.peer.name, error = %e, "bind failed");
                self.machine.set_status(Status::Error);
                self.machine.set_state(MachineState::Restart);
                None
            }
        }
    }

    fn teardown(&self) {
        self.set_local_addr(None);
        self.sessions.clear();
        self.service.shutdown();
    }

    /// Serve one accepted stream end to end.
    /// A request that does not arrive within `request_timeout` gets BadRequest.
    pub async fn process(&self, mut channel: Channel) {
        let timeout = self.peer.options.request_timeout();
        let received = match tokio::time::timeout(timeout, channel.receive()).await {
            Ok(received) => received,
            Err(_) => Err(FrameIoError::Io(std::io::ErrorKind::TimedOut.into())),
        };
        let request = match received {
            Ok(request) => request,
            Err(FrameIoError::Closed) => {
                channel.shutdown().await;
                return;
            }
            Err(e) => {
                tracing::debug!(peer = %channel.peer(), error = %e, "unreadable request");
                if let Err(e) = channel.send_error(Code::BadRequest, None).await {
                    tracing::debug!(error = %e, "reply failed");
                }
                channel.shutdown().await;
                return;
            }
        };

        let outcome = self.handle(&request, channel.peer()).await;
        if let Err(e) = channel.send(outcome.response.clone()).await {
            tracing::debug!(peer = %channel.peer(), error = %e, "reply failed");
        }
        self.journal.record(Exchange {
            peer: self.peer.name.clone(),
            request,
            response: outcome.response,
            decoded_request: outcome.decoded_request,
            decoded_response: outcome.decoded_response,
        });
        channel.shutdown().await;
    }

    async fn handle(&self, request: &Request, addr: SocketAddr) -> Outcome {
        let Some(id) = request.session.as_deref() else {
            return self.handshake(request, addr);
        };
        let Some(session) = self.sessions.get(id) else {
            tracing::debug!(peer = %addr, "unknown session");
            return Outcome::status(Code::Unauthorized, None);
        };
        let packet = match envelope::open_request(Some(&session.key), request) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(peer = %addr, error = %e, "session open failed");
                return Outcome::status(Code::Unauthorized, None);
            }
        };
        let message = match packet.message() {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(peer = %addr, error = %e, "bad message");
                return Outcome::status(Code::BadRequest, Some(packet));
            }
        };
        let reply = match self.dispatch(&session, message, packet.data.clone()).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(
                    peer = %self.peer.name,
                    session = %session.id,
                    error = %e,
                    "handler failed"
                );
                Reply::Status(Code::InternalServerError)
            }
        };
        seal(reply, Some(&session.key), packet)
    }

    fn handshake(&self, request: &Request, addr: SocketAddr) -> Outcome {
        let packet = match envelope::open_request(None, request) {
            Ok(packet) => packet,
            Err(_) => return Outcome::status(Code::BadRequest, None),
        };
        let message = match packet.message() {
            Ok(message) => message,
            Err(_) => return Outcome::status(Code::BadRequest, Some(packet)),
        };
        let MessageKind::Handshake {
            key, name, version, ..
        } = &message.kind
        else {
            return Outcome::status(Code::Unauthorized, Some(packet));
        };
        if *version != PROTOCOL_VERSION {
            tracing::debug!(peer = %addr, version, "protocol version mismatch");
            return Outcome::status(Code::BadRequest, Some(packet));
        }
        let keypair = Keypair::generate();
        let session = Session::new(keypair.agree(key), name.clone(), addr);
        let id = self.sessions.insert(session);
        tracing::info!(peer = %self.peer.name, remote = %name, addr = %addr, "session established");
        let reply = message.reply(MessageKind::Handshake {
            key: keypair.public_key().clone(),
            name: self.peer.name.clone(),
            version: PROTOCOL_VERSION,
            session: Some(id),
        });
        seal(Reply::ok(reply, None), None, packet)
    }

    async fn dispatch(
        &self,
        session: &Session,
        message: Message,
        data: Option<String>,
    ) -> anyhow::Result<Reply> {
        match &message.kind {
            MessageKind::Handshake { key, .. } => {
                let kind = MessageKind::Handshake {
                    key: key.clone(),
                    name: self.peer.name.clone(),
                    version: PROTOCOL_VERSION,
                    session: Some(session.id.clone()),
                };
                Ok(Reply::ok(message.reply(kind), None))
            }
            MessageKind::Ping => Ok(Reply::ok(message, None)),
            MessageKind::Info => {
                let info = InfoData {
                    name: self.peer.name.clone(),
                    role: self.peer.role,
                    version: PROTOCOL_VERSION,
                    sessions: self.sessions.len(),
                };
                Ok(Reply::ok(message, Some(envelope::plain_data(&info)?)))
            }
            MessageKind::Quit => {
                self.sessions.remove(&session.id);
                tracing::debug!(peer = %self.peer.name, remote = %session.name, "session closed");
                Ok(Reply::ok(message, None))
            }
            MessageKind::Search => self.service.search(session, message, data).await,
            MessageKind::Browse => self.service.browse(session, message, data).await,
            MessageKind::Download { .. } => self.service.download(session, message, data).await,
            MessageKind::Upload { .. } => self.service.upload(session, message, data).await,
        }
    }
}

fn seal(reply: Reply, key: Option<&SessionKey>, decoded_request: Packet) -> Outcome {
    let (message, data) = match reply {
        Reply::Ok { message, data } => (message, data),
        Reply::Status(code) => return Outcome::status(code, Some(decoded_request)),
    };
    let sealed = Packet::new(&message, data)
        .map_err(envelope::EnvelopeError::from)
        .and_then(|packet| {
            envelope::seal_response(Code::Ok, key, Some(&packet)).map(|r| (r, packet))
        });
    match sealed {
        Ok((response, packet)) => Outcome {
            response,
            decoded_request: Some(decoded_request),
            decoded_response: Some(packet),
        },
        Err(e) => {
            tracing::warn!(error = %e, "sealing reply failed");
            Outcome::status(Code::InternalServerError, Some(decoded_request))
        }
    }
}

impl<S: Service> Demon for Server<S> {
    fn machine(&self) -> &Machine {
        &self.machine
    }

    async fn run(self: Arc<Self>) {
        let mut listener: Option<TcpListener> = None;
        loop {
            let state = self.next_state();
            match state {
                MachineState::None => break,
                MachineState::Init => listener = self.init().await,
                MachineState::Listen => {
                    let pruned = self.sessions.prune(self.peer.options.idle_timeout());
                    if pruned > 0 {
                        tracing::debug!(peer = %self.peer.name, pruned, "idle sessions dropped");
                    }
                    self.service.tick();
                    let Some(l) = listener.as_ref() else {
                        self.machine.set_state(MachineState::Restart);
                        continue;
                    };
                    match tokio::time::timeout(ACCEPT_POLL, l.accept()).await {
                        Err(_) => {}
                        Ok(Ok((stream, addr))) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.process(Channel::new(stream, addr)).await;
                            });
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(peer = %self.peer.name, error = %e, "accept failed");
                            self.machine.set_status(Status::Error);
                            self.machine.set_state(MachineState::Restart);
                        }
                    }
                    continue;
                }
                MachineState::Restart => {
                    listener = None;
                    self.teardown();
                    self.machine
                        .sleep(self.peer.options.restart_interval(), MachineState::Init);
                }
                MachineState::Shutdown => {
                    listener = None;
                    self.teardown();
                    tracing::info!(peer = %self.peer.name, "stopped");
                    self.machine.set_state(MachineState::None);
                }
                _ => {}
            }
            tokio::time::sleep(TICK).await;
        }
        self.machine.set_status(Status::None);
    }
}
