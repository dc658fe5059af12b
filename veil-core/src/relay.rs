//! Router role: forwards user-data requests to an upstream server.
//!
//! The router opens the session layer to read the routing message, then
//! re-sends message and payload over its own upstream session. The payload
//! stays group-sealed end to end; the router holds no group key.

use std::time::Duration;

use tokio::sync::Mutex;

use crate::command::{ClientSession, Command, CommandError};
use crate::connection::Connection;
use crate::dispatch::{Reply, Service};
use crate::journal::Journal;
use crate::peer::Endpoint;
use crate::protocol::{Code, Message};
use crate::session::Session;

pub struct RelayService {
    name: String,
    upstream: Connection,
    session: Mutex<Option<ClientSession>>,
    journal: Journal,
}

impl RelayService {
    pub fn new(
        name: impl Into<String>,
        upstream: &Endpoint,
        timeout: Duration,
        journal: Journal,
    ) -> Self {
        Self {
            name: name.into(),
            upstream: Connection::new(upstream.address.clone(), upstream.port, timeout),
            session: Mutex::new(None),
            journal,
        }
    }

    pub fn upstream(&self) -> &Connection {
        &self.upstream
    }

    /// Cached upstream session, handshaking on first use.
    async fn session(&self) -> Result<ClientSession, CommandError> {
        let mut cached = self.session.lock().await;
        if let Some(session) = cached.as_ref() {
            return Ok(session.clone());
        }
        let session = Command::new(&self.upstream, &self.journal, &self.name)
            .handshake()
            .await?;
        tracing::info!(
            peer = %self.name,
            upstream = %self.upstream.endpoint(),
            "upstream session established"
        );
        *cached = Some(session.clone());
        Ok(session)
    }

    /// Whether the upstream still knows `session`. Unauthorized also answers
    /// a sender outside the group, so a refused forward alone proves nothing.
    async fn session_alive(&self, session: &ClientSession) -> Result<bool, CommandError> {
        let mut command = Command::new(&self.upstream, &self.journal, &self.name);
        match command.ping(session).await {
            Ok(()) => Ok(true),
            Err(CommandError::Status(Code::Unauthorized)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Forget `session` unless another request already replaced it.
    async fn drop_session(&self, session: &ClientSession) {
        let mut cached = self.session.lock().await;
        if cached.as_ref().is_some_and(|c| c.id == session.id) {
            cached.take();
        }
    }

    /// Forward once. An Unauthorized reply re-handshakes and retries only when
    /// the upstream no longer knows the cached session.
    async fn forward(
        &self,
        remote: &Session,
        message: Message,
        data: Option<String>,
    ) -> anyhow::Result<Reply> {
        tracing::debug!(
            peer = %self.name,
            remote = %remote.name,
            kind = message.kind.tag(),
            "relaying"
        );
        let mut retried = false;
        loop {
            let session = self.session().await?;
            let mut command = Command::new(&self.upstream, &self.journal, &self.name);
            match command.forward(&session, message.clone(), data.clone()).await {
                Ok((reply, data)) => return Ok(Reply::ok(reply, data)),
                Err(CommandError::Status(Code::Unauthorized)) if !retried => {
                    if self.session_alive(&session).await? {
                        return Ok(Reply::Status(Code::Unauthorized));
                    }
                    tracing::debug!(peer = %self.name, "upstream session expired");
                    retried = true;
                    self.drop_session(&session).await;
                }
                Err(CommandError::Status(code)) => return Ok(Reply::Status(code)),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Service for RelayService {
    async fn search(
        &self,
        session: &Session,
        message: Message,
        data: Option<String>,
    ) -> anyhow::Result<Reply> {
        self.forward(session, message, data).await
    }

    async fn browse(
        &self,
        session: &Session,
        message: Message,
        data: Option<String>,
    ) -> anyhow::Result<Reply> {
        self.forward(session, message, data).await
    }

    async fn download(
        &self,
        session: &Session,
        message: Message,
        data: Option<String>,
    ) -> anyhow::Result<Reply> {
        self.forward(session, message, data).await
    }

    async fn upload(
        &self,
        session: &Session,
        message: Message,
        data: Option<String>,
    ) -> anyhow::Result<Reply> {
        self.forward(session, message, data).await
    }

    fn shutdown(&self) {
        if let Ok(mut cached) = self.session.try_lock() {
            cached.take();
        }
    }
}
