//! Transport bindings.
//!
//! `Connection` is the dialling side: it owns an endpoint and serializes
//! request/response pairs under its lock, one stream per exchange. `Channel`
//! wraps a stream accepted by a listener; it carries exactly one request and
//! one reply and is shut down by its owner.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::protocol::{Code, Request, Response};
use crate::wire::{read_frame, write_frame, FrameIoError};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("reply already sent")]
    AlreadyReplied,
    #[error(transparent)]
    Frame(#[from] FrameIoError),
}

pub struct Connection {
    address: String,
    port: u16,
    timeout: Duration,
    lock: Mutex<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

impl Connection {
    pub fn new(address: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            port,
            timeout,
            lock: Mutex::new(()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Send one request and wait for its reply. Pairs never interleave.
    pub async fn exchange(&self, request: &Request) -> Result<Response, ConnectionError> {
        let _guard = self.lock.lock().await;
        tokio::time::timeout(self.timeout, self.exchange_once(request))
            .await
            .map_err(|_| ConnectionError::Timeout(self.timeout))?
    }

    async fn exchange_once(&self, request: &Request) -> Result<Response, ConnectionError> {
        let mut stream = TcpStream::connect((self.address.as_str(), self.port))
            .await
            .map_err(|source| ConnectionError::Connect {
                endpoint: self.endpoint(),
                source,
            })?;
        write_frame(&mut stream, request).await?;
        let response = read_frame(&mut stream).await?;
        let _ = stream.shutdown().await;
        Ok(response)
    }
}

pub async fn listen(address: &str, port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind((address, port)).await
}

/// Sends the single reply of an exchange.
pub trait Responder: Send {
    fn send(&mut self, response: Response)
        -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn send_ok(
        &mut self,
        data: Option<String>,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send {
        self.send(Response::ok(data))
    }

    fn send_error(
        &mut self,
        code: Code,
        data: Option<String>,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send {
        self.send(Response { code, data })
    }
}

/// Accepted stream.
#[derive(Debug)]
pub struct Channel {
    stream: TcpStream,
    peer: SocketAddr,
    replied: bool,
}

impl Channel {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            replied: false,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn replied(&self) -> bool {
        self.replied
    }

    pub async fn receive(&mut self) -> Result<Request, FrameIoError> {
        read_frame(&mut self.stream).await
    }

    pub async fn shutdown(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::trace!(peer = %self.peer, error = %e, "shutdown");
        }
    }
}

impl Responder for Channel {
    async fn send(&mut self, response: Response) -> Result<(), ConnectionError> {
        if self.replied {
            return Err(ConnectionError::AlreadyReplied);
        }
        self.replied = true;
        write_frame(&mut self.stream, &response).await?;
        Ok(())
    }
}
