//! Client-side commands. Each one is a single sealed request/response exchange
//! over a `Connection`; the command remembers the last status code it saw.

use crate::chunk::{Chunk, Piece};
use crate::connection::{Connection, ConnectionError};
use crate::crypto::{Group, SessionKey};
use crate::envelope::{self, EnvelopeError};
use crate::identity::Keypair;
use crate::journal::{Exchange, Journal};
use crate::protocol::{
    BrowseRequestData, BrowseResponseData, Code, DownloadRequestData, FileRef, InfoData, Message,
    MessageKind, Packet, SearchRequestData, SearchResponseData, UploadRequestData,
    PROTOCOL_VERSION,
};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("remote replied {0:?}")]
    Status(Code),
    #[error("unexpected reply: {0}")]
    Unexpected(&'static str),
}

impl CommandError {
    /// Status code carried by the failure, if the remote answered at all.
    pub fn code(&self) -> Option<Code> {
        match self {
            CommandError::Status(code) => Some(*code),
            _ => None,
        }
    }
}

/// Session established by `Command::handshake`.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: String,
    pub key: SessionKey,
}

/// First reply of a pull download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTicket {
    /// None for an empty file: nothing to pull.
    pub transfer: Option<String>,
    pub size: u64,
}

pub struct Command<'a> {
    connection: &'a Connection,
    journal: &'a Journal,
    name: &'a str,
    code: Code,
}

impl<'a> Command<'a> {
    pub fn new(connection: &'a Connection, journal: &'a Journal, name: &'a str) -> Self {
        Self {
            connection,
            journal,
            name,
            code: Code::None,
        }
    }

    /// Most recent status code produced or observed.
    pub fn code(&self) -> Code {
        self.code
    }

    async fn request(
        &mut self,
        session: Option<&ClientSession>,
        message: Message,
        data: Option<String>,
    ) -> Result<(Message, Option<String>), CommandError> {
        let key = session.map(|s| &s.key);
        let packet = Packet::new(&message, data)?;
        let request = envelope::seal_request(session.map(|s| (s.id.as_str(), &s.key)), &packet)?;
        let response = match self.connection.exchange(&request).await {
            Ok(response) => response,
            Err(e) => {
                self.code = Code::None;
                return Err(e.into());
            }
        };
        self.code = response.code;
        let decoded = if response.code.is_ok() {
            envelope::open_response(key, &response)
        } else {
            Ok(None)
        };
        self.journal.record(Exchange {
            peer: self.name.to_string(),
            request,
            response: response.clone(),
            decoded_request: Some(packet),
            decoded_response: decoded.as_ref().ok().cloned().flatten(),
        });
        if !response.code.is_ok() {
            return Err(CommandError::Status(response.code));
        }
        let reply = decoded?.ok_or(CommandError::Unexpected("empty reply"))?;
        let reply_message = reply.message()?;
        if reply_message.id != message.id {
            return Err(CommandError::Unexpected("correlation id mismatch"));
        }
        Ok((reply_message, reply.data))
    }

    /// Ephemeral key exchange. No session id: the exchange is in the clear.
    pub async fn handshake(&mut self) -> Result<ClientSession, CommandError> {
        let keypair = Keypair::generate();
        let message = Message::new(MessageKind::Handshake {
            key: keypair.public_key().clone(),
            name: self.name.to_string(),
            version: PROTOCOL_VERSION,
            session: None,
        });
        let (reply, _) = self.request(None, message, None).await?;
        match reply.kind {
            MessageKind::Handshake {
                key,
                session: Some(id),
                ..
            } => Ok(ClientSession {
                id,
                key: keypair.agree(&key),
            }),
            _ => Err(CommandError::Unexpected("handshake reply without session")),
        }
    }

    /// Keep an existing session alive; the server answers with the same id.
    pub async fn refresh(&mut self, session: &ClientSession) -> Result<(), CommandError> {
        let message = Message::new(MessageKind::Handshake {
            key: Keypair::generate().public_key().clone(),
            name: self.name.to_string(),
            version: PROTOCOL_VERSION,
            session: Some(session.id.clone()),
        });
        let (reply, _) = self.request(Some(session), message, None).await?;
        match reply.kind {
            MessageKind::Handshake { session: Some(id), .. } if id == session.id => Ok(()),
            _ => Err(CommandError::Unexpected("refresh returned another session")),
        }
    }

    pub async fn ping(&mut self, session: &ClientSession) -> Result<(), CommandError> {
        self.request(Some(session), Message::new(MessageKind::Ping), None)
            .await?;
        Ok(())
    }

    pub async fn quit(&mut self, session: &ClientSession) -> Result<(), CommandError> {
        self.request(Some(session), Message::new(MessageKind::Quit), None)
            .await?;
        Ok(())
    }

    pub async fn info(&mut self, session: &ClientSession) -> Result<InfoData, CommandError> {
        let (_, data) = self
            .request(Some(session), Message::new(MessageKind::Info), None)
            .await?;
        Ok(envelope::open_plain_data(data.as_deref())?)
    }

    pub async fn search(
        &mut self,
        session: &ClientSession,
        group: &Group,
        keyword: &str,
    ) -> Result<Vec<FileRef>, CommandError> {
        let data = envelope::seal_user_data(
            group,
            &SearchRequestData {
                keyword: keyword.to_string(),
            },
        )?;
        let (_, data) = self
            .request(Some(session), Message::new(MessageKind::Search), Some(data))
            .await?;
        let result: SearchResponseData = envelope::open_user_data(group, data.as_deref())?;
        Ok(result.files)
    }

    pub async fn browse(
        &mut self,
        session: &ClientSession,
        group: &Group,
        folder: &FileRef,
    ) -> Result<BrowseResponseData, CommandError> {
        let data = envelope::seal_user_data(
            group,
            &BrowseRequestData {
                folder: folder.clone(),
            },
        )?;
        let (_, data) = self
            .request(Some(session), Message::new(MessageKind::Browse), Some(data))
            .await?;
        Ok(envelope::open_user_data(group, data.as_deref())?)
    }

    /// Open a pull transfer for `file`.
    pub async fn download_open(
        &mut self,
        session: &ClientSession,
        group: &Group,
        file: &FileRef,
    ) -> Result<DownloadTicket, CommandError> {
        let data = envelope::seal_user_data(group, &DownloadRequestData { file: file.clone() })?;
        let message = Message::new(MessageKind::Download {
            transfer: None,
            chunk: None,
            size: None,
        });
        let (reply, _) = self.request(Some(session), message, Some(data)).await?;
        match reply.kind {
            MessageKind::Download { transfer, size, .. } => Ok(DownloadTicket {
                transfer,
                size: size.unwrap_or(0),
            }),
            _ => Err(CommandError::Unexpected("download reply of another type")),
        }
    }

    /// Pop the next buffered piece; none when the server has nothing ready yet.
    pub async fn download_next(
        &mut self,
        session: &ClientSession,
        group: &Group,
        transfer: &str,
    ) -> Result<Option<Piece>, CommandError> {
        let message = Message::new(MessageKind::Download {
            transfer: Some(transfer.to_string()),
            chunk: None,
            size: None,
        });
        let (reply, data) = self.request(Some(session), message, None).await?;
        match reply.kind {
            MessageKind::Download { chunk: None, .. } => Ok(None),
            MessageKind::Download {
                chunk: Some(chunk), ..
            } => {
                let bytes = envelope::open_user_bytes(group, data.as_deref())?;
                if bytes.len() != chunk.size as usize {
                    return Err(CommandError::Unexpected("piece size mismatch"));
                }
                Ok(Some(Piece { chunk, data: bytes }))
            }
            _ => Err(CommandError::Unexpected("download reply of another type")),
        }
    }

    /// Open a push transfer of `file` (its `size` must be set).
    /// Open a push transfer. Returns its id and the first range the server
    /// expects, whose size every following piece must use.
    pub async fn upload_open(
        &mut self,
        session: &ClientSession,
        group: &Group,
        file: &FileRef,
    ) -> Result<(String, Option<Chunk>), CommandError> {
        let data = envelope::seal_user_data(group, &UploadRequestData { file: file.clone() })?;
        let message = Message::new(MessageKind::Upload {
            transfer: None,
            chunk: None,
            accepted: None,
        });
        let (reply, _) = self.request(Some(session), message, Some(data)).await?;
        match reply.kind {
            MessageKind::Upload {
                transfer: Some(transfer),
                chunk,
                ..
            } => Ok((transfer, chunk)),
            _ => Err(CommandError::Unexpected("upload reply without transfer")),
        }
    }

    /// Deposit one piece. False when the server buffer is full; retry later.
    pub async fn upload_piece(
        &mut self,
        session: &ClientSession,
        group: &Group,
        transfer: &str,
        piece: &Piece,
    ) -> Result<bool, CommandError> {
        let data = envelope::seal_user_bytes(group, &piece.data)?;
        let message = Message::new(MessageKind::Upload {
            transfer: Some(transfer.to_string()),
            chunk: Some(piece.chunk),
            accepted: None,
        });
        let (reply, _) = self.request(Some(session), message, Some(data)).await?;
        match reply.kind {
            MessageKind::Upload { accepted, .. } => Ok(accepted.unwrap_or(false)),
            _ => Err(CommandError::Unexpected("upload reply of another type")),
        }
    }

    /// Pass a message and its opaque payload through unchanged. Used by relays.
    pub async fn forward(
        &mut self,
        session: &ClientSession,
        message: Message,
        data: Option<String>,
    ) -> Result<(Message, Option<String>), CommandError> {
        self.request(Some(session), message, data).await
    }
}
