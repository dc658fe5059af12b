//! Veil wire protocol: transport envelope, packet, routing message and payload types.
//!
//! Three nested layers travel on the wire:
//!   1. `Request` / `Response`: transport frame with status code and session id.
//!   2. `Packet`: session-sealed; carries the routing `Message` as JSON text and
//!      the payload `data`.
//!   3. payload DTOs, group-sealed when they carry user data.

use serde::{Deserialize, Serialize};

use crate::identity::PublicKey;
use crate::peer::Role;

/// Current protocol version. Exchanged in the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Transport status code. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    #[default]
    None,
    Ok,
    NotFound,
    BadRequest,
    Unauthorized,
    InternalServerError,
}

impl Code {
    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }
}

/// Transport frame sent by the requesting side.
/// A request without `session` is the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    pub data: String,
}

impl Request {
    pub fn is_handshake(&self) -> bool {
        self.session.is_none()
    }
}

/// Transport frame sent back for every request. Error responses carry no data.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Response {
    pub code: Code,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Response {
    pub fn ok(data: Option<String>) -> Self {
        Self {
            code: Code::Ok,
            data,
        }
    }

    pub fn status(code: Code) -> Self {
        Self { code, data: None }
    }
}

/// Session-layer plaintext: routing message as JSON text plus the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Packet {
    pub fn new(message: &Message, data: Option<String>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message: serde_json::to_string(message)?,
            data,
        })
    }

    /// Decode the routing message.
    pub fn message(&self) -> Result<Message, serde_json::Error> {
        serde_json::from_str(&self.message)
    }
}

/// Routing envelope: correlation id plus type-specific routing fields.
/// Never carries user payload; that lives in `Packet::data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(flatten)]
    pub kind: MessageKind,
}

impl Message {
    /// New message with a fresh correlation id.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            kind,
        }
    }

    /// Reply that keeps the request's correlation id.
    pub fn reply(&self, kind: MessageKind) -> Self {
        Self {
            id: self.id.clone(),
            kind,
        }
    }
}

/// All message types, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// Ephemeral key exchange. The reply carries the responder's key and the new session id.
    Handshake {
        key: PublicKey,
        #[serde(default)]
        name: String,
        #[serde(default = "default_version")]
        version: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    Ping,
    Info,
    Search,
    Browse,
    /// Pull transfer. Opens with no `transfer`; later requests pop one piece each.
    Download {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk: Option<Chunk>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
    /// Push transfer. Opens with no `transfer`; later requests deposit one piece each.
    /// The open reply's `chunk` is the first expected range and fixes the piece size.
    Upload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk: Option<Chunk>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accepted: Option<bool>,
    },
    Quit,
}

fn default_version() -> u8 {
    PROTOCOL_VERSION
}

impl MessageKind {
    /// Wire tag, for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            MessageKind::Handshake { .. } => "handshake",
            MessageKind::Ping => "ping",
            MessageKind::Info => "info",
            MessageKind::Search => "search",
            MessageKind::Browse => "browse",
            MessageKind::Download { .. } => "download",
            MessageKind::Upload { .. } => "upload",
            MessageKind::Quit => "quit",
        }
    }
}

/// Byte range of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    pub offset: u64,
    pub size: u32,
}

impl Chunk {
    /// One past the last byte; `None` when the range does not fit in `u64`.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(u64::from(self.size))
    }
}

/// Reference to a shared file or folder. `id` is the path relative to the share root
/// with `/` separators; the empty id is the root folder.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

impl FileRef {
    pub fn root() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseRequestData {
    pub folder: FileRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BrowseResponseData {
    pub files: Vec<FileRef>,
    pub folders: Vec<FileRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequestData {
    pub keyword: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchResponseData {
    pub files: Vec<FileRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequestData {
    pub file: FileRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequestData {
    pub file: FileRef,
}

/// Info reply. Not user data, so it travels under the session layer only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoData {
    pub name: String,
    pub role: Role,
    pub version: u8,
    pub sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn roundtrip(message: &Message) -> Message {
        let packet = Packet::new(message, Some("payload".into())).unwrap();
        let json = serde_json::to_string(&packet).unwrap();
        let decoded: Packet = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, packet);
        decoded.message().unwrap()
    }

    #[test]
    fn every_message_type_survives_packet_roundtrip() {
        let kinds = vec![
            MessageKind::Handshake {
                key: Keypair::generate().public_key().clone(),
                name: "alpha".into(),
                version: PROTOCOL_VERSION,
                session: Some("abc".into()),
            },
            MessageKind::Ping,
            MessageKind::Info,
            MessageKind::Search,
            MessageKind::Browse,
            MessageKind::Download {
                transfer: Some("t1".into()),
                chunk: Some(Chunk {
                    offset: 1 << 33,
                    size: 4096,
                }),
                size: Some(10),
            },
            MessageKind::Upload {
                transfer: None,
                chunk: None,
                accepted: Some(false),
            },
            MessageKind::Quit,
        ];
        for kind in kinds {
            let message = Message::new(kind);
            assert_eq!(roundtrip(&message), message);
        }
    }

    #[test]
    fn message_type_tag_on_wire() {
        let message = Message::new(MessageKind::Ping);
        let value: serde_json::Value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value["id"], message.id.as_str());
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let text = r#"{"id":"1","type":"teleport"}"#;
        assert!(serde_json::from_str::<Message>(text).is_err());
    }

    #[test]
    fn reply_keeps_correlation_id() {
        let request = Message::new(MessageKind::Ping);
        let reply = request.reply(MessageKind::Ping);
        assert_eq!(reply.id, request.id);
    }

    #[test]
    fn request_without_session_is_handshake() {
        let request = Request {
            session: None,
            data: "{}".into(),
        };
        assert!(request.is_handshake());
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("session"));
    }

    #[test]
    fn chunk_end_checks_overflow() {
        assert_eq!(Chunk { offset: 10, size: 5 }.end(), Some(15));
        assert_eq!(Chunk { offset: u64::MAX, size: 0 }.end(), Some(u64::MAX));
        assert_eq!(Chunk { offset: u64::MAX, size: 1 }.end(), None);
    }

    #[test]
    fn payload_dtos_roundtrip() {
        let browse = BrowseResponseData {
            files: vec![FileRef {
                id: "music/a.ogg".into(),
                name: "a.ogg".into(),
                size: 42,
            }],
            folders: vec![FileRef {
                id: "music/live".into(),
                name: "live".into(),
                size: 0,
            }],
        };
        let json = serde_json::to_string(&browse).unwrap();
        assert_eq!(serde_json::from_str::<BrowseResponseData>(&json).unwrap(), browse);

        let info = InfoData {
            name: "relay".into(),
            role: Role::Router,
            version: PROTOCOL_VERSION,
            sessions: 3,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(serde_json::from_str::<InfoData>(&json).unwrap(), info);
    }
}
