//! Two-layer packing.
//!
//! Send path: payload DTO, group-sealed when it is user data, goes into
//! `Packet::data`; the whole packet is session-sealed into `Request::data` or
//! `Response::data`. Receive is the inverse. The handshake travels without a
//! session key, as plain packet JSON.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crypto::{CryptoError, Group, SessionKey};
use crate::protocol::{Code, Packet, Request, Response};

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("packet carries no data")]
    MissingData,
}

fn seal_packet(key: Option<&SessionKey>, packet: &Packet) -> Result<String, EnvelopeError> {
    let json = serde_json::to_vec(packet)?;
    match key {
        Some(key) => Ok(key.seal_text(&json)?),
        None => Ok(String::from_utf8_lossy(&json).into_owned()),
    }
}

fn open_packet(key: Option<&SessionKey>, data: &str) -> Result<Packet, EnvelopeError> {
    let packet = match key {
        Some(key) => serde_json::from_slice(&key.open_text(data)?)?,
        None => serde_json::from_str(data)?,
    };
    Ok(packet)
}

/// Wrap a packet into a transport request. `session` is `None` only for the handshake.
pub fn seal_request(
    session: Option<(&str, &SessionKey)>,
    packet: &Packet,
) -> Result<Request, EnvelopeError> {
    Ok(Request {
        session: session.map(|(id, _)| id.to_string()),
        data: seal_packet(session.map(|(_, key)| key), packet)?,
    })
}

pub fn open_request(key: Option<&SessionKey>, request: &Request) -> Result<Packet, EnvelopeError> {
    open_packet(key, &request.data)
}

/// Wrap a reply packet. Non-Ok codes never carry data.
pub fn seal_response(
    code: Code,
    key: Option<&SessionKey>,
    packet: Option<&Packet>,
) -> Result<Response, EnvelopeError> {
    let data = match packet {
        Some(packet) if code.is_ok() => Some(seal_packet(key, packet)?),
        _ => None,
    };
    Ok(Response { code, data })
}

pub fn open_response(
    key: Option<&SessionKey>,
    response: &Response,
) -> Result<Option<Packet>, EnvelopeError> {
    response
        .data
        .as_deref()
        .map(|data| open_packet(key, data))
        .transpose()
}

/// Group-seal a user-data DTO for `Packet::data`.
pub fn seal_user_data<T: Serialize>(group: &Group, value: &T) -> Result<String, EnvelopeError> {
    Ok(group.seal_text(&serde_json::to_vec(value)?)?)
}

pub fn open_user_data<T: DeserializeOwned>(
    group: &Group,
    data: Option<&str>,
) -> Result<T, EnvelopeError> {
    let data = data.ok_or(EnvelopeError::MissingData)?;
    Ok(serde_json::from_slice(&group.open_text(data)?)?)
}

/// Group-seal raw file bytes.
pub fn seal_user_bytes(group: &Group, bytes: &[u8]) -> Result<String, EnvelopeError> {
    Ok(group.seal_text(bytes)?)
}

pub fn open_user_bytes(group: &Group, data: Option<&str>) -> Result<Vec<u8>, EnvelopeError> {
    let data = data.ok_or(EnvelopeError::MissingData)?;
    Ok(group.open_text(data)?)
}

/// Payload that is not user data (e.g. `InfoData`): plain JSON, session layer only.
pub fn plain_data<T: Serialize>(value: &T) -> Result<String, EnvelopeError> {
    Ok(serde_json::to_string(value)?)
}

pub fn open_plain_data<T: DeserializeOwned>(data: Option<&str>) -> Result<T, EnvelopeError> {
    let data = data.ok_or(EnvelopeError::MissingData)?;
    Ok(serde_json::from_str(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SymmetricKey;
    use crate::protocol::{Message, MessageKind, SearchRequestData};

    fn session_key() -> SessionKey {
        SessionKey::from_bytes(*SymmetricKey::generate().as_bytes())
    }

    #[test]
    fn session_layer_roundtrip() {
        let key = session_key();
        let packet = Packet::new(&Message::new(MessageKind::Ping), None).unwrap();
        let req = seal_request(Some(("s1", &key)), &packet).unwrap();
        assert_eq!(req.session.as_deref(), Some("s1"));
        assert!(!req.data.contains("ping"));
        assert_eq!(open_request(Some(&key), &req).unwrap(), packet);
        assert!(open_request(Some(&session_key()), &req).is_err());
    }

    #[test]
    fn handshake_request_is_plain() {
        let packet = Packet::new(&Message::new(MessageKind::Ping), None).unwrap();
        let req = seal_request(None, &packet).unwrap();
        assert!(req.is_handshake());
        assert_eq!(open_request(None, &req).unwrap(), packet);
    }

    #[test]
    fn relay_sees_routing_but_not_user_data() {
        let hop = session_key();
        let group = Group::from_passphrase("circle");
        let query = SearchRequestData {
            keyword: "needle".into(),
        };
        let data = seal_user_data(&group, &query).unwrap();
        let packet = Packet::new(&Message::new(MessageKind::Search), Some(data)).unwrap();
        let req = seal_request(Some(("s1", &hop)), &packet).unwrap();

        let opened = open_request(Some(&hop), &req).unwrap();
        assert_eq!(opened.message().unwrap().kind, MessageKind::Search);
        assert!(!opened.data.as_deref().unwrap().contains("needle"));

        let back: SearchRequestData = open_user_data(&group, opened.data.as_deref()).unwrap();
        assert_eq!(back, query);
        let outsider = Group::from_passphrase("other");
        assert!(open_user_data::<SearchRequestData>(&outsider, opened.data.as_deref()).is_err());
    }

    #[test]
    fn error_response_has_no_data() {
        let key = session_key();
        let packet = Packet::new(&Message::new(MessageKind::Ping), None).unwrap();
        let resp = seal_response(Code::Unauthorized, Some(&key), Some(&packet)).unwrap();
        assert_eq!(resp.data, None);
        assert_eq!(open_response(Some(&key), &resp).unwrap(), None);

        let resp = seal_response(Code::Ok, Some(&key), Some(&packet)).unwrap();
        assert_eq!(open_response(Some(&key), &resp).unwrap(), Some(packet));
    }

    #[test]
    fn missing_data_is_reported() {
        let group = Group::from_passphrase("circle");
        assert!(matches!(
            open_user_bytes(&group, None),
            Err(EnvelopeError::MissingData)
        ));
    }
}
