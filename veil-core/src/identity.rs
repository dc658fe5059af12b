//! Handshake identity: ephemeral X25519 keypairs and session key derivation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::crypto::SessionKey;

/// Public half of a handshake key (32 bytes, X25519). Base64 text on the wire.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        let buf = STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = buf
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
        Ok(PublicKey(bytes))
    }
}

/// X25519 keypair. A fresh one is generated for every handshake.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Shared secret with the other side's public key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }

    /// Session key agreed with `other_public`.
    pub fn agree(&self, other_public: &PublicKey) -> SessionKey {
        derive_session_key(&self.shared_secret(other_public))
    }
}

/// Derive the 32-byte session key from a shared secret.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> SessionKey {
    let mut hasher = Sha256::new();
    hasher.update(b"veil-session-v1");
    hasher.update(shared_secret);
    SessionKey::from_bytes(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_eq!(a.shared_secret(b.public_key()), b.shared_secret(a.public_key()));
        assert_eq!(
            a.agree(b.public_key()).as_bytes(),
            b.agree(a.public_key()).as_bytes()
        );
    }

    #[test]
    fn public_key_is_base64_on_the_wire() {
        let kp = Keypair::generate();
        let json = serde_json::to_string(kp.public_key()).unwrap();
        assert_eq!(json, format!("\"{}\"", kp.public_key().to_base64()));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, kp.public_key());
    }

    #[test]
    fn short_public_key_rejected() {
        let json = format!("\"{}\"", STANDARD.encode([1u8; 16]));
        assert!(serde_json::from_str::<PublicKey>(&json).is_err());
    }
}
