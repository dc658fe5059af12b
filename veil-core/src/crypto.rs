//! Symmetric sealing for both protocol layers.
//!
//! Session keys come out of the handshake and protect one hop. Group keys are
//! derived from a configured passphrase and protect user payload end to end;
//! relays never hold them. Both layers use ChaCha20-Poly1305 with a random
//! 96-bit nonce prefixed to the ciphertext.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("ciphertext too short")]
    Truncated,
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// 32-byte ChaCha20-Poly1305 key.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; 32]);

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encrypt `plaintext`; output is nonce || ciphertext+tag.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| CryptoError::Key)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| CryptoError::Key)?;
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Seal and base64-encode, for JSON string fields.
    pub fn seal_text(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        Ok(STANDARD.encode(self.seal(plaintext)?))
    }

    pub fn open_text(&self, sealed: &str) -> Result<Vec<u8>, CryptoError> {
        let bytes = STANDARD.decode(sealed.as_bytes())?;
        self.open(&bytes)
    }
}

/// Hop-level key negotiated at handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey(SymmetricKey);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(SymmetricKey::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn seal_text(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        self.0.seal_text(plaintext)
    }

    pub fn open_text(&self, sealed: &str) -> Result<Vec<u8>, CryptoError> {
        self.0.open_text(sealed)
    }
}

/// Circle-of-trust payload key. Configured, never negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    id: String,
    key: SymmetricKey,
}

impl Group {
    /// Derive the group from a shared passphrase. Peers with the same passphrase
    /// land in the same group; the empty passphrase is the open default group.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key: [u8; 32] = Sha256::new()
            .chain_update(b"veil-group-key-v1")
            .chain_update(passphrase.as_bytes())
            .finalize()
            .into();
        let id_digest = Sha256::new()
            .chain_update(b"veil-group-id-v1")
            .chain_update(passphrase.as_bytes())
            .finalize();
        Self {
            id: hex::encode(&id_digest[..8]),
            key: SymmetricKey::from_bytes(key),
        }
    }

    /// Short public identifier, safe to log.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.key.seal(plaintext)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.key.open(sealed)
    }

    pub fn seal_text(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        self.key.seal_text(plaintext)
    }

    pub fn open_text(&self, sealed: &str) -> Result<Vec<u8>, CryptoError> {
        self.key.open_text(sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = SymmetricKey::generate();
        let plain = b"hello veil";
        let sealed = key.seal(plain).unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + plain.len() + 16);
        assert_eq!(key.open(&sealed).unwrap(), plain);
    }

    #[test]
    fn nonces_differ_per_seal() {
        let key = SymmetricKey::generate();
        let a = key.seal(b"same").unwrap();
        let b = key.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let a = SymmetricKey::generate();
        let b = SymmetricKey::generate();
        let sealed = a.seal(b"secret").unwrap();
        assert!(matches!(b.open(&sealed), Err(CryptoError::Decrypt)));
        assert!(matches!(a.open(&sealed[..4]), Err(CryptoError::Truncated)));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = SymmetricKey::generate();
        let mut sealed = key.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(key.open(&sealed).is_err());
    }

    #[test]
    fn group_from_same_passphrase_interoperates() {
        let a = Group::from_passphrase("circle");
        let b = Group::from_passphrase("circle");
        let c = Group::from_passphrase("other");
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().len(), 16);

        let sealed = a.seal_text(b"listing").unwrap();
        assert_eq!(b.open_text(&sealed).unwrap(), b"listing");
        assert!(c.open_text(&sealed).is_err());
    }

    #[test]
    fn garbage_base64_is_an_error() {
        let key = SymmetricKey::generate();
        assert!(matches!(
            key.open_text("not base64!!"),
            Err(CryptoError::Base64(_))
        ));
    }
}
