//! Symmetric envelope encryption for relay frames.
//!
//! Every frame published on a topic is sealed with the pairing's shared
//! ChaCha20-Poly1305 key. The envelope layout is:
//!
//! ```text
//! +---------+-----------+---------------------------+
//! | version |   nonce   | ciphertext || poly1305 tag |
//! | 1 byte  | 12 bytes  |        N + 16 bytes        |
//! +---------+-----------+---------------------------+
//! ```
//!
//! The topic a pairing lives on is the hex SHA-256 of its key, so both
//! sides derive the same topic from the key handed over in the pairing URI.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, Result};

/// Length of a symmetric key in bytes.
pub const SYM_KEY_LENGTH: usize = 32;

/// Length of the random nonce prefixed to each envelope.
pub const NONCE_LENGTH: usize = 12;

/// Length of the Poly1305 authentication tag.
pub const TAG_LENGTH: usize = 16;

/// Envelope format version byte.
pub const ENVELOPE_VERSION: u8 = 0;

/// Minimum size of a well-formed envelope (empty plaintext).
pub const MIN_ENVELOPE_SIZE: usize = 1 + NONCE_LENGTH + TAG_LENGTH;

/// A 32-byte shared secret, wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymKey([u8; SYM_KEY_LENGTH]);

impl SymKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SYM_KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wraps existing key bytes.
    pub fn from_bytes(bytes: [u8; SYM_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parses a hex-encoded key.
    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value)?;
        let arr: [u8; SYM_KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|b: Vec<u8>| ProtocolError::InvalidKeyLength {
                    expected: SYM_KEY_LENGTH,
                    got: b.len(),
                })?;
        Ok(Self(arr))
    }

    /// Returns the hex encoding of the key.
    ///
    /// Only used to hand the key to the wallet out of band.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SYM_KEY_LENGTH] {
        &self.0
    }

    /// Derives the topic this key's traffic is published on.
    pub fn topic(&self) -> Topic {
        use sha2::{Digest, Sha256};
        Topic(hex::encode(Sha256::digest(self.0)))
    }
}

impl std::fmt::Debug for SymKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymKey([REDACTED])")
    }
}

/// An opaque relay topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Wraps a topic string received from the wire or storage.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the topic as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short prefix suitable for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encrypts `plaintext` under `key` into a versioned envelope.
pub fn seal(key: &SymKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| ProtocolError::Encryption(e.to_string()))?;

    let mut envelope = Vec::with_capacity(1 + NONCE_LENGTH + ciphertext.len());
    envelope.push(ENVELOPE_VERSION);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Decrypts an envelope produced by [`seal`].
pub fn open(key: &SymKey, envelope: &[u8]) -> Result<Vec<u8>> {
    if envelope.len() < MIN_ENVELOPE_SIZE {
        return Err(ProtocolError::Decryption(format!(
            "envelope too short: {} bytes",
            envelope.len()
        )));
    }
    if envelope[0] != ENVELOPE_VERSION {
        return Err(ProtocolError::UnsupportedVersion(envelope[0]));
    }

    let (nonce, ciphertext) = envelope[1..].split_at(NONCE_LENGTH);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| ProtocolError::Decryption(e.to_string()))
}
