//! Cryptographic identity and key management for Pairlink clients.
//!
//! This module provides Ed25519 key generation, client identity management,
//! message signing, signature verification and the signed credential a
//! client presents to the relay.

use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Version tag of the client id derivation scheme.
pub const IDENTITY_VERSION: u8 = 1;

/// Number of hash bytes encoded into a client id (SHA-256 output truncated).
pub const CLIENT_ID_HASH_LENGTH: usize = 16;

/// A stable client identifier derived from the public key.
///
/// The identifier is the version tag followed by the hex encoding of the
/// first 16 bytes of SHA-256 over the public key, for example
/// `v1:a1b2c3d4e5f67890a1b2c3d4e5f67890`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    /// Derives a ClientId from a public key by hashing it with SHA-256.
    fn from_public_key(public_key: &VerifyingKey) -> Self {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(public_key.as_bytes());
        Self(format!(
            "v{}:{}",
            IDENTITY_VERSION,
            hex::encode(&hash[..CLIENT_ID_HASH_LENGTH])
        ))
    }

    /// Parses a client id string, checking the version tag and hash encoding.
    pub fn parse(value: &str) -> Result<Self> {
        let (tag, digest) = value
            .split_once(':')
            .ok_or_else(|| ProtocolError::InvalidIdentifier(format!("missing version tag: {value}")))?;

        let version: u8 = tag
            .strip_prefix('v')
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProtocolError::InvalidIdentifier(format!("bad version tag: {tag}")))?;
        if version != IDENTITY_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let bytes = hex::decode(digest)?;
        if bytes.len() != CLIENT_ID_HASH_LENGTH {
            return Err(ProtocolError::InvalidKeyLength {
                expected: CLIENT_ID_HASH_LENGTH,
                got: bytes.len(),
            });
        }

        Ok(Self(value.to_string()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generates a human-readable fingerprint of the hash part.
    ///
    /// The fingerprint is formatted as groups of 4 hex characters separated by colons,
    /// for example: `a1b2:c3d4:e5f6:7890:1234:5678:9abc:def0`
    pub fn fingerprint(&self) -> String {
        let digest = self.0.split_once(':').map(|(_, d)| d).unwrap_or(&self.0);
        digest
            .as_bytes()
            .chunks(4)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ClientId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

/// A 64-byte Ed25519 signature, hex-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    /// Creates a new Signature from raw bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    /// Returns the lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a hex-encoded signature.
    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value)?;
        let arr: [u8; SIGNATURE_LENGTH] =
            bytes
                .try_into()
                .map_err(|b: Vec<u8>| ProtocolError::InvalidKeyLength {
                    expected: SIGNATURE_LENGTH,
                    got: b.len(),
                })?;
        Ok(Self(arr))
    }

    fn as_ed25519(&self) -> Ed25519Signature {
        Ed25519Signature::from_bytes(&self.0)
    }
}

/// The identity of the local client, including the secret key.
///
/// The secret key never leaves this type except through
/// [`ClientIdentity::secret_key_bytes`], which exists for sealed storage.
#[derive(Clone)]
pub struct ClientIdentity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    client_id: ClientId,
}

impl ClientIdentity {
    /// Generates a new random client identity using the OS random number generator.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Creates a ClientIdentity from raw secret key bytes.
    ///
    /// The public key and client id are derived from the secret key.
    pub fn from_secret_key_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let client_id = ClientId::from_public_key(&verifying_key);
        Self {
            signing_key,
            verifying_key,
            client_id,
        }
    }

    /// Returns the secret key bytes.
    ///
    /// **Security Warning**: only for sealing into restricted storage.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Returns the public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Returns the public key as lowercase hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.as_bytes())
    }

    /// Returns the client id.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Returns the public half of this identity.
    pub fn to_peer_identity(&self) -> PeerIdentity {
        PeerIdentity {
            verifying_key: self.verifying_key,
            client_id: self.client_id.clone(),
        }
    }

    /// Signs a message with the secret key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Verifies a signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.verifying_key
            .verify(message, &signature.as_ed25519())
            .map_err(ProtocolError::from)
    }

    /// Issues a relay credential valid from `now` for `ttl_secs` seconds.
    pub fn relay_auth(&self, now: u64, ttl_secs: u64) -> RelayAuth {
        let expires_at = now.saturating_add(ttl_secs);
        let payload = RelayAuth::signing_payload(&self.client_id, now, expires_at);
        RelayAuth {
            client_id: self.client_id.clone(),
            public_key: self.public_key_hex(),
            issued_at: now,
            expires_at,
            signature: self.sign(payload.as_bytes()).to_hex(),
        }
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("client_id", &self.client_id)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// The identity of a remote party (public information only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    verifying_key: VerifyingKey,
    client_id: ClientId,
}

impl PeerIdentity {
    /// Creates a PeerIdentity from public key bytes.
    pub fn from_public_key_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;
        let client_id = ClientId::from_public_key(&verifying_key);
        Ok(Self {
            verifying_key,
            client_id,
        })
    }

    /// Creates a PeerIdentity from a hex-encoded public key.
    pub fn from_public_key_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value)?;
        let arr: [u8; PUBLIC_KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|b: Vec<u8>| ProtocolError::InvalidKeyLength {
                    expected: PUBLIC_KEY_LENGTH,
                    got: b.len(),
                })?;
        Self::from_public_key_bytes(&arr)
    }

    /// Returns the public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Returns the client id derived from the public key.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Verifies a signature against a message using this peer's public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.verifying_key
            .verify(message, &signature.as_ed25519())
            .map_err(ProtocolError::from)
    }
}

/// Credential a client presents to the relay before subscribing or publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayAuth {
    /// Claimed client id.
    pub client_id: ClientId,
    /// Hex-encoded Ed25519 public key.
    pub public_key: String,
    /// Unix timestamp the credential was issued.
    pub issued_at: u64,
    /// Unix timestamp the credential stops being valid.
    pub expires_at: u64,
    /// Hex-encoded signature over the signing payload.
    pub signature: String,
}

impl RelayAuth {
    fn signing_payload(client_id: &ClientId, issued_at: u64, expires_at: u64) -> String {
        format!("pairlink-relay-auth:{client_id}:{issued_at}:{expires_at}")
    }

    /// Verifies the credential at time `now`.
    ///
    /// Checks the expiry, that the client id matches the public key, and the
    /// signature. Returns the authenticated peer on success.
    pub fn verify(&self, now: u64) -> Result<PeerIdentity> {
        if now >= self.expires_at {
            return Err(ProtocolError::CredentialExpired {
                expires_at: self.expires_at,
            });
        }

        let peer = PeerIdentity::from_public_key_hex(&self.public_key)?;
        if peer.client_id() != &self.client_id {
            return Err(ProtocolError::InvalidPublicKey(format!(
                "public key does not match client id {}",
                self.client_id
            )));
        }

        let signature = Signature::from_hex(&self.signature)?;
        let payload = Self::signing_payload(&self.client_id, self.issued_at, self.expires_at);
        peer.verify(payload.as_bytes(), &signature)?;
        Ok(peer)
    }
}
