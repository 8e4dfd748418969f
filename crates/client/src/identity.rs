//! Long-lived client identity and session resumption record.
//!
//! The identity is persisted as one JSON record in the keychain:
//!
//! ```json
//! {
//!   "identityVersion": 1,
//!   "publicKey": "<hex>",
//!   "privateKeyEncrypted": "<base64 envelope>",
//!   "lastSessionTopic": "<hex>",
//!   "lastSessionExpiry": 1700000000
//! }
//! ```
//!
//! The private key is sealed under a wrapping key kept in a separate
//! keychain entry, so the record alone never reveals it.

use std::sync::{Arc, Mutex, MutexGuard};

use protocol::crypto::IDENTITY_VERSION;
use protocol::{ClientId, ClientIdentity, ProtocolError, SymKey, Topic};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::storage::keychain::{decode_secret_key, encode_secret_key};
use crate::storage::{KeychainBackend, KeychainError, KeychainManager};

/// Keychain entry holding the identity record.
pub const IDENTITY_ENTRY: &str = "identity";

/// Keychain entry holding the key that wraps the private key.
pub const WRAPPING_KEY_ENTRY: &str = "identity_wrapping_key";

/// Errors from loading or persisting the identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The keychain failed.
    #[error("keychain error: {0}")]
    Keychain(#[from] KeychainError),

    /// Key material could not be decoded or unsealed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The stored record is unreadable or inconsistent.
    #[error("corrupt identity record: {0}")]
    Corrupt(String),

    /// The stored record was written by a newer version.
    #[error("unsupported identity record version {0}")]
    UnsupportedVersion(u8),
}

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRecord {
    identity_version: u8,
    public_key: String,
    private_key_encrypted: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_session_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_session_expiry: Option<u64>,
}

/// Minimal metadata kept to resume a session after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Topic of the last session.
    pub topic: Topic,
    /// Unix timestamp the session expires.
    pub expiry: u64,
}

struct Inner {
    identity: Option<Arc<ClientIdentity>>,
    record: Option<IdentityRecord>,
}

/// Owner of the client key pair.
///
/// All access goes through one internal lock, so concurrent callers see the
/// same identity and never race to generate two.
pub struct IdentityStore<B: KeychainBackend> {
    keychain: KeychainManager<B>,
    inner: Mutex<Inner>,
}

impl<B: KeychainBackend> IdentityStore<B> {
    /// Create a store over the given keychain.
    pub fn new(keychain: KeychainManager<B>) -> Self {
        Self {
            keychain,
            inner: Mutex::new(Inner {
                identity: None,
                record: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load the persisted identity, or generate and persist a new one.
    ///
    /// Repeated calls return the same identity until [`reset`](Self::reset).
    pub fn get_or_create_identity(&self) -> IdentityResult<Arc<ClientIdentity>> {
        let mut inner = self.lock();
        self.ensure_loaded(&mut inner)
    }

    /// The client id of the current identity, creating one if needed.
    pub fn client_id(&self) -> IdentityResult<ClientId> {
        Ok(self.get_or_create_identity()?.client_id().clone())
    }

    /// Destroy the persisted key pair; the next access generates a new one.
    pub fn reset(&self) -> IdentityResult<()> {
        let mut inner = self.lock();
        let old = inner.identity.take();
        inner.record = None;

        self.keychain.remove(IDENTITY_ENTRY)?;
        self.keychain.remove(WRAPPING_KEY_ENTRY)?;

        if let Some(old) = old {
            tracing::info!(client_id = %old.client_id(), "Identity reset");
        }
        Ok(())
    }

    /// Remember the active session for resumption.
    pub fn record_session(&self, topic: &Topic, expiry: u64) -> IdentityResult<()> {
        let mut inner = self.lock();
        self.ensure_loaded(&mut inner)?;
        if let Some(record) = inner.record.as_mut() {
            record.last_session_topic = Some(topic.to_string());
            record.last_session_expiry = Some(expiry);
        }
        self.persist(&inner)
    }

    /// Forget the remembered session.
    pub fn clear_session_record(&self) -> IdentityResult<()> {
        let mut inner = self.lock();
        self.ensure_loaded(&mut inner)?;
        let changed = match inner.record.as_mut() {
            Some(record) => {
                let had = record.last_session_topic.is_some() || record.last_session_expiry.is_some();
                record.last_session_topic = None;
                record.last_session_expiry = None;
                had
            }
            None => false,
        };
        if changed {
            self.persist(&inner)?;
        }
        Ok(())
    }

    /// The remembered session, if it has not expired at `now`.
    ///
    /// An expired record is cleared as a side effect.
    pub fn last_session(&self, now: u64) -> IdentityResult<Option<SessionRecord>> {
        let mut inner = self.lock();
        self.ensure_loaded(&mut inner)?;

        let (topic, expiry) = match inner.record.as_ref() {
            Some(IdentityRecord {
                last_session_topic: Some(topic),
                last_session_expiry: Some(expiry),
                ..
            }) => (topic.clone(), *expiry),
            _ => return Ok(None),
        };

        if expiry <= now {
            tracing::debug!(topic = %topic, expiry, "Clearing stale session record");
            if let Some(record) = inner.record.as_mut() {
                record.last_session_topic = None;
                record.last_session_expiry = None;
            }
            self.persist(&inner)?;
            return Ok(None);
        }

        Ok(Some(SessionRecord {
            topic: Topic::new(topic),
            expiry,
        }))
    }

    fn ensure_loaded(&self, inner: &mut Inner) -> IdentityResult<Arc<ClientIdentity>> {
        if let Some(identity) = &inner.identity {
            return Ok(identity.clone());
        }

        let (identity, record) = match self.keychain.find(IDENTITY_ENTRY)? {
            Some(json) => self.load(&json)?,
            None => self.create()?,
        };

        let identity = Arc::new(identity);
        inner.identity = Some(identity.clone());
        inner.record = Some(record);
        Ok(identity)
    }

    /// The wrapping key of an existing record. Never creates one: a record
    /// without its key cannot be unsealed by a fresh key either.
    fn existing_wrapping_key(&self) -> IdentityResult<SymKey> {
        let encoded = self
            .keychain
            .find(WRAPPING_KEY_ENTRY)?
            .ok_or_else(|| IdentityError::Corrupt("wrapping key is missing".into()))?;
        decode_wrapping_key(&encoded)
    }

    fn new_wrapping_key(&self) -> IdentityResult<SymKey> {
        let encoded = self
            .keychain
            .get_or_create_secret_key(WRAPPING_KEY_ENTRY)?;
        decode_wrapping_key(&encoded)
    }

    fn load(&self, json: &str) -> IdentityResult<(ClientIdentity, IdentityRecord)> {
        let record: IdentityRecord =
            serde_json::from_str(json).map_err(|e| IdentityError::Corrupt(e.to_string()))?;
        if record.identity_version != IDENTITY_VERSION {
            return Err(IdentityError::UnsupportedVersion(record.identity_version));
        }

        let sealed = decode_secret_key(&record.private_key_encrypted)?;
        let secret = Zeroizing::new(protocol::open(&self.existing_wrapping_key()?, &sealed)?);
        let secret: Zeroizing<[u8; 32]> = Zeroizing::new(
            secret
                .as_slice()
                .try_into()
                .map_err(|_| IdentityError::Corrupt("private key has wrong length".into()))?,
        );

        let identity = ClientIdentity::from_secret_key_bytes(&secret);
        if identity.public_key_hex() != record.public_key {
            return Err(IdentityError::Corrupt(
                "public key does not match private key".into(),
            ));
        }

        tracing::debug!(client_id = %identity.client_id(), "Loaded identity");
        Ok((identity, record))
    }

    fn create(&self) -> IdentityResult<(ClientIdentity, IdentityRecord)> {
        let identity = ClientIdentity::generate();
        let secret = Zeroizing::new(identity.secret_key_bytes());
        let sealed = protocol::seal(&self.new_wrapping_key()?, secret.as_slice())?;

        let record = IdentityRecord {
            identity_version: IDENTITY_VERSION,
            public_key: identity.public_key_hex(),
            private_key_encrypted: encode_secret_key(&sealed),
            last_session_topic: None,
            last_session_expiry: None,
        };
        self.write_record(&record)?;

        tracing::info!(client_id = %identity.client_id(), "Generated new identity");
        Ok((identity, record))
    }

    fn persist(&self, inner: &Inner) -> IdentityResult<()> {
        match &inner.record {
            Some(record) => self.write_record(record),
            None => Ok(()),
        }
    }

    fn write_record(&self, record: &IdentityRecord) -> IdentityResult<()> {
        let json = serde_json::to_string(record).map_err(|e| IdentityError::Corrupt(e.to_string()))?;
        self.keychain.set(IDENTITY_ENTRY, &json)?;
        Ok(())
    }
}

fn decode_wrapping_key(encoded: &str) -> IdentityResult<SymKey> {
    let bytes = Zeroizing::new(decode_secret_key(encoded)?);
    let arr: [u8; protocol::SYM_KEY_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::Corrupt("wrapping key has wrong length".into()))?;
    Ok(SymKey::from_bytes(arr))
}
